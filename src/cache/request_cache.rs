//! Async GET cache and mutation dispatcher.
//!
//! Each key maps to at most one [`CacheEntry`]. A read registers its
//! `Pending` entry under the map lock before the network call starts, so
//! concurrent callers for the same key join the one in-flight read instead of
//! issuing their own. Success turns the entry `Resolved` until its TTL runs
//! out; failure removes it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::Transport;
use crate::FetchError;

// ---

/// Shared, immutable response body.
pub type Payload = Arc<Value>;

type SharedRead = Shared<BoxFuture<'static, Result<Payload, FetchError>>>;

/// Expiry used when `now + ttl` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Exponential backoff: `base_delay * 2^attempt`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    // ---
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(1500),
        }
    }
}

impl RetryPolicy {
    // ---
    pub fn delay(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(Duration::MAX)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    // ---
    /// Freshness of a resolved read.
    pub ttl: Duration,
    pub retry: RetryPolicy,
    /// Pending entries older than this are considered abandoned by the sweep.
    pub stale_pending: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            stale_pending: Duration::from_secs(300),
        }
    }
}

/// Per-call overrides for [`RequestCache::query_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QueryOptions {
    pub ttl: Option<Duration>,
    pub retries: Option<u32>,
}

/// Per-call options for [`RequestCache::mutate_with`]. Writes are not retried
/// unless asked to.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MutateOptions {
    pub retries: u32,
}

enum CacheEntry {
    // ---
    Pending {
        id: u64,
        started: Instant,
        read: SharedRead,
    },
    Resolved {
        data: Payload,
        resolved_at: Instant,
        expires_at: Instant,
    },
}

struct Inner {
    // ---
    transport: Arc<dyn Transport>,
    config: CacheConfig,
    entries: Mutex<HashMap<String, CacheEntry>>,
    next_id: AtomicU64,
}

/// Cheap-to-clone handle to one shared cache.
#[derive(Clone)]
pub struct RequestCache {
    inner: Arc<Inner>,
}

impl RequestCache {
    // ---
    pub fn new(transport: Arc<dyn Transport>, config: CacheConfig) -> Self {
        // ---
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                entries: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub async fn query(&self, key: &str) -> Result<Payload, FetchError> {
        self.query_with(key, QueryOptions::default()).await
    }

    /// Read `key` through the cache.
    ///
    /// Joins an in-flight read for the same key, returns a fresh resolved
    /// payload without network access, or starts a new read with retries.
    pub async fn query_with(&self, key: &str, opts: QueryOptions) -> Result<Payload, FetchError> {
        // ---
        let read = {
            let mut entries = self.inner.lock();
            let now = Instant::now();

            match entries.get(key) {
                Some(CacheEntry::Pending { read, .. }) => {
                    debug!(key, "joining in-flight read");
                    read.clone()
                }
                Some(CacheEntry::Resolved {
                    data, expires_at, ..
                }) if now < *expires_at => {
                    debug!(key, "cache hit");
                    return Ok(Arc::clone(data));
                }
                _ => {
                    debug!(key, "cache miss");
                    let (id, read) = self.start_read(key, opts);
                    entries.insert(
                        key.to_string(),
                        CacheEntry::Pending {
                            id,
                            started: now,
                            read: read.clone(),
                        },
                    );
                    read
                }
            }
        };
        read.await
    }

    /// Spawn the read so it completes (and lands in the cache) even if every
    /// caller stops waiting. Called with the map lock held.
    fn start_read(&self, key: &str, opts: QueryOptions) -> (u64, SharedRead) {
        // ---
        let inner = Arc::clone(&self.inner);
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let ttl = opts.ttl.unwrap_or(inner.config.ttl);
        let policy = RetryPolicy {
            max_retries: opts.retries.unwrap_or(inner.config.retry.max_retries),
            ..inner.config.retry
        };
        let key = key.to_string();
        let owner = Arc::clone(&inner);
        let owner_key = key.clone();

        let task: JoinHandle<Result<Payload, FetchError>> = tokio::spawn(async move {
            let transport = Arc::clone(&inner.transport);
            let result = with_retry(&key, policy, || transport.get(&key)).await;
            inner.settle(&key, id, &result, ttl);
            result
        });

        // A task that died without settling must not leave its entry pending.
        let read = async move {
            task.await.unwrap_or_else(|e| {
                let failed: Result<Payload, FetchError> =
                    Err(FetchError::Transient(format!("read task failed: {e}")));
                owner.settle(&owner_key, id, &failed, Duration::ZERO);
                failed
            })
        }
        .boxed()
        .shared();

        (id, read)
    }

    pub async fn mutate(
        &self,
        key: &str,
        body: &Value,
        invalidate: &[&str],
    ) -> Result<Payload, FetchError> {
        self.mutate_with(key, body, invalidate, MutateOptions::default())
            .await
    }

    /// PUT `body` to `key`. On success every cached entry whose key contains
    /// one of the `invalidate` patterns is dropped.
    pub async fn mutate_with(
        &self,
        key: &str,
        body: &Value,
        invalidate: &[&str],
        opts: MutateOptions,
    ) -> Result<Payload, FetchError> {
        // ---
        let policy = RetryPolicy {
            max_retries: opts.retries,
            ..self.inner.config.retry
        };
        let transport = Arc::clone(&self.inner.transport);
        let payload = with_retry(key, policy, || transport.put(key, body)).await?;

        let removed = self.invalidate(invalidate);
        debug!(key, removed, "mutation succeeded, cache invalidated");
        Ok(payload)
    }

    /// Remove every entry whose key contains any of `patterns`. Returns the
    /// number of entries removed.
    pub fn invalidate(&self, patterns: &[&str]) -> usize {
        // ---
        if patterns.is_empty() {
            return 0;
        }
        let mut entries = self.inner.lock();
        let before = entries.len();
        entries.retain(|key, _| !patterns.iter().any(|p| key.contains(p)));
        before - entries.len()
    }

    /// Drop expired resolved entries and pending entries older than the
    /// stale-pending ceiling. Returns the number of entries removed.
    pub fn clean_cache(&self) -> usize {
        // ---
        let now = Instant::now();
        let stale_pending = self.inner.config.stale_pending;
        let mut entries = self.inner.lock();
        let before = entries.len();

        entries.retain(|key, entry| match entry {
            CacheEntry::Resolved { expires_at, .. } => now < *expires_at,
            CacheEntry::Pending { started, .. } => {
                let alive = now.duration_since(*started) < stale_pending;
                if !alive {
                    warn!(key = key.as_str(), "dropping abandoned pending read");
                }
                alive
            }
        });
        before - entries.len()
    }

    /// Run [`RequestCache::clean_cache`] every `period` until `shutdown` fires.
    pub fn spawn_sweeper(&self, period: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        // ---
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = cache.clean_cache();
                        if removed > 0 {
                            debug!(removed, "cache sweep");
                        }
                    }
                }
            }
            debug!("cache sweeper stopped");
        })
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when `key` holds a pending read or a resolved, unexpired payload.
    pub fn contains(&self, key: &str) -> bool {
        // ---
        let now = Instant::now();
        match self.inner.lock().get(key) {
            Some(CacheEntry::Pending { .. }) => true,
            Some(CacheEntry::Resolved { expires_at, .. }) => now < *expires_at,
            None => false,
        }
    }

    /// Age of the resolved payload for `key`, if any.
    pub fn age(&self, key: &str) -> Option<Duration> {
        // ---
        match self.inner.lock().get(key) {
            Some(CacheEntry::Resolved { resolved_at, .. }) => Some(resolved_at.elapsed()),
            _ => None,
        }
    }
}

impl Inner {
    // ---
    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the outcome of read `id`, unless its entry was invalidated or
    /// replaced meanwhile.
    fn settle(&self, key: &str, id: u64, result: &Result<Payload, FetchError>, ttl: Duration) {
        // ---
        let mut entries = self.lock();
        let ours = matches!(entries.get(key), Some(CacheEntry::Pending { id: pending, .. }) if *pending == id);
        if !ours {
            debug!(key, "entry invalidated while in flight, result not cached");
            return;
        }

        match result {
            Ok(data) => {
                let now = Instant::now();
                let expires_at = now
                    .checked_add(ttl)
                    .or_else(|| now.checked_add(FAR_FUTURE))
                    .unwrap_or(now);
                entries.insert(
                    key.to_string(),
                    CacheEntry::Resolved {
                        data: Arc::clone(data),
                        resolved_at: now,
                        expires_at,
                    },
                );
            }
            Err(e) => {
                debug!(key, error = %e, "read failed, entry removed");
                entries.remove(key);
            }
        }
    }
}

/// Run `op` until it succeeds, fails terminally, or exhausts the policy.
/// A payload reporting `success: false` is a terminal application error.
async fn with_retry<F, Fut>(key: &str, policy: RetryPolicy, mut op: F) -> Result<Payload, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Value, FetchError>>,
{
    // ---
    let mut attempt = 0;
    loop {
        match op().await.and_then(check_success) {
            Ok(value) => return Ok(Arc::new(value)),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.delay(attempt);
                attempt += 1;
                warn!(key, attempt, ?delay, error = %e, "request failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn check_success(value: Value) -> Result<Value, FetchError> {
    // ---
    if value.get("success").and_then(Value::as_bool) == Some(false) {
        let message = value
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("request reported failure");
        return Err(FetchError::Application(message.to_string()));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use tokio_test::{assert_pending, assert_ready_ok};

    const KEY: &str = "/query/station/Raw/temperature:outTemp?startDate=a&endDate=b";

    /// Serves scripted responses in order, then a default success.
    #[derive(Default)]
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<Value, FetchError>>>,
        gets: Mutex<Vec<String>>,
        puts: Mutex<Vec<String>>,
        delay: Duration,
    }

    impl ScriptedTransport {
        fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Default::default()
            }
        }

        fn push(&self, result: Result<Value, FetchError>) {
            self.script.lock().unwrap().push_back(result);
        }

        fn get_count(&self) -> usize {
            self.gets.lock().unwrap().len()
        }

        fn next(&self) -> Result<Value, FetchError> {
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(json!({"success": true, "data": []})))
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn get(&self, url: &str) -> Result<Value, FetchError> {
            self.gets.lock().unwrap().push(url.to_string());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.next()
        }

        async fn put(&self, url: &str, _body: &Value) -> Result<Value, FetchError> {
            self.puts.lock().unwrap().push(url.to_string());
            self.next()
        }
    }

    fn cache_with(transport: Arc<ScriptedTransport>) -> RequestCache {
        RequestCache::new(transport, CacheConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_queries_share_one_read() {
        // ---
        let transport = Arc::new(ScriptedTransport::with_delay(Duration::from_millis(100)));
        let cache = cache_with(Arc::clone(&transport));

        let results = futures::future::join_all((0..8).map(|_| cache.query(KEY))).await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(transport.get_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_entry_is_served_immediately() {
        // ---
        let transport = Arc::new(ScriptedTransport::default());
        let cache = cache_with(Arc::clone(&transport));
        cache.query(KEY).await.unwrap();

        let mut second = tokio_test::task::spawn(cache.query(KEY));
        assert_ready_ok!(second.poll());
        assert_eq!(transport.get_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_triggers_fresh_read() {
        // ---
        let transport = Arc::new(ScriptedTransport::default());
        let cache = cache_with(Arc::clone(&transport));
        let opts = QueryOptions {
            ttl: Some(Duration::from_secs(10)),
            retries: None,
        };

        cache.query_with(KEY, opts).await.unwrap();
        tokio::time::advance(Duration::from_secs(9)).await;
        cache.query_with(KEY, opts).await.unwrap();
        assert_eq!(transport.get_count(), 1);
        assert!(cache.age(KEY) >= Some(Duration::from_secs(9)));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!cache.contains(KEY));
        cache.query_with(KEY, opts).await.unwrap();
        assert_eq!(transport.get_count(), 2);
    }

    #[tokio::test]
    async fn test_huge_ttl_resolves_and_stays_cached() {
        // ---
        let transport = Arc::new(ScriptedTransport::default());
        let cache = cache_with(Arc::clone(&transport));
        let opts = QueryOptions {
            ttl: Some(Duration::from_secs(u64::MAX)),
            retries: None,
        };

        cache.query_with(KEY, opts).await.unwrap();
        cache.query_with(KEY, opts).await.unwrap();

        assert_eq!(transport.get_count(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(KEY));
        assert_eq!(cache.clean_cache(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_retry_with_backoff() {
        // ---
        let transport = Arc::new(ScriptedTransport::default());
        for _ in 0..3 {
            transport.push(Err(FetchError::Transient("connection reset".into())));
        }
        let cache = cache_with(Arc::clone(&transport));

        let started = Instant::now();
        let err = cache.query(KEY).await.unwrap_err();

        assert!(matches!(err, FetchError::Transient(_)));
        // one attempt plus the configured two retries
        assert_eq!(transport.get_count(), 3);
        // 1.5s + 3s of backoff
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(4500) && waited < Duration::from_millis(4600), "{waited:?}");
        assert!(!cache.contains(KEY));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_and_caches() {
        // ---
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(Err(FetchError::Transient("503".into())));
        transport.push(Ok(json!({"success": true, "data": [1]})));
        let cache = cache_with(Arc::clone(&transport));

        let payload = cache.query(KEY).await.unwrap();
        assert_eq!(payload["data"][0], 1);
        assert_eq!(transport.get_count(), 2);
        assert!(cache.contains(KEY));
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_is_not_retried() {
        // ---
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(Err(FetchError::Client {
            status: 404,
            message: "Not Found".into(),
        }));
        let cache = cache_with(Arc::clone(&transport));

        let err = cache.query(KEY).await.unwrap_err();
        assert!(matches!(err, FetchError::Client { status: 404, .. }));
        assert_eq!(transport.get_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_false_is_terminal_application_error() {
        // ---
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(Ok(json!({"success": false, "error": "unknown sensor"})));
        let cache = cache_with(Arc::clone(&transport));

        let err = cache.query(KEY).await.unwrap_err();
        assert_eq!(err, FetchError::Application("unknown sensor".into()));
        assert_eq!(transport.get_count(), 1);
        assert!(cache.is_empty());

        // the failed entry is gone, so the next query reads again
        cache.query(KEY).await.unwrap();
        assert_eq!(transport.get_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutate_invalidates_matching_keys_only() {
        // ---
        let transport = Arc::new(ScriptedTransport::default());
        let cache = cache_with(Arc::clone(&transport));
        let keys = [
            "/api/composite-probes",
            "/query/station/Raw/temperature:outTemp",
            "/query/station/Raw/humidity:outHumidity",
        ];
        for key in keys {
            cache.query(key).await.unwrap();
        }

        cache
            .mutate("/api/composite-probes", &json!({"settings": {}}), &["composite-probes"])
            .await
            .unwrap();

        assert!(!cache.contains(keys[0]));
        assert!(cache.contains(keys[1]));
        assert!(cache.contains(keys[2]));
        assert_eq!(transport.puts.lock().unwrap().len(), 1);

        assert_eq!(cache.invalidate(&["outTemp"]), 1);
        assert!(!cache.contains(keys[1]));
        assert!(cache.contains(keys[2]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_mutation_keeps_cache_and_is_not_retried() {
        // ---
        let transport = Arc::new(ScriptedTransport::default());
        let cache = cache_with(Arc::clone(&transport));
        cache.query("/api/composite-probes").await.unwrap();

        transport.push(Err(FetchError::Transient("timeout".into())));
        let err = cache
            .mutate("/api/composite-probes", &json!({}), &["composite-probes"])
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(transport.puts.lock().unwrap().len(), 1);
        assert!(cache.contains("/api/composite-probes"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidated_pending_read_is_not_cached() {
        // ---
        let transport = Arc::new(ScriptedTransport::with_delay(Duration::from_secs(1)));
        let cache = cache_with(Arc::clone(&transport));

        let mut read = tokio_test::task::spawn(cache.query(KEY));
        assert_pending!(read.poll());
        assert_eq!(cache.invalidate(&[KEY]), 1);

        let payload = read.await.unwrap();
        assert_eq!(payload["success"], true);
        assert!(!cache.contains(KEY));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_cache_drops_expired_and_abandoned_entries() {
        // ---
        let transport = Arc::new(ScriptedTransport::with_delay(Duration::from_secs(3600)));
        let cache = RequestCache::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            CacheConfig {
                ttl: Duration::from_secs(30),
                ..CacheConfig::default()
            },
        );

        let mut stuck = tokio_test::task::spawn(cache.query("/stuck"));
        assert_pending!(stuck.poll());
        assert_eq!(cache.len(), 1);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(cache.clean_cache(), 0);

        tokio::time::advance(Duration::from_secs(240)).await;
        assert_eq!(cache.clean_cache(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_stops_on_cancel() {
        // ---
        let transport = Arc::new(ScriptedTransport::default());
        let cache = RequestCache::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            CacheConfig {
                ttl: Duration::from_secs(5),
                ..CacheConfig::default()
            },
        );
        cache.query(KEY).await.unwrap();

        let token = CancellationToken::new();
        let sweeper = cache.spawn_sweeper(Duration::from_secs(10), token.clone());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(cache.len(), 0);

        token.cancel();
        sweeper.await.unwrap();
    }

    #[test]
    fn test_backoff_doubles() {
        // ---
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(1500));
        assert_eq!(policy.delay(1), Duration::from_millis(3000));
        assert_eq!(policy.delay(2), Duration::from_millis(6000));
        assert_eq!(policy.delay(40), Duration::MAX);
    }
}
