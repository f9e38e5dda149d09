//! In-memory storage backend for unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::backend::Endpoints;
use crate::cache::{CacheConfig, RequestCache, Transport};
use crate::catalog::{CatalogKind, DerivedSensorDefinition};
use crate::FetchError;

// ---

pub(crate) const BASE_URL: &str = "http://backend";
pub(crate) const STATION: &str = "st1";

/// Serves raw series, forecast rows and both catalogs from memory. Windows
/// are ignored: a series is returned whole.
#[derive(Default)]
pub(crate) struct MemoryBackend {
    // ---
    series: Mutex<HashMap<String, Vec<(DateTime<Utc>, Option<f64>)>>>,
    forecast: Mutex<Vec<Value>>,
    catalogs: Mutex<HashMap<String, Value>>,
    failures: Mutex<HashMap<String, FetchError>>,
    gets: Mutex<Vec<String>>,
    puts: Mutex<Vec<String>>,
}

impl MemoryBackend {
    // ---
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn endpoints() -> Endpoints {
        Endpoints::new(BASE_URL, STATION)
    }

    pub(crate) fn cache(self: &Arc<Self>) -> RequestCache {
        RequestCache::new(Arc::clone(self) as Arc<dyn Transport>, CacheConfig::default())
    }

    pub(crate) fn add_series(&self, key: &str, points: Vec<(DateTime<Utc>, Option<f64>)>) {
        self.series.lock().unwrap().insert(key.to_string(), points);
    }

    pub(crate) fn set_forecast(&self, rows: Vec<Value>) {
        *self.forecast.lock().unwrap() = rows;
    }

    pub(crate) fn add_definition(&self, kind: CatalogKind, def: &DerivedSensorDefinition) {
        let mut catalogs = self.catalogs.lock().unwrap();
        let settings = catalogs
            .entry(kind.path().to_string())
            .or_insert_with(|| json!({}));
        settings[def.key.as_str()] = serde_json::to_value(def).unwrap();
    }

    /// Make reads of `key` (a sensor key, or `Forecast`) fail with `err`.
    pub(crate) fn fail(&self, key: &str, err: FetchError) {
        self.failures.lock().unwrap().insert(key.to_string(), err);
    }

    pub(crate) fn get_count(&self, needle: &str) -> usize {
        self.gets
            .lock()
            .unwrap()
            .iter()
            .filter(|url| url.contains(needle))
            .count()
    }

    pub(crate) fn put_count(&self) -> usize {
        self.puts.lock().unwrap().len()
    }

    fn failure(&self, key: &str) -> Result<(), FetchError> {
        match self.failures.lock().unwrap().get(key) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

fn path_of(url: &str) -> &str {
    let path = url.strip_prefix(BASE_URL).unwrap_or(url);
    path.split_once('?').map_or(path, |(p, _)| p)
}

#[async_trait]
impl Transport for MemoryBackend {
    // ---
    async fn get(&self, url: &str) -> Result<Value, FetchError> {
        // ---
        self.gets.lock().unwrap().push(url.to_string());
        let path = path_of(url);

        if path.starts_with("/api/") {
            let settings = self.catalogs.lock().unwrap().get(path).cloned();
            return Ok(json!({"success": true, "settings": settings.unwrap_or_else(|| json!({}))}));
        }

        let parts: Vec<&str> = path.trim_start_matches('/').splitn(4, '/').collect();
        match parts.as_slice() {
            ["query", STATION, "Raw", key] => {
                self.failure(key)?;
                let points = self.series.lock().unwrap().get(*key).cloned().unwrap_or_default();
                let data: Vec<Value> = points.iter().map(|(d, v)| json!({"d": d, "v": v})).collect();
                Ok(json!({"success": true, "data": data, "metadata": {"sensor": key}}))
            }
            ["query", STATION, "Forecast", _] => {
                self.failure("Forecast")?;
                Ok(json!({"success": true, "data": self.forecast.lock().unwrap().clone()}))
            }
            _ => Err(FetchError::Client {
                status: 404,
                message: format!("no route for {path}"),
            }),
        }
    }

    async fn put(&self, url: &str, body: &Value) -> Result<Value, FetchError> {
        // ---
        self.puts.lock().unwrap().push(url.to_string());
        let path = path_of(url).to_string();
        self.catalogs
            .lock()
            .unwrap()
            .insert(path, body.get("settings").cloned().unwrap_or_else(|| json!({})));
        Ok(json!({"success": true}))
    }
}
