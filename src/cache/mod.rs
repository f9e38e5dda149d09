//! Request cache gateway (EMBP).
//!
//! - `transport`: the network seam ([`Transport`]) and its `reqwest` implementation
//! - `request_cache`: deduplicating TTL cache with retries and write invalidation

mod request_cache;
mod transport;

pub use request_cache::{
    CacheConfig, MutateOptions, Payload, QueryOptions, RequestCache, RetryPolicy,
};
pub use transport::{HttpTransport, Transport};
