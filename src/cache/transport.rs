//! Network seam for the request cache.
//!
//! The cache only needs "GET this URL as JSON" and "PUT this JSON", with
//! failures already classified into retryable and terminal kinds.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;

use crate::FetchError;

// ---

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    // ---
    async fn get(&self, url: &str) -> Result<Value, FetchError>;

    async fn put(&self, url: &str, body: &Value) -> Result<Value, FetchError>;
}

/// [`Transport`] over a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    // ---
    pub fn new(timeout: Duration) -> Result<Self> {
        // ---
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    // ---
    async fn get(&self, url: &str) -> Result<Value, FetchError> {
        tracing::debug!("GET {}", url);
        read_json(self.client.get(url).send().await).await
    }

    async fn put(&self, url: &str, body: &Value) -> Result<Value, FetchError> {
        tracing::debug!("PUT {}", url);
        read_json(self.client.put(url).json(body).send().await).await
    }
}

async fn read_json(sent: reqwest::Result<Response>) -> Result<Value, FetchError> {
    // ---
    let response = sent.map_err(classify)?;
    let status = response.status();

    if status.is_client_error() {
        let body = response.text().await.unwrap_or_default();
        return Err(client_error(status, &body));
    }
    if status.is_server_error() {
        return Err(FetchError::Transient(format!("HTTP {}", status)));
    }

    response.json::<Value>().await.map_err(|e| {
        if e.is_decode() {
            FetchError::Decode(e.to_string())
        } else {
            classify(e)
        }
    })
}

fn client_error(status: StatusCode, body: &str) -> FetchError {
    // ---
    // Prefer the backend's own `error` field when it sent one.
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(String::from))
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("client error")
                .to_string()
        });
    FetchError::Client {
        status: status.as_u16(),
        message,
    }
}

fn classify(e: reqwest::Error) -> FetchError {
    // ---
    match e.status() {
        Some(status) if status.is_client_error() => client_error(status, ""),
        _ => FetchError::Transient(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_client_error_prefers_backend_message() {
        // ---
        let err = client_error(StatusCode::NOT_FOUND, r#"{"success":false,"error":"unknown sensor"}"#);
        assert_eq!(
            err,
            FetchError::Client {
                status: 404,
                message: "unknown sensor".into()
            }
        );

        let err = client_error(StatusCode::BAD_REQUEST, "<html>");
        assert_eq!(
            err,
            FetchError::Client {
                status: 400,
                message: "Bad Request".into()
            }
        );
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transient() {
        // ---
        let transport = HttpTransport::new(Duration::from_millis(500)).unwrap();
        let err = transport.get("http://127.0.0.1:9/nothing").await.unwrap_err();
        assert!(err.is_retryable(), "{err:?}");
    }
}
