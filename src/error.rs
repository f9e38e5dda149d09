//! Error taxonomy for the derived-metric pipeline.
//!
//! Each stage gets its own enum so callers can tell "no data in range" from
//! "fetch failed" from "formula error" without string matching.

use thiserror::Error;

// ---

/// Failure of a single backend read or write.
///
/// Cloneable because one in-flight read is shared by every caller that asked
/// for the same key while it was pending.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    // ---
    /// Connection failure, timeout or 5xx response. Retried.
    #[error("transient network error: {0}")]
    Transient(String),

    /// 4xx response. Never retried.
    #[error("client request error (HTTP {status}): {message}")]
    Client { status: u16, message: String },

    /// The backend answered `success: false`. Never retried.
    #[error("application error: {0}")]
    Application(String),

    /// The payload is not in the expected shape.
    #[error("invalid payload: {0}")]
    Decode(String),
}

impl FetchError {
    // ---
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

/// Formula compilation and evaluation errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FormulaError {
    // ---
    /// Source rejected by the formula grammar. Surfaced when a definition is saved.
    #[error("formula parse error at {position}: {message}")]
    Parse { position: usize, message: String },

    /// Evaluation failed for one input. Recovered by dropping the point.
    #[error("formula runtime error: {0}")]
    Runtime(String),
}

impl FormulaError {
    // ---
    pub(crate) fn parse(position: usize, message: impl Into<String>) -> Self {
        FormulaError::Parse {
            position,
            message: message.into(),
        }
    }

    pub(crate) fn runtime(message: impl Into<String>) -> Self {
        FormulaError::Runtime(message.into())
    }
}

/// Failure building a derived series.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BuildError {
    // ---
    #[error("derived sensor not found: {0}")]
    NotFound(String),

    #[error("failed to fetch '{key}': {source}")]
    Fetch {
        key: String,
        #[source]
        source: FetchError,
    },

    /// A required raw series came back empty.
    #[error("no data for dependency '{0}' in the requested window")]
    MissingDependencyData(String),

    /// The stored formula no longer compiles.
    #[error(transparent)]
    Formula(#[from] FormulaError),

    #[error("build cancelled")]
    Cancelled,
}

/// Failure loading, editing or saving a derived-sensor catalog.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CatalogError {
    // ---
    #[error(transparent)]
    Formula(#[from] FormulaError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("derived sensor not found: {0}")]
    NotFound(String),
}

impl From<CatalogError> for BuildError {
    // ---
    fn from(e: CatalogError) -> Self {
        match e {
            CatalogError::Formula(e) => BuildError::Formula(e),
            CatalogError::Fetch(source) => BuildError::Fetch {
                key: "catalog".to_string(),
                source,
            },
            CatalogError::NotFound(key) => BuildError::NotFound(key),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_only_transient_errors_are_retryable() {
        // ---
        assert!(FetchError::Transient("reset".into()).is_retryable());
        assert!(!FetchError::Client {
            status: 404,
            message: "not found".into()
        }
        .is_retryable());
        assert!(!FetchError::Application("bad sensor".into()).is_retryable());
        assert!(!FetchError::Decode("not json".into()).is_retryable());
    }

    #[test]
    fn test_fetch_error_is_source_of_build_error() {
        // ---
        use std::error::Error as _;

        let err = BuildError::Fetch {
            key: "temperature:outTemp".into(),
            source: FetchError::Transient("timeout".into()),
        };
        assert!(err.to_string().contains("temperature:outTemp"));
        assert!(err.source().is_some());
    }
}
