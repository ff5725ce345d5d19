//! Unified error handling for the route-hub library.
//!
//! Only the document store and sync layers can fail. Import parsing
//! degrades to defaults and the query engine is total, so neither returns
//! errors.

use thiserror::Error;

/// Unified error type for route-hub operations.
#[derive(Debug, Clone, Error)]
pub enum CatalogError {
    /// The document store rejected or could not accept the operation
    #[error("Document store unavailable: {message}")]
    StoreUnavailable { message: String },
    /// HTTP/API error
    #[error("HTTP error{}: {message}", status_suffix(.status_code))]
    Http {
        message: String,
        status_code: Option<u16>,
    },
    /// Persistence/storage error
    #[error("Persistence error: {message}")]
    Persistence { message: String },
    /// A stored document did not have the expected shape
    #[error("Invalid document at '{path}': {message}")]
    InvalidDocument { path: String, message: String },
    /// Payload (de)serialization failed
    #[error("Serialization error: {message}")]
    Serialization { message: String },
    /// No async runtime or a background task failed
    #[error("Runtime error: {message}")]
    Runtime { message: String },
}

impl CatalogError {
    /// Whether retrying the same operation later could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            CatalogError::StoreUnavailable { .. } => true,
            CatalogError::Http { status_code, .. } => match status_code {
                None => true,
                Some(code) => *code == 429 || *code >= 500,
            },
            _ => false,
        }
    }
}

fn status_suffix(status_code: &Option<u16>) -> String {
    status_code.map(|c| format!(" ({})", c)).unwrap_or_default()
}

/// Result type alias for route-hub operations.
pub type Result<T> = std::result::Result<T, CatalogError>;

impl From<serde_json::Error> for CatalogError {
    fn from(err: serde_json::Error) -> Self {
        CatalogError::Serialization {
            message: err.to_string(),
        }
    }
}

#[cfg(feature = "persistence")]
impl From<rusqlite::Error> for CatalogError {
    fn from(err: rusqlite::Error) -> Self {
        CatalogError::Persistence {
            message: err.to_string(),
        }
    }
}

#[cfg(feature = "persistence")]
impl From<rmp_serde::encode::Error> for CatalogError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        CatalogError::Serialization {
            message: err.to_string(),
        }
    }
}

#[cfg(feature = "persistence")]
impl From<rmp_serde::decode::Error> for CatalogError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        CatalogError::Serialization {
            message: err.to_string(),
        }
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for CatalogError {
    fn from(err: reqwest::Error) -> Self {
        CatalogError::Http {
            status_code: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}
