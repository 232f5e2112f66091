//! Error types for the reconciliation engine.

use thiserror::Error;

/// Result type for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur talking to the CMS or preparing a run.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transport-level failure (connect, timeout, TLS).
    #[error("network error: {0}")]
    Network(String),

    /// The CMS answered with an unexpected status.
    #[error("API request failed with status {status}: {message}")]
    Api { status: u16, message: String },

    /// 409 from the CMS.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Missing collection, locale or field. Fatal for a collection run.
    #[error("setup error: {0}")]
    Setup(String),

    /// The local dataset breaks an identity invariant.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid data: {0}")]
    Types(#[from] cmsync_types::Error),
}

impl SyncError {
    /// Returns true for a 409 conflict response.
    pub fn is_conflict(&self) -> bool {
        match self {
            SyncError::Conflict(_) => true,
            SyncError::Api { status, .. } => *status == 409,
            SyncError::Http(e) => e.status().is_some_and(|s| s.as_u16() == 409),
            _ => false,
        }
    }

    /// Returns true for a 404 response.
    pub fn is_not_found(&self) -> bool {
        match self {
            SyncError::NotFound(_) => true,
            SyncError::Api { status, .. } => *status == 404,
            SyncError::Http(e) => e.status().is_some_and(|s| s.as_u16() == 404),
            _ => false,
        }
    }

    /// Returns true if this error represents a 429 rate-limit response.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            SyncError::RateLimited { .. } => true,
            SyncError::Api { status, .. } => *status == 429,
            SyncError::Http(e) => e.status().is_some_and(|s| s.as_u16() == 429),
            _ => false,
        }
    }

    /// Returns the retry-after duration if this is a rate-limit error.
    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            SyncError::RateLimited { retry_after_secs } => {
                Some(std::time::Duration::from_secs(*retry_after_secs))
            }
            _ => None,
        }
    }
}
