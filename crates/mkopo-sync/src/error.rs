use mkopo_core::ValidationError;
use mkopo_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[cfg(feature = "http")]
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {body}")]
    Server { status: u16, body: String },

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("record store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

/// Errors surfaced by the annotation engine.
///
/// A failed remote write is never one of these; it is recovered by holding
/// the annotation locally.
#[derive(Error, Debug)]
pub enum AnnotationError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("local cache error: {0}")]
    Cache(#[from] StoreError),

    #[error("background write task failed: {0}")]
    Task(String),
}
