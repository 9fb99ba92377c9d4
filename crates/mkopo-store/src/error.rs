use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache entry is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid cache key: {0:?}")]
    InvalidKey(String),

    #[error("{0}")]
    Other(String),
}
