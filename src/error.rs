use crate::ai::EmbedError;

#[derive(Debug, thiserror::Error)]
pub enum MnemonError {
    #[error("content must not be empty")]
    EmptyContent,

    #[error("content exceeds maximum length")]
    ContentTooLong,

    #[error("invalid expiry tier: {0} (expected core, permanent, or temporary)")]
    InvalidTier(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found")]
    NotFound,

    #[error("embedding provider error: {0}")]
    Embedding(#[from] EmbedError),

    #[error("judge backend error: {0}")]
    Judge(String),

    #[error("integrity hazard: {0}")]
    Integrity(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}
