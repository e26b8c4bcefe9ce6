use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid property path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("property not found: {0}")]
    PropertyNotFound(String),

    #[error("property kind mismatch at '{path}': expected {expected}, got {got}")]
    KindMismatch {
        path: String,
        expected: String,
        got: String,
    },
}
