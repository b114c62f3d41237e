//! Error types for the core record and naming modules.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// A stage file name did not carry the expected offset/time fields.
    #[error("Malformed stage file name: {0}")]
    MalformedFileName(String),

    /// Record content could not be serialized for staging.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}
