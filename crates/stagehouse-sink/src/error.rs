//! Error types for the sink pipeline.
//!
//! One unified error enum covers the whole pipeline. Variants split along the
//! recovery policy: configuration faults carry a fatal error code and abort
//! startup, stage and ingestion faults are either retried by the cleaner loop
//! or escalated to the framework depending on where they surface.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SinkError>;

/// Errors that can occur during sink operations.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The connection service is missing or already closed (error 5010).
    #[error("Connection is closed or was never established (error 5010)")]
    NoConnection,

    /// An existing table does not match the expected shape (error 5003).
    #[error("Incompatible existing table {table} (error 5003)")]
    IncompatibleTable { table: String },

    /// An existing stage does not match the expected shape (error 5004).
    #[error("Incompatible existing stage {stage} (error 5004)")]
    IncompatibleStage { stage: String },

    /// An existing pipe does not match the expected shape (error 5005).
    #[error("Incompatible existing pipe {pipe} (error 5005)")]
    IncompatiblePipe { pipe: String },

    /// A stage operation (list, put, purge, move) failed.
    #[error("Stage operation failed: {0}")]
    Stage(String),

    /// An ingestion service call failed.
    #[error("Ingestion error: {0}")]
    Ingest(String),

    /// Record content could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A stage file name did not decode.
    #[error("File name error: {0}")]
    FileName(String),
}

impl SinkError {
    /// Fatal error code surfaced to the framework, when this error carries
    /// one.
    pub fn error_code(&self) -> Option<u32> {
        match self {
            SinkError::IncompatibleTable { .. } => Some(5003),
            SinkError::IncompatibleStage { .. } => Some(5004),
            SinkError::IncompatiblePipe { .. } => Some(5005),
            SinkError::NoConnection => Some(5010),
            _ => None,
        }
    }
}

impl From<stagehouse_core::CoreError> for SinkError {
    fn from(e: stagehouse_core::CoreError) -> Self {
        match e {
            stagehouse_core::CoreError::MalformedFileName(name) => SinkError::FileName(name),
            stagehouse_core::CoreError::Serialization(msg) => SinkError::Serialization(msg),
        }
    }
}

impl From<object_store::Error> for SinkError {
    fn from(e: object_store::Error) -> Self {
        SinkError::Stage(e.to_string())
    }
}
