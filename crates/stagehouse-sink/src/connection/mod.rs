//! External service contracts.
//!
//! The sink consumes two remote capabilities: the connection service, which
//! executes DDL and stage object operations against the warehouse, and the
//! ingestion service, which triggers asynchronous loading of staged files
//! and answers status queries about them. Both are async traits so the sink
//! can run against the real warehouse client or the in-memory backend in
//! [`memory`].

pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::telemetry::TelemetryService;

pub use memory::{InMemoryConnection, InMemoryIngestion};

/// Ingestion outcome of one staged file.
///
/// `Loaded`, `Failed` and `PartiallyLoaded` are terminal. Everything else
/// leaves the file under reconciliation for the next cleaner cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStatus {
    Loaded,
    Failed,
    PartiallyLoaded,
    NotFound,
    LoadInProgress,
}

impl IngestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IngestStatus::Loaded | IngestStatus::Failed | IngestStatus::PartiallyLoaded
        )
    }
}

/// Warehouse connection: DDL checks and stage object operations.
#[async_trait]
pub trait ConnectionService: Send + Sync {
    fn connector_name(&self) -> &str;
    fn is_closed(&self) -> bool;

    async fn table_exist(&self, table_name: &str) -> Result<bool>;
    async fn stage_exist(&self, stage_name: &str) -> Result<bool>;
    async fn pipe_exist(&self, pipe_name: &str) -> Result<bool>;

    async fn is_table_compatible(&self, table_name: &str) -> Result<bool>;
    async fn is_stage_compatible(&self, stage_name: &str) -> Result<bool>;
    async fn is_pipe_compatible(
        &self,
        table_name: &str,
        stage_name: &str,
        pipe_name: &str,
    ) -> Result<bool>;

    async fn create_table(&self, table_name: &str) -> Result<()>;
    async fn create_stage(&self, stage_name: &str) -> Result<()>;
    async fn create_pipe(&self, table_name: &str, stage_name: &str, pipe_name: &str) -> Result<()>;

    /// List file names on a stage under a prefix.
    async fn list_stage(&self, stage_name: &str, prefix: &str) -> Result<Vec<String>>;

    /// Upload file content to a stage. Overwriting an identical name with
    /// identical content must be safe.
    async fn put_with_cache(&self, stage_name: &str, file_name: &str, content: &str) -> Result<()>;

    /// Write raw bytes to the table stage (quarantine area).
    async fn put_to_table_stage(
        &self,
        table_name: &str,
        file_name: &str,
        content: Bytes,
    ) -> Result<()>;

    /// Delete files from a stage.
    async fn purge_stage(&self, stage_name: &str, files: &[String]) -> Result<()>;

    /// Relocate files from a stage to the table stage.
    async fn move_to_table_stage(
        &self,
        table_name: &str,
        stage_name: &str,
        files: &[String],
    ) -> Result<()>;

    /// Build the ingestion service bound to a stage and pipe.
    fn build_ingest_service(&self, stage_name: &str, pipe_name: &str)
        -> Arc<dyn IngestionService>;

    fn telemetry_client(&self) -> Arc<dyn TelemetryService>;
}

/// Asynchronous ingestion: trigger loads, observe outcomes.
#[async_trait]
pub trait IngestionService: Send + Sync {
    /// Trigger ingestion of the given files. The implementation retries with
    /// its own backoff and fails only after exhaustion.
    async fn ingest_files(&self, files: Vec<String>) -> Result<()>;

    /// Per-file status from the short-retention, low-latency report endpoint.
    /// Files the endpoint no longer knows about are absent from the result.
    async fn read_ingest_report(&self, files: &[String]) -> Result<HashMap<String, IngestStatus>>;

    /// Per-file status from the long-window history endpoint, scanning back
    /// to `since_millis`.
    async fn read_one_hour_history(
        &self,
        files: &[String],
        since_millis: i64,
    ) -> Result<HashMap<String, IngestStatus>>;

    fn close(&self);
}
