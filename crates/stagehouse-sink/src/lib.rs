//! Stagehouse sink: the per-partition pipeline of a streaming connector.
//!
//! For every assigned (topic, partition) the sink buffers records, flushes
//! them as immutable offset-named files to a remote internal stage, triggers
//! asynchronous ingestion into the target table, and reconciles file
//! outcomes: loaded files are purged, failed and over-age files are
//! quarantined on the table stage, and the committable offset never advances
//! past data safely persisted to the stage.
//!
//! ## Architecture
//!
//! - **[`service::SinkService`]**: registry of per-partition pipelines,
//!   driven by the connector framework (open → insert → commit → close).
//! - **[`service::ServiceContext`]**: the per-partition state machine wiring
//!   buffer, flusher, recovery, cleaner and offset gate together.
//! - **[`buffer::PartitionBuffer`]**: the size/count-accounted accumulator.
//! - **[`connection`]**: async contracts for the warehouse connection and
//!   the ingestion service, plus an in-memory backend for tests and local
//!   development.
//! - **[`telemetry`]**: per-pipe counters behind a capability interface.
//!
//! All durable state lives at the remote stage, encoded in file names
//! (start offset, end offset, ingest time); restart recovery works from the
//! stage listing alone.

pub mod buffer;
pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod service;
pub mod telemetry;

// Re-export key types at crate root for convenience.
pub use buffer::PartitionBuffer;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BehaviorOnNullValues, SinkConfig};
pub use connection::{
    ConnectionService, InMemoryConnection, InMemoryIngestion, IngestStatus, IngestionService,
};
pub use error::{Result, SinkError};
pub use service::{ServiceContext, SinkService};
pub use telemetry::{
    LoggingTelemetry, PipeCreation, PipeStatus, TelemetryService,
};

// Re-export the record model from stagehouse-core.
pub use stagehouse_core::{
    JsonRecordSerializer, MetadataConfig, RecordContent, RecordSerializer, RecordValue, SinkRecord,
    TimestampType,
};
