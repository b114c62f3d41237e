//! Stagehouse core types.
//!
//! This crate holds the pieces of the sink pipeline that are pure data:
//! - The record model ([`SinkRecord`], [`RecordValue`], [`RecordContent`])
//!   exchanged between the connector framework and the sink service.
//! - The stage file name codec ([`file_name`]) that encodes the offset range
//!   and ingest time of every flushed file. File names are the only durable
//!   state the connector keeps, so the codec is the recovery format.
//! - Warehouse object naming ([`names`]) for stages, pipes and tables.
//! - The record serializer contract ([`serializer`]) used to turn records
//!   into staged file content.

pub mod error;
pub mod file_name;
pub mod names;
pub mod record;
pub mod serializer;

pub use error::{CoreError, Result};
pub use record::{RecordContent, RecordValue, SinkRecord, TimestampType};
pub use serializer::{JsonRecordSerializer, MetadataConfig, RecordSerializer};
