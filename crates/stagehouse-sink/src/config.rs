//! Sink configuration.
//!
//! Controls buffering thresholds and the cleaner cadence:
//!
//! - **file_size**: flush the buffer once its accounted size reaches this
//!   many bytes (default: 5 MB, minimum: 1)
//! - **record_num**: flush once the buffer holds this many records
//!   (default: 10000; 0 disables the count trigger)
//! - **flush_time_secs**: flush on the next poll after this much idle time
//!   (default: 120 s, minimum: 10 s)
//! - **cleaner_interval_ms**: period of the reconciliation loop
//!   (default: 60 s)
//! - **topic_to_table**: explicit topic → table routing; unknown topics use
//!   the derived table name
//! - **behavior_on_null_values**: whether tombstones are kept or dropped
//! - **metadata**: which metadata fields the record serializer emits
//!
//! Out-of-range values are clamped by the service setters, which log a
//! warning and substitute the default or minimum.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use stagehouse_core::MetadataConfig;

pub const BUFFER_SIZE_BYTES_DEFAULT: i64 = 5_000_000;
pub const BUFFER_SIZE_BYTES_MIN: i64 = 1;
pub const BUFFER_COUNT_RECORDS_DEFAULT: i64 = 10_000;
pub const BUFFER_FLUSH_TIME_SEC_DEFAULT: i64 = 120;
pub const BUFFER_FLUSH_TIME_SEC_MIN: i64 = 10;
pub const CLEANER_INTERVAL_MS_DEFAULT: i64 = 60_000;

/// What to do with a record whose value is null or semantically empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BehaviorOnNullValues {
    /// Keep tombstones; they land in the table as null content.
    #[default]
    Default,
    /// Drop tombstones before they reach the buffer.
    Ignore,
}

/// Configuration consumed by the sink service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    #[serde(default = "default_file_size")]
    pub file_size: i64,

    #[serde(default = "default_record_num")]
    pub record_num: i64,

    #[serde(default = "default_flush_time_secs")]
    pub flush_time_secs: i64,

    #[serde(default = "default_cleaner_interval_ms")]
    pub cleaner_interval_ms: i64,

    #[serde(default)]
    pub topic_to_table: HashMap<String, String>,

    #[serde(default)]
    pub behavior_on_null_values: BehaviorOnNullValues,

    #[serde(default)]
    pub metadata: MetadataConfig,
}

fn default_file_size() -> i64 {
    BUFFER_SIZE_BYTES_DEFAULT
}

fn default_record_num() -> i64 {
    BUFFER_COUNT_RECORDS_DEFAULT
}

fn default_flush_time_secs() -> i64 {
    BUFFER_FLUSH_TIME_SEC_DEFAULT
}

fn default_cleaner_interval_ms() -> i64 {
    CLEANER_INTERVAL_MS_DEFAULT
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            file_size: BUFFER_SIZE_BYTES_DEFAULT,
            record_num: BUFFER_COUNT_RECORDS_DEFAULT,
            flush_time_secs: BUFFER_FLUSH_TIME_SEC_DEFAULT,
            cleaner_interval_ms: CLEANER_INTERVAL_MS_DEFAULT,
            topic_to_table: HashMap::new(),
            behavior_on_null_values: BehaviorOnNullValues::Default,
            metadata: MetadataConfig::default(),
        }
    }
}
