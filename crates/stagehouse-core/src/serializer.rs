//! Record serialization for staged files.
//!
//! The sink buffers serialized text, one row per record, and flushes the
//! concatenation as a single stage file. [`RecordSerializer`] is the seam for
//! the record converter; [`JsonRecordSerializer`] is the default
//! implementation producing NDJSON rows of the form
//!
//! ```json
//! {"content":{...},"meta":{"CreateTime":1700000000000,"topic":"t","offset":5,"partition":0}}
//! ```
//!
//! The metadata block is shaped by [`MetadataConfig`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{CoreError, Result};
use crate::record::{RecordContent, RecordValue, SinkRecord};

/// Which metadata fields accompany each serialized record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// Master switch; when false no metadata block is emitted.
    #[serde(default = "enabled")]
    pub all: bool,
    /// Include the record creation timestamp.
    #[serde(default = "enabled")]
    pub create_time: bool,
    /// Include the source topic.
    #[serde(default = "enabled")]
    pub topic: bool,
    /// Include offset and partition.
    #[serde(default = "enabled")]
    pub offset_and_partition: bool,
}

fn enabled() -> bool {
    true
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            all: true,
            create_time: true,
            topic: true,
            offset_and_partition: true,
        }
    }
}

/// Converts a record into its staged text row.
pub trait RecordSerializer: Send + Sync {
    fn serialize(&self, record: &SinkRecord) -> Result<String>;
}

/// Default NDJSON serializer.
#[derive(Debug, Clone, Default)]
pub struct JsonRecordSerializer {
    metadata: MetadataConfig,
}

impl JsonRecordSerializer {
    pub fn new(metadata: MetadataConfig) -> Self {
        Self { metadata }
    }

    fn content_node(value: &RecordValue) -> Result<Value> {
        match value {
            RecordValue::Null => Ok(Value::Null),
            RecordValue::Content(RecordContent::Structured { nodes }) => Ok(nodes_value(nodes)),
            RecordValue::Content(RecordContent::Broken { .. }) => Err(CoreError::Serialization(
                "broken content cannot be serialized into a stage file".to_string(),
            )),
            RecordValue::Native { bytes, .. } => {
                match RecordContent::from_bytes(bytes) {
                    RecordContent::Structured { nodes } => Ok(nodes_value(&nodes)),
                    RecordContent::Broken { .. } => Err(CoreError::Serialization(
                        "unparseable native content".to_string(),
                    )),
                }
            }
        }
    }
}

fn nodes_value(nodes: &[Value]) -> Value {
    match nodes {
        [] => Value::Null,
        [single] => single.clone(),
        many => Value::Array(many.to_vec()),
    }
}

impl RecordSerializer for JsonRecordSerializer {
    fn serialize(&self, record: &SinkRecord) -> Result<String> {
        let content = Self::content_node(&record.value)?;

        let mut row = Map::new();
        row.insert("content".to_string(), content);

        if self.metadata.all {
            let mut meta = Map::new();
            if self.metadata.create_time {
                if let Some(ts) = record.timestamp {
                    meta.insert("CreateTime".to_string(), json!(ts));
                }
            }
            if self.metadata.topic {
                meta.insert("topic".to_string(), json!(record.topic));
            }
            if self.metadata.offset_and_partition {
                meta.insert("offset".to_string(), json!(record.offset));
                meta.insert("partition".to_string(), json!(record.partition));
            }
            if let RecordValue::Content(RecordContent::Structured { nodes }) = &record.key {
                meta.insert("key".to_string(), nodes_value(nodes));
            }
            row.insert("meta".to_string(), Value::Object(meta));
        }

        let mut line = serde_json::to_string(&Value::Object(row))?;
        line.push('\n');
        Ok(line)
    }
}
