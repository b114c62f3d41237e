//! Record model for the sink pipeline.
//!
//! A [`SinkRecord`] is one message pulled from the distributed log. Its key
//! and value are [`RecordValue`]s: either a raw payload from a community
//! converter (`Native`), an already-converted first-party form (`Content`),
//! or a community-converter tombstone (`Null`).
//!
//! Converted content is a [`RecordContent`]: a sequence of structured JSON
//! nodes, or a `Broken` envelope carrying the raw bytes of a payload that
//! failed to parse. Broken content never reaches the pipe stage; the service
//! routes it to the table stage so a repaired record can flow later.

use bytes::Bytes;
use serde_json::Value;
use tracing::warn;

/// Timestamp semantics attached to a record by the upstream log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampType {
    NoTimestampType,
    CreateTime,
    LogAppendTime,
}

/// Converted record content: parsed structure or a broken envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordContent {
    /// Ordered sequence of structured nodes parsed from the payload.
    Structured { nodes: Vec<Value> },
    /// Raw bytes of a payload that could not be parsed.
    Broken { bytes: Bytes },
}

impl RecordContent {
    /// Parse a raw payload into structured nodes.
    ///
    /// The payload may carry several whitespace-separated JSON nodes; all of
    /// them are kept in order. A payload that fails to parse degrades into a
    /// `Broken` envelope carrying the original bytes, so that no record is
    /// ever dropped on a parse failure.
    pub fn from_bytes(bytes: &Bytes) -> Self {
        let mut nodes = Vec::new();
        for node in serde_json::Deserializer::from_slice(bytes).into_iter::<Value>() {
            match node {
                Ok(node) => nodes.push(node),
                Err(e) => {
                    warn!(error = %e, "native content parser error, keeping raw bytes");
                    return RecordContent::Broken {
                        bytes: bytes.clone(),
                    };
                }
            }
        }
        RecordContent::Structured { nodes }
    }

    pub fn is_broken(&self) -> bool {
        matches!(self, RecordContent::Broken { .. })
    }

    /// Whether this content is semantically empty: an empty node list or a
    /// list of JSON nulls, the first-party form of a tombstone.
    pub fn is_null_value(&self) -> bool {
        match self {
            RecordContent::Structured { nodes } => {
                nodes.is_empty() || nodes.iter().all(|n| n.is_null())
            }
            RecordContent::Broken { .. } => false,
        }
    }

    /// Byte form used when routing content to the table stage.
    ///
    /// Broken content contributes its raw bytes. Structured content uses the
    /// human-readable node-list rendering rather than a canonical encoding,
    /// so quarantined rows stay inspectable as-is.
    pub fn to_stage_bytes(&self) -> Bytes {
        match self {
            RecordContent::Broken { bytes } => bytes.clone(),
            RecordContent::Structured { nodes } => {
                let rendered: Vec<String> = nodes.iter().map(|n| n.to_string()).collect();
                Bytes::from(format!("[{}]", rendered.join(", ")))
            }
        }
    }
}

/// A record key or value as handed to the sink.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordValue {
    /// Raw payload from a community converter, not yet parsed.
    Native {
        bytes: Bytes,
        /// Schema name attached by the converter, if any.
        schema: Option<String>,
    },
    /// First-party converted content.
    Content(RecordContent),
    /// Tombstone from a community converter.
    Null,
}

impl RecordValue {
    /// Convert a native payload into first-party content; other variants are
    /// returned unchanged.
    pub fn into_converted(self) -> Self {
        match self {
            RecordValue::Native { bytes, .. } => {
                RecordValue::Content(RecordContent::from_bytes(&bytes))
            }
            other => other,
        }
    }

    pub fn as_content(&self) -> Option<&RecordContent> {
        match self {
            RecordValue::Content(content) => Some(content),
            _ => None,
        }
    }

    pub fn is_broken(&self) -> bool {
        self.as_content().is_some_and(|c| c.is_broken())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RecordValue::Null)
    }
}

/// A single record delivered to the sink for one (topic, partition).
#[derive(Debug, Clone)]
pub struct SinkRecord {
    pub topic: String,
    pub partition: u32,
    pub offset: i64,
    /// Timestamp in milliseconds since epoch, if the log attached one.
    pub timestamp: Option<i64>,
    pub timestamp_type: TimestampType,
    pub key: RecordValue,
    pub value: RecordValue,
    /// Headers are carried through opaquely.
    pub headers: Vec<(String, Bytes)>,
}

impl SinkRecord {
    /// Convenience constructor for a keyless record with no timestamp.
    pub fn new(topic: &str, partition: u32, offset: i64, value: RecordValue) -> Self {
        Self {
            topic: topic.to_string(),
            partition,
            offset,
            timestamp: None,
            timestamp_type: TimestampType::NoTimestampType,
            key: RecordValue::Null,
            value,
            headers: Vec::new(),
        }
    }

    /// A record is broken when either converted part is broken.
    pub fn is_broken(&self) -> bool {
        self.key.is_broken() || self.value.is_broken()
    }
}
