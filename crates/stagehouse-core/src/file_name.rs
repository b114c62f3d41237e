//! Stage file name codec.
//!
//! Every flushed file is named after the data it carries:
//!
//! ```text
//! {connector}/{table}/{partition}/{start}_{end}_{ingest_time_ms}.json.gz
//! ```
//!
//! The three numeric fields are the connector's only durable state: recovery
//! and reconciliation both work by decoding the stage listing. Broken records
//! live in a parallel namespace distinguished by a `key`/`value` marker and a
//! bare `.gz` suffix:
//!
//! ```text
//! {prefix}/{offset}_{key|value}_{ingest_time_ms}.gz
//! ```

use crate::error::{CoreError, Result};

const DATA_SUFFIX: &str = ".json.gz";
const BROKEN_SUFFIX: &str = ".gz";

/// Per-partition prefix under which all of a partition's files live.
pub fn file_prefix(connector_name: &str, table_name: &str, partition: u32) -> String {
    format!("{}/{}/{}", connector_name, table_name, partition)
}

/// Name for a flushed data file covering `[start_offset, end_offset]`.
pub fn file_name(prefix: &str, start_offset: i64, end_offset: i64, ingest_time_ms: i64) -> String {
    format!(
        "{}/{}_{}_{}{}",
        prefix, start_offset, end_offset, ingest_time_ms, DATA_SUFFIX
    )
}

/// Name for a broken record part routed to the table stage.
pub fn broken_record_file_name(
    prefix: &str,
    offset: i64,
    is_key: bool,
    ingest_time_ms: i64,
) -> String {
    let marker = if is_key { "key" } else { "value" };
    format!(
        "{}/{}_{}_{}{}",
        prefix, offset, marker, ingest_time_ms, BROKEN_SUFFIX
    )
}

/// Start offset encoded in a data file name.
pub fn start_offset(name: &str) -> Result<i64> {
    Ok(fields(name)?.0)
}

/// End offset encoded in a data file name.
pub fn end_offset(name: &str) -> Result<i64> {
    Ok(fields(name)?.1)
}

/// Ingest time in milliseconds encoded in a data file name.
pub fn time_ingested(name: &str) -> Result<i64> {
    Ok(fields(name)?.2)
}

fn fields(name: &str) -> Result<(i64, i64, i64)> {
    let malformed = || CoreError::MalformedFileName(name.to_string());

    let base = name.rsplit('/').next().ok_or_else(malformed)?;
    let stem = base.strip_suffix(DATA_SUFFIX).ok_or_else(malformed)?;

    let mut parts = stem.split('_');
    let start = parse_field(parts.next(), name)?;
    let end = parse_field(parts.next(), name)?;
    let time = parse_field(parts.next(), name)?;
    if parts.next().is_some() {
        return Err(malformed());
    }
    Ok((start, end, time))
}

fn parse_field(field: Option<&str>, name: &str) -> Result<i64> {
    field
        .and_then(|f| f.parse::<i64>().ok())
        .ok_or_else(|| CoreError::MalformedFileName(name.to_string()))
}
