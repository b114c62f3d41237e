//! Warehouse object naming.
//!
//! Stages and pipes created by the connector are namespaced under a fixed
//! marker so that bootstrap can recognize its own objects across restarts.
//! Table names resolve through the configured topic map, falling back to an
//! identifier-sanitized derivation of the topic name.

use std::collections::HashMap;

const OBJECT_PREFIX: &str = "STAGEHOUSE_CONNECTOR";

/// Internal stage name for a connector/table pair.
pub fn stage_name(connector_name: &str, table_name: &str) -> String {
    format!("{}_{}_STAGE_{}", OBJECT_PREFIX, connector_name, table_name)
}

/// Pipe name for a connector/table/partition triple.
pub fn pipe_name(connector_name: &str, table_name: &str, partition: u32) -> String {
    format!(
        "{}_{}_PIPE_{}_{}",
        OBJECT_PREFIX, connector_name, table_name, partition
    )
}

/// Resolve the target table for a topic.
///
/// Topics present in the map use the configured table. Unknown topics derive
/// a valid identifier from the topic name: non-alphanumeric characters map to
/// `_` and a leading digit gets a `_` prefix.
pub fn table_name(topic: &str, topic_to_table: &HashMap<String, String>) -> String {
    if let Some(table) = topic_to_table.get(topic) {
        return table.clone();
    }

    let mut name: String = topic
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if name.chars().next().map_or(true, |c| c.is_ascii_digit()) {
        name.insert(0, '_');
    }
    name
}
