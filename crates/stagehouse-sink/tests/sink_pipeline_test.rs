//! End-to-end pipeline tests over the in-memory backend.
//!
//! Drives the sink service the way the connector framework does: open a
//! partition, insert batches, run the periodic commit callback, and let the
//! background cleaner reconcile staged files. A manual clock makes the
//! time-triggered and aging behavior deterministic; the cleaner interval is
//! compressed so loop scenarios finish in milliseconds.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use stagehouse_core::{file_name, names};
use stagehouse_sink::{
    BehaviorOnNullValues, Clock, ConnectionService, InMemoryConnection, IngestStatus, ManualClock,
    RecordContent, RecordSerializer, RecordValue, SinkConfig, SinkRecord, SinkService,
};

const NOW: i64 = 1_700_000_000_000;
const CONNECTOR: &str = "test-connector";

/// Serializer that emits the bare content nodes, keeping serialized sizes
/// equal to the payload sizes.
struct RawSerializer;

impl RecordSerializer for RawSerializer {
    fn serialize(&self, record: &SinkRecord) -> stagehouse_core::Result<String> {
        match &record.value {
            RecordValue::Content(RecordContent::Structured { nodes }) => {
                Ok(nodes.iter().map(|n| n.to_string()).collect())
            }
            RecordValue::Native { bytes, .. } => Ok(String::from_utf8_lossy(bytes).to_string()),
            _ => Ok(String::new()),
        }
    }
}

fn setup(config: SinkConfig) -> (SinkService, Arc<InMemoryConnection>, Arc<ManualClock>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let conn = Arc::new(InMemoryConnection::new(CONNECTOR));
    let clock = Arc::new(ManualClock::new(NOW));
    let mut service = SinkService::with_clock(
        Arc::clone(&conn) as Arc<dyn ConnectionService>,
        Arc::clone(&clock) as Arc<dyn Clock>,
    )
    .expect("open connection");
    service.configure(config);
    (service, conn, clock)
}

fn json_record(topic: &str, partition: u32, offset: i64, payload: &str) -> SinkRecord {
    SinkRecord::new(
        topic,
        partition,
        offset,
        RecordValue::Native {
            bytes: Bytes::from(payload.to_string()),
            schema: None,
        },
    )
}

fn orders_prefix() -> String {
    file_name::file_prefix(CONNECTOR, "orders", 0)
}

fn orders_stage() -> String {
    names::stage_name(CONNECTOR, "orders")
}

// -------------------------------------------------------------------
// Scenario: size-triggered flush
// -------------------------------------------------------------------

#[tokio::test]
async fn size_triggered_flush_and_commit() {
    let (mut service, conn, _clock) = setup(SinkConfig {
        file_size: 10,
        record_num: 0,
        flush_time_secs: 3600,
        ..SinkConfig::default()
    });
    service.set_record_serializer(Arc::new(RawSerializer));
    service.start_task("orders", "topicA", 0);

    // Three four-character payloads: the buffer grows 8, 16, 24 accounted
    // bytes, and the threshold check runs after each insert.
    service.insert(json_record("topicA", 0, 100, "1234")).await.unwrap();
    assert!(conn.stage_file_names(&orders_stage()).await.unwrap().is_empty());

    service.insert(json_record("topicA", 0, 101, "5678")).await.unwrap();
    let flushed = conn.stage_file_names(&orders_stage()).await.unwrap();
    let expected = format!("{}/100_101_{}.json.gz", orders_prefix(), NOW);
    assert_eq!(flushed, vec![expected.clone()]);
    let content = conn.read_stage_file(&orders_stage(), &expected).await.unwrap();
    assert_eq!(content, Bytes::from("12345678"));

    // The third record starts a fresh buffer.
    service.insert(json_record("topicA", 0, 102, "9012")).await.unwrap();
    let pipe = names::pipe_name(CONNECTOR, "orders", 0);
    assert!(!service.is_partition_buffer_empty(&pipe));

    // Commit: the flushed file is handed to ingestion and the committable
    // offset reaches one past the last flushed record.
    let offset = service.get_offset("topicA", 0).await.unwrap();
    assert_eq!(offset, 102);
    assert_eq!(conn.ingestion().ingested_files(), vec![expected]);
}

#[tokio::test]
async fn oversized_single_record_flushes_alone() {
    let (mut service, conn, _clock) = setup(SinkConfig {
        file_size: 4,
        record_num: 0,
        flush_time_secs: 3600,
        ..SinkConfig::default()
    });
    service.set_record_serializer(Arc::new(RawSerializer));
    service.start_task("orders", "topicA", 0);

    // The threshold is evaluated after the insert, so one record larger than
    // the file size is buffered and then flushed on its own.
    service.insert(json_record("topicA", 0, 7, "123456")).await.unwrap();
    let flushed = conn.stage_file_names(&orders_stage()).await.unwrap();
    assert_eq!(
        flushed,
        vec![format!("{}/7_7_{}.json.gz", orders_prefix(), NOW)]
    );
}

// -------------------------------------------------------------------
// Scenario: time-triggered flush
// -------------------------------------------------------------------

#[tokio::test]
async fn time_triggered_flush_on_idle_poll() {
    let (mut service, conn, clock) = setup(SinkConfig {
        file_size: 1_000_000_000,
        record_num: 0,
        flush_time_secs: 10,
        ..SinkConfig::default()
    });
    service.start_task("orders", "topicA", 0);

    service.insert(json_record("topicA", 0, 50, "{\"v\":1}")).await.unwrap();
    assert!(conn.stage_file_names(&orders_stage()).await.unwrap().is_empty());

    // An idle poll before the window elapses flushes nothing.
    clock.advance(9_000);
    service.insert_all(vec![]).await.unwrap();
    assert!(conn.stage_file_names(&orders_stage()).await.unwrap().is_empty());

    // Once the window has elapsed, the idle poll flushes the buffer.
    clock.advance(2_000);
    service.insert_all(vec![]).await.unwrap();
    let flushed = conn.stage_file_names(&orders_stage()).await.unwrap();
    assert_eq!(
        flushed,
        vec![format!("{}/50_50_{}.json.gz", orders_prefix(), NOW + 11_000)]
    );
}

// -------------------------------------------------------------------
// Scenario: broken record routing
// -------------------------------------------------------------------

#[tokio::test]
async fn broken_record_goes_to_table_stage_without_advancing_offset() {
    let (mut service, conn, _clock) = setup(SinkConfig::default());
    service.start_task("orders", "topicA", 0);

    service
        .insert(json_record("topicA", 0, 7, "not { json"))
        .await
        .unwrap();

    // Nothing on the pipe stage, one broken value file on the table stage.
    assert!(conn.stage_file_names(&orders_stage()).await.unwrap().is_empty());
    let quarantined = conn.table_stage_file_names("orders").await.unwrap();
    assert_eq!(
        quarantined,
        vec![format!("{}/7_value_{}.gz", orders_prefix(), NOW)]
    );

    let pipe = names::pipe_name(CONNECTOR, "orders", 0);
    assert!(service.is_partition_buffer_empty(&pipe));

    // The offset was not consumed: a repaired record at offset 7 still flows.
    service.insert(json_record("topicA", 0, 7, "{\"v\":1}")).await.unwrap();
    assert!(!service.is_partition_buffer_empty(&pipe));
}

#[tokio::test]
async fn broken_key_and_value_both_quarantined() {
    let (mut service, conn, _clock) = setup(SinkConfig::default());
    service.start_task("orders", "topicA", 0);

    let mut record = json_record("topicA", 0, 3, "not { json");
    record.key = RecordValue::Native {
        bytes: Bytes::from("also } bad"),
        schema: None,
    };
    service.insert(record).await.unwrap();

    let mut quarantined = conn.table_stage_file_names("orders").await.unwrap();
    quarantined.sort();
    assert_eq!(
        quarantined,
        vec![
            format!("{}/3_key_{}.gz", orders_prefix(), NOW),
            format!("{}/3_value_{}.gz", orders_prefix(), NOW),
        ]
    );
}

// -------------------------------------------------------------------
// Scenario: tombstones under IGNORE
// -------------------------------------------------------------------

#[tokio::test]
async fn tombstone_dropped_under_ignore() {
    let (mut service, conn, _clock) = setup(SinkConfig {
        behavior_on_null_values: BehaviorOnNullValues::Ignore,
        ..SinkConfig::default()
    });
    service.start_task("orders", "topicA", 0);

    service
        .insert(SinkRecord::new("topicA", 0, 40, RecordValue::Null))
        .await
        .unwrap();

    let pipe = names::pipe_name(CONNECTOR, "orders", 0);
    assert!(service.is_partition_buffer_empty(&pipe));
    assert!(conn.stage_file_names(&orders_stage()).await.unwrap().is_empty());
    // The committable offset never observed the tombstone.
    assert_eq!(service.get_offset("topicA", 0).await.unwrap(), 0);
}

#[tokio::test]
async fn empty_first_party_content_dropped_under_ignore() {
    let (mut service, _conn, _clock) = setup(SinkConfig {
        behavior_on_null_values: BehaviorOnNullValues::Ignore,
        ..SinkConfig::default()
    });
    service.start_task("orders", "topicA", 0);

    // First-party converted content with no nodes is semantically empty.
    service
        .insert(SinkRecord::new(
            "topicA",
            0,
            41,
            RecordValue::Content(RecordContent::Structured { nodes: vec![] }),
        ))
        .await
        .unwrap();

    let pipe = names::pipe_name(CONNECTOR, "orders", 0);
    assert!(service.is_partition_buffer_empty(&pipe));
}

#[tokio::test]
async fn tombstone_kept_under_default() {
    let (mut service, _conn, _clock) = setup(SinkConfig::default());
    service.start_task("orders", "topicA", 0);

    service
        .insert(SinkRecord::new("topicA", 0, 40, RecordValue::Null))
        .await
        .unwrap();

    let pipe = names::pipe_name(CONNECTOR, "orders", 0);
    assert!(!service.is_partition_buffer_empty(&pipe));
}

// -------------------------------------------------------------------
// Scenario: recovery reprocess purge
// -------------------------------------------------------------------

#[tokio::test]
async fn recovery_purges_reprocess_files_and_preserves_in_flight() {
    let (mut service, conn, _clock) = setup(SinkConfig {
        cleaner_interval_ms: 100,
        ..SinkConfig::default()
    });
    service.start_task("orders", "topicA", 0);

    let prefix = orders_prefix();
    let stage = orders_stage();
    let in_flight = format!("{}/20_29_{}.json.gz", prefix, NOW - 60_000);
    let reprocess_a = format!("{}/30_39_{}.json.gz", prefix, NOW - 50_000);
    let reprocess_b = format!("{}/40_49_{}.json.gz", prefix, NOW - 40_000);
    for name in [&in_flight, &reprocess_a, &reprocess_b] {
        conn.seed_stage_file(&stage, name, "leftover").await.unwrap();
    }

    // The first record after reassignment carries offset 30: everything from
    // 30 up will be redelivered, so those stage copies are redundant.
    service.insert(json_record("topicA", 0, 30, "{\"v\":1}")).await.unwrap();

    // The reprocess purge runs one cleaner period after startup.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let remaining = conn.stage_file_names(&stage).await.unwrap();
    assert_eq!(remaining, vec![in_flight.clone()]);
    // The in-flight file was preserved for reconciliation, not quarantined.
    assert!(conn.table_stage_file_names("orders").await.unwrap().is_empty());

    service.close_all().await;
}

// -------------------------------------------------------------------
// Scenario: cleaner reconciliation through the background loop
// -------------------------------------------------------------------

#[tokio::test]
async fn cleaner_purges_loaded_file_in_background() {
    let (mut service, conn, _clock) = setup(SinkConfig {
        file_size: 1_000_000_000,
        record_num: 1,
        flush_time_secs: 3600,
        cleaner_interval_ms: 100,
        ..SinkConfig::default()
    });
    service.start_task("orders", "topicA", 0);

    // record_num = 1 flushes every record immediately.
    service.insert(json_record("topicA", 0, 5, "{\"v\":1}")).await.unwrap();
    let flushed = conn.stage_file_names(&orders_stage()).await.unwrap();
    assert_eq!(flushed.len(), 1);

    conn.ingestion().set_report_status(&flushed[0], IngestStatus::Loaded);

    tokio::time::sleep(Duration::from_millis(400)).await;

    assert!(conn.stage_file_names(&orders_stage()).await.unwrap().is_empty());
    service.close_all().await;
}

#[tokio::test]
async fn cleaner_quarantines_failed_file_in_background() {
    let (mut service, conn, _clock) = setup(SinkConfig {
        file_size: 1_000_000_000,
        record_num: 1,
        flush_time_secs: 3600,
        cleaner_interval_ms: 100,
        ..SinkConfig::default()
    });
    service.start_task("orders", "topicA", 0);

    service.insert(json_record("topicA", 0, 5, "{\"v\":1}")).await.unwrap();
    let flushed = conn.stage_file_names(&orders_stage()).await.unwrap();
    conn.ingestion().set_report_status(&flushed[0], IngestStatus::Failed);

    tokio::time::sleep(Duration::from_millis(400)).await;

    assert!(conn.stage_file_names(&orders_stage()).await.unwrap().is_empty());
    assert_eq!(
        conn.table_stage_file_names("orders").await.unwrap(),
        flushed
    );
    service.close_all().await;
}

// -------------------------------------------------------------------
// Offset semantics
// -------------------------------------------------------------------

#[tokio::test]
async fn duplicate_offsets_are_ignored() {
    let (mut service, conn, clock) = setup(SinkConfig {
        file_size: 1_000_000_000,
        record_num: 0,
        flush_time_secs: 10,
        ..SinkConfig::default()
    });
    service.set_record_serializer(Arc::new(RawSerializer));
    service.start_task("orders", "topicA", 0);

    service.insert(json_record("topicA", 0, 10, "11")).await.unwrap();
    // Redelivery of an already-processed offset leaves the buffer unchanged.
    service.insert(json_record("topicA", 0, 10, "11")).await.unwrap();
    service.insert(json_record("topicA", 0, 11, "22")).await.unwrap();

    clock.advance(11_000);
    service.insert_all(vec![]).await.unwrap();

    let flushed = conn.stage_file_names(&orders_stage()).await.unwrap();
    assert_eq!(
        flushed,
        vec![format!("{}/10_11_{}.json.gz", orders_prefix(), NOW + 11_000)]
    );
    let content = conn
        .read_stage_file(&orders_stage(), &flushed[0])
        .await
        .unwrap();
    assert_eq!(content, Bytes::from("1122"));
}

#[tokio::test]
async fn get_offset_is_idempotent_without_new_flushes() {
    let (mut service, conn, _clock) = setup(SinkConfig {
        file_size: 1_000_000_000,
        record_num: 1,
        flush_time_secs: 3600,
        ..SinkConfig::default()
    });
    service.start_task("orders", "topicA", 0);

    service.insert(json_record("topicA", 0, 5, "{\"v\":1}")).await.unwrap();

    let first = service.get_offset("topicA", 0).await.unwrap();
    assert_eq!(first, 6);
    let requests_after_first = conn.ingestion().ingest_requests().len();

    // No intervening flush: same offset, no further ingest request.
    let second = service.get_offset("topicA", 0).await.unwrap();
    assert_eq!(second, first);
    assert_eq!(conn.ingestion().ingest_requests().len(), requests_after_first);
}

#[tokio::test]
async fn committed_offset_is_monotonic() {
    let (mut service, _conn, _clock) = setup(SinkConfig {
        file_size: 1_000_000_000,
        record_num: 1,
        flush_time_secs: 3600,
        ..SinkConfig::default()
    });
    service.start_task("orders", "topicA", 0);

    let mut last = service.get_offset("topicA", 0).await.unwrap();
    for offset in [3, 4, 9] {
        service
            .insert(json_record("topicA", 0, offset, "{\"v\":1}"))
            .await
            .unwrap();
        let committed = service.get_offset("topicA", 0).await.unwrap();
        assert!(committed >= last, "{} < {}", committed, last);
        assert_eq!(committed, offset + 1);
        last = committed;
    }
}

#[tokio::test]
async fn ingest_failure_propagates_from_get_offset() {
    let (mut service, conn, _clock) = setup(SinkConfig {
        file_size: 1_000_000_000,
        record_num: 1,
        flush_time_secs: 3600,
        ..SinkConfig::default()
    });
    service.start_task("orders", "topicA", 0);

    service.insert(json_record("topicA", 0, 5, "{\"v\":1}")).await.unwrap();
    conn.ingestion().fail_next_ingest();
    assert!(service.get_offset("topicA", 0).await.is_err());
}

// -------------------------------------------------------------------
// Bootstrap failures
// -------------------------------------------------------------------

#[tokio::test]
async fn incompatible_existing_table_is_fatal() {
    let (mut service, conn, _clock) = setup(SinkConfig::default());
    conn.create_table("orders").await.unwrap();
    conn.mark_incompatible("orders");
    service.start_task("orders", "topicA", 0);

    let err = service
        .insert(json_record("topicA", 0, 0, "{}"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), Some(5003));
}

#[tokio::test]
async fn incompatible_existing_stage_is_fatal() {
    let (mut service, conn, _clock) = setup(SinkConfig::default());
    let stage = orders_stage();
    conn.create_stage(&stage).await.unwrap();
    conn.mark_incompatible(&stage);
    service.start_task("orders", "topicA", 0);

    let err = service
        .insert(json_record("topicA", 0, 0, "{}"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), Some(5004));
}

#[tokio::test]
async fn incompatible_existing_pipe_is_fatal() {
    let (mut service, conn, _clock) = setup(SinkConfig::default());
    let pipe = names::pipe_name(CONNECTOR, "orders", 0);
    conn.create_pipe("orders", &orders_stage(), &pipe).await.unwrap();
    conn.mark_incompatible(&pipe);
    service.start_task("orders", "topicA", 0);

    let err = service
        .insert(json_record("topicA", 0, 0, "{}"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), Some(5005));
}

#[tokio::test]
async fn bootstrap_creates_missing_objects_once() {
    let (mut service, conn, _clock) = setup(SinkConfig::default());
    service.start_task("orders", "topicA", 0);

    service.insert(json_record("topicA", 0, 0, "{}")).await.unwrap();

    assert!(conn.table_exist("orders").await.unwrap());
    assert!(conn.stage_exist(&orders_stage()).await.unwrap());
    assert!(conn
        .pipe_exist(&names::pipe_name(CONNECTOR, "orders", 0))
        .await
        .unwrap());
}

// -------------------------------------------------------------------
// Multi-partition isolation
// -------------------------------------------------------------------

#[tokio::test]
async fn partitions_flush_into_separate_prefixes() {
    let (mut service, conn, _clock) = setup(SinkConfig {
        file_size: 1_000_000_000,
        record_num: 1,
        flush_time_secs: 3600,
        ..SinkConfig::default()
    });
    service.start_task("orders", "topicA", 0);
    service.start_task("orders", "topicA", 1);

    service.insert(json_record("topicA", 0, 5, "{\"p\":0}")).await.unwrap();
    service.insert(json_record("topicA", 1, 9, "{\"p\":1}")).await.unwrap();

    let mut flushed = conn.stage_file_names(&orders_stage()).await.unwrap();
    flushed.sort();
    assert_eq!(
        flushed,
        vec![
            format!("{}/5_5_{}.json.gz", file_name::file_prefix(CONNECTOR, "orders", 0), NOW),
            format!("{}/9_9_{}.json.gz", file_name::file_prefix(CONNECTOR, "orders", 1), NOW),
        ]
    );

    assert_eq!(service.get_offset("topicA", 0).await.unwrap(), 6);
    assert_eq!(service.get_offset("topicA", 1).await.unwrap(), 10);
}
