//! Sink service: the registry of per-partition pipelines.
//!
//! The connector framework drives this service: `start_task` on partition
//! assignment, `insert_all` per poll, `get_offset` on the periodic commit
//! callback, `close` on rebalance and `close_all` on shutdown. Records for a
//! partition that was never opened register their context lazily.
//!
//! Buffer thresholds and the null-value policy are adjustable at runtime
//! through setters that clamp out-of-range values with a warning.

pub(crate) mod cleaner;
pub mod context;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{error, info, warn};

use stagehouse_core::names;
use stagehouse_core::{JsonRecordSerializer, MetadataConfig, RecordSerializer, SinkRecord};

use crate::clock::{Clock, SystemClock};
use crate::config::{
    BehaviorOnNullValues, SinkConfig, BUFFER_FLUSH_TIME_SEC_MIN, BUFFER_SIZE_BYTES_DEFAULT,
    BUFFER_SIZE_BYTES_MIN, CLEANER_INTERVAL_MS_DEFAULT,
};
use crate::connection::ConnectionService;
use crate::error::{Result, SinkError};
use crate::telemetry::TelemetryService;

pub use context::ServiceContext;

/// Mutable runtime settings shared by the service and its contexts.
pub(crate) struct SinkSettings {
    file_size: AtomicI64,
    record_num: AtomicI64,
    flush_time_secs: AtomicI64,
    cleaner_interval_ms: AtomicI64,
    behavior_on_null_values: Mutex<BehaviorOnNullValues>,
    serializer: Mutex<Arc<dyn RecordSerializer>>,
}

impl SinkSettings {
    pub(crate) fn new(config: &SinkConfig) -> Self {
        let settings = Self {
            file_size: AtomicI64::new(BUFFER_SIZE_BYTES_DEFAULT),
            record_num: AtomicI64::new(0),
            flush_time_secs: AtomicI64::new(BUFFER_FLUSH_TIME_SEC_MIN),
            cleaner_interval_ms: AtomicI64::new(CLEANER_INTERVAL_MS_DEFAULT),
            behavior_on_null_values: Mutex::new(config.behavior_on_null_values),
            serializer: Mutex::new(
                Arc::new(JsonRecordSerializer::new(config.metadata.clone()))
                    as Arc<dyn RecordSerializer>,
            ),
        };
        settings.set_file_size(config.file_size);
        settings.set_record_num(config.record_num);
        settings.set_flush_time(config.flush_time_secs);
        settings.set_cleaner_interval_ms(config.cleaner_interval_ms);
        settings
    }

    pub(crate) fn set_file_size(&self, size: i64) {
        if size < BUFFER_SIZE_BYTES_MIN {
            warn!(
                size,
                default = BUFFER_SIZE_BYTES_DEFAULT,
                "file size below minimum, resetting to default"
            );
            self.file_size
                .store(BUFFER_SIZE_BYTES_DEFAULT, Ordering::SeqCst);
        } else {
            info!(size, "set file size limit");
            self.file_size.store(size, Ordering::SeqCst);
        }
    }

    pub(crate) fn set_record_num(&self, num: i64) {
        if num < 0 {
            warn!(num, "record count limit is negative, resetting to 0");
            self.record_num.store(0, Ordering::SeqCst);
        } else {
            info!(num, "set record count limit");
            self.record_num.store(num, Ordering::SeqCst);
        }
    }

    pub(crate) fn set_flush_time(&self, secs: i64) {
        if secs < BUFFER_FLUSH_TIME_SEC_MIN {
            warn!(
                secs,
                minimum = BUFFER_FLUSH_TIME_SEC_MIN,
                "flush time below minimum, resetting to minimum"
            );
            self.flush_time_secs
                .store(BUFFER_FLUSH_TIME_SEC_MIN, Ordering::SeqCst);
        } else {
            info!(secs, "set flush time");
            self.flush_time_secs.store(secs, Ordering::SeqCst);
        }
    }

    pub(crate) fn set_cleaner_interval_ms(&self, millis: i64) {
        if millis <= 0 {
            warn!(millis, "cleaner interval must be positive, resetting to default");
            self.cleaner_interval_ms
                .store(CLEANER_INTERVAL_MS_DEFAULT, Ordering::SeqCst);
        } else {
            self.cleaner_interval_ms.store(millis, Ordering::SeqCst);
        }
    }

    pub(crate) fn set_behavior_on_null_values(&self, behavior: BehaviorOnNullValues) {
        *self.behavior_on_null_values.lock().unwrap() = behavior;
    }

    pub(crate) fn set_serializer(&self, serializer: Arc<dyn RecordSerializer>) {
        *self.serializer.lock().unwrap() = serializer;
    }

    pub(crate) fn file_size(&self) -> i64 {
        self.file_size.load(Ordering::SeqCst)
    }

    pub(crate) fn record_num(&self) -> i64 {
        self.record_num.load(Ordering::SeqCst)
    }

    pub(crate) fn flush_time_secs(&self) -> i64 {
        self.flush_time_secs.load(Ordering::SeqCst)
    }

    pub(crate) fn cleaner_interval_ms(&self) -> i64 {
        self.cleaner_interval_ms.load(Ordering::SeqCst)
    }

    pub(crate) fn behavior_on_null_values(&self) -> BehaviorOnNullValues {
        *self.behavior_on_null_values.lock().unwrap()
    }

    pub(crate) fn serializer(&self) -> Arc<dyn RecordSerializer> {
        Arc::clone(&self.serializer.lock().unwrap())
    }
}

fn name_index(topic: &str, partition: u32) -> String {
    format!("{}_{}", topic, partition)
}

/// The sink service owning every per-partition pipeline of this task.
pub struct SinkService {
    conn: Arc<dyn ConnectionService>,
    telemetry: Arc<dyn TelemetryService>,
    clock: Arc<dyn Clock>,
    settings: Arc<SinkSettings>,
    topic_to_table: HashMap<String, String>,
    contexts: HashMap<String, ServiceContext>,
    is_stopped: Arc<AtomicBool>,
}

impl SinkService {
    /// Create a service over an open connection. A missing or closed
    /// connection is fatal (error 5010).
    pub fn new(conn: Arc<dyn ConnectionService>) -> Result<Self> {
        Self::with_clock(conn, Arc::new(SystemClock))
    }

    /// Create a service with an injected time source.
    pub fn with_clock(conn: Arc<dyn ConnectionService>, clock: Arc<dyn Clock>) -> Result<Self> {
        if conn.is_closed() {
            return Err(SinkError::NoConnection);
        }
        let telemetry = conn.telemetry_client();
        Ok(Self {
            conn,
            telemetry,
            clock,
            settings: Arc::new(SinkSettings::new(&SinkConfig::default())),
            topic_to_table: HashMap::new(),
            contexts: HashMap::new(),
            is_stopped: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Apply a full configuration, clamping out-of-range values.
    pub fn configure(&mut self, config: SinkConfig) {
        self.settings.set_file_size(config.file_size);
        self.settings.set_record_num(config.record_num);
        self.settings.set_flush_time(config.flush_time_secs);
        self.settings.set_cleaner_interval_ms(config.cleaner_interval_ms);
        self.settings
            .set_behavior_on_null_values(config.behavior_on_null_values);
        self.settings.set_serializer(Arc::new(JsonRecordSerializer::new(
            config.metadata,
        )));
        self.topic_to_table = config.topic_to_table;
    }

    /// Register the pipeline for an assigned partition.
    pub fn start_task(&mut self, table_name: &str, topic: &str, partition: u32) {
        let key = name_index(topic, partition);
        if self.contexts.contains_key(&key) {
            error!(topic, partition, "task is already registered");
            return;
        }
        let context = ServiceContext::new(
            table_name.to_string(),
            partition,
            Arc::clone(&self.conn),
            Arc::clone(&self.settings),
            Arc::clone(&self.clock),
            Arc::clone(&self.telemetry),
            Arc::clone(&self.is_stopped),
        );
        self.contexts.insert(key, context);
    }

    /// Insert a batch, then give every pipeline its time-based flush check.
    pub async fn insert_all(&mut self, records: Vec<SinkRecord>) -> Result<()> {
        for record in records {
            self.insert(record).await?;
        }
        for context in self.contexts.values() {
            if context.should_flush() {
                context.flush_buffer().await?;
            }
        }
        Ok(())
    }

    /// Insert one record, lazily registering its partition if the framework
    /// never opened it.
    pub async fn insert(&mut self, record: SinkRecord) -> Result<()> {
        let key = name_index(&record.topic, record.partition);
        if !self.contexts.contains_key(&key) {
            warn!(
                topic = %record.topic,
                partition = record.partition,
                "partition was not opened, registering lazily"
            );
            let table = names::table_name(&record.topic, &self.topic_to_table);
            self.start_task(&table, &record.topic, record.partition);
        }
        match self.contexts.get_mut(&key) {
            Some(context) => context.insert(record).await,
            None => Err(SinkError::Config(format!(
                "no service context for {}",
                key
            ))),
        }
    }

    /// The committable offset for a partition; triggers ingestion of files
    /// flushed since the previous call.
    pub async fn get_offset(&self, topic: &str, partition: u32) -> Result<i64> {
        match self.contexts.get(&name_index(topic, partition)) {
            Some(context) => context.get_offset().await,
            None => {
                warn!(topic, partition, "partition was never initialized, offset 0");
                Ok(0)
            }
        }
    }

    pub fn partition_count(&self) -> usize {
        self.contexts.len()
    }

    /// Drive `get_offset` on every pipeline. Test hook.
    pub async fn call_all_get_offset(&self) -> Result<()> {
        for context in self.contexts.values() {
            context.get_offset().await?;
        }
        Ok(())
    }

    /// Whether a pipeline's buffer holds no records. Test hook; false for an
    /// unknown pipe.
    pub fn is_partition_buffer_empty(&self, pipe_name: &str) -> bool {
        self.contexts
            .values()
            .find(|context| context.pipe_name() == pipe_name)
            .map(|context| context.is_buffer_empty())
            .unwrap_or(false)
    }

    /// Close the pipelines for revoked partitions.
    pub async fn close(&mut self, partitions: &[(String, u32)]) {
        for (topic, partition) in partitions {
            let key = name_index(topic, *partition);
            match self.contexts.remove(&key) {
                Some(mut context) => context.close().await,
                None => warn!(
                    topic = %topic,
                    partition = *partition,
                    "cannot close sink service, it was never initialized"
                ),
            }
        }
    }

    /// Stop every pipeline and release the cleaner tasks.
    pub async fn close_all(&mut self) {
        self.is_stopped.store(true, Ordering::SeqCst);
        for (_, mut context) in self.contexts.drain() {
            context.close().await;
        }
    }

    /// Signal cleaner loops to exit at their next wake without closing the
    /// pipelines.
    pub fn set_is_stopped(&self) {
        self.is_stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.is_stopped.load(Ordering::SeqCst)
    }

    // ---------------------------------------------------------------
    // Runtime settings
    // ---------------------------------------------------------------

    pub fn set_record_number(&self, num: i64) {
        self.settings.set_record_num(num);
    }

    pub fn set_file_size(&self, size: i64) {
        self.settings.set_file_size(size);
    }

    pub fn set_flush_time(&self, secs: i64) {
        self.settings.set_flush_time(secs);
    }

    pub fn set_topic_to_table_map(&mut self, map: HashMap<String, String>) {
        self.topic_to_table = map;
    }

    pub fn set_behavior_on_null_values(&self, behavior: BehaviorOnNullValues) {
        self.settings.set_behavior_on_null_values(behavior);
    }

    pub fn set_metadata_config(&self, metadata: MetadataConfig) {
        self.settings
            .set_serializer(Arc::new(JsonRecordSerializer::new(metadata)));
    }

    /// Replace the record serializer outright.
    pub fn set_record_serializer(&self, serializer: Arc<dyn RecordSerializer>) {
        self.settings.set_serializer(serializer);
    }

    pub fn record_number(&self) -> i64 {
        self.settings.record_num()
    }

    pub fn file_size(&self) -> i64 {
        self.settings.file_size()
    }

    pub fn flush_time(&self) -> i64 {
        self.settings.flush_time_secs()
    }

    pub fn behavior_on_null_values(&self) -> BehaviorOnNullValues {
        self.settings.behavior_on_null_values()
    }
}
