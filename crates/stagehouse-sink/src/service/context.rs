//! Per-partition service context.
//!
//! One [`ServiceContext`] exists per assigned (topic, partition). It owns the
//! partition buffer, the stage file lists, the offset counters and the
//! background cleaner tasks, and wires them into the pipeline:
//!
//! - **insert**: lazy bootstrap/recovery on the first record, idempotent
//!   reinsertion drop, broken-record routing to the table stage, buffering
//!   with size/count-triggered flushing.
//! - **flush**: detach the buffer under the buffer lock, upload outside it,
//!   advance the flushed offset and enqueue the file for commit and
//!   reconciliation.
//! - **get_offset**: expose the committable offset and drive the ingestion
//!   trigger on the framework's commit callback.
//!
//! Locking discipline: `buffer` and `file_lists` are mutexes held only for
//! in-memory mutation, never across an await point. The offset counters are
//! atomics readable without either lock.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use stagehouse_core::record::{RecordValue, SinkRecord, TimestampType};
use stagehouse_core::{file_name, names};

use crate::buffer::PartitionBuffer;
use crate::clock::Clock;
use crate::config::BehaviorOnNullValues;
use crate::connection::{ConnectionService, IngestionService};
use crate::error::{Result, SinkError};
use crate::service::cleaner;
use crate::service::SinkSettings;
use crate::telemetry::{PipeCreation, PipeStatus, TelemetryService};

/// The two file lists fed by flushing, guarded by one lock.
#[derive(Debug, Default)]
pub(crate) struct FileLists {
    /// Flushed this commit cycle, drained by `get_offset`.
    pub(crate) file_names: Vec<String>,
    /// Under reconciliation by the cleaner.
    pub(crate) cleaner_file_names: Vec<String>,
}

/// State shared between the producer-facing context and its cleaner tasks.
pub(crate) struct ContextShared {
    pub(crate) table_name: String,
    pub(crate) stage_name: String,
    pub(crate) pipe_name: String,
    pub(crate) prefix: String,

    pub(crate) conn: Arc<dyn ConnectionService>,
    pub(crate) ingestion: Arc<dyn IngestionService>,
    pub(crate) telemetry: Arc<dyn TelemetryService>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) settings: Arc<SinkSettings>,
    pub(crate) pipe_status: Arc<PipeStatus>,

    pub(crate) buffer: Mutex<PartitionBuffer>,
    pub(crate) file_lists: Mutex<FileLists>,

    /// Highest offset observed by insert.
    pub(crate) processed_offset: AtomicI64,
    /// One past the highest offset written to a stage file.
    pub(crate) flushed_offset: AtomicI64,
    /// One past the highest offset promised to the upstream log.
    pub(crate) committed_offset: AtomicI64,
    pub(crate) previous_flush_time: AtomicI64,

    pub(crate) force_cleaner_file_reset: AtomicBool,
    pub(crate) is_stopped: Arc<AtomicBool>,
}

/// Sink pipeline for one (topic, partition).
pub struct ServiceContext {
    shared: Arc<ContextShared>,
    has_initialized: bool,
    cleaner_handle: Option<JoinHandle<()>>,
    reprocess_handle: Option<JoinHandle<()>>,
}

impl ServiceContext {
    pub(crate) fn new(
        table_name: String,
        partition: u32,
        conn: Arc<dyn ConnectionService>,
        settings: Arc<SinkSettings>,
        clock: Arc<dyn Clock>,
        telemetry: Arc<dyn TelemetryService>,
        is_stopped: Arc<AtomicBool>,
    ) -> Self {
        let connector_name = conn.connector_name().to_string();
        let stage_name = names::stage_name(&connector_name, &table_name);
        let pipe_name = names::pipe_name(&connector_name, &table_name, partition);
        let prefix = file_name::file_prefix(&connector_name, &table_name, partition);
        let ingestion = conn.build_ingest_service(&stage_name, &pipe_name);
        let pipe_status = Arc::new(PipeStatus::new(
            &table_name,
            &stage_name,
            &pipe_name,
            &connector_name,
        ));
        let now = clock.now_millis();

        info!(pipe = %pipe_name, "pipe service started");

        Self {
            shared: Arc::new(ContextShared {
                table_name,
                stage_name,
                pipe_name,
                prefix,
                conn,
                ingestion,
                telemetry,
                clock,
                settings,
                pipe_status,
                buffer: Mutex::new(PartitionBuffer::new()),
                file_lists: Mutex::new(FileLists::default()),
                processed_offset: AtomicI64::new(-1),
                flushed_offset: AtomicI64::new(-1),
                committed_offset: AtomicI64::new(0),
                previous_flush_time: AtomicI64::new(now),
                force_cleaner_file_reset: AtomicBool::new(false),
                is_stopped,
            }),
            has_initialized: false,
            cleaner_handle: None,
            reprocess_handle: None,
        }
    }

    pub fn pipe_name(&self) -> &str {
        &self.shared.pipe_name
    }

    pub fn pipe_status(&self) -> Arc<PipeStatus> {
        Arc::clone(&self.shared.pipe_status)
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<ContextShared> {
        &self.shared
    }

    /// Insert one record into the pipeline.
    pub async fn insert(&mut self, record: SinkRecord) -> Result<()> {
        if !self.has_initialized {
            // Runs once, when the first offset arrives after start/rebalance.
            self.init(record.offset).await?;
            self.has_initialized = true;
        }

        let shared = &self.shared;
        if record.offset <= shared.processed_offset.load(Ordering::SeqCst) {
            debug!(
                pipe = %shared.pipe_name,
                offset = record.offset,
                "record already processed, dropping"
            );
            return Ok(());
        }

        // The null policy reads the unconverted variants: a community
        // tombstone is Null, a first-party tombstone is semantically empty
        // content. Payloads that merely parse to a null node are kept.
        if self.should_skip_null_value(&record) {
            return Ok(());
        }

        let mut record = record;
        record.value = record.value.into_converted();
        record.key = record.key.into_converted();

        if record.is_broken() {
            // Broken parts go to the table stage and the processed offset
            // stays put, so a repaired record at the same offset still flows.
            self.write_broken_record(&record).await?;
            return Ok(());
        }

        if let Some(ts) = record.timestamp {
            if record.timestamp_type != TimestampType::NoTimestampType {
                shared
                    .pipe_status
                    .record_lag
                    .record(shared.clock.now_millis() - ts);
            }
        }

        let row = shared.settings.serializer().serialize(&record)?;
        let row_size = (row.encode_utf16().count() * 2) as i64;

        let detached = {
            let mut buffer = shared.buffer.lock().unwrap();
            shared
                .processed_offset
                .store(record.offset, Ordering::SeqCst);
            shared
                .pipe_status
                .processed_offset
                .store(record.offset, Ordering::SeqCst);
            buffer.insert(record.offset, &row);
            shared
                .pipe_status
                .memory_usage
                .fetch_add(row_size, Ordering::SeqCst);

            let file_size = shared.settings.file_size();
            let record_num = shared.settings.record_num();
            if buffer.buffer_size() >= file_size
                || (record_num > 0 && buffer.num_of_records() >= record_num)
            {
                Some(std::mem::take(&mut *buffer))
            } else {
                None
            }
        };

        if let Some(buf) = detached {
            self.flush(buf).await?;
        }
        Ok(())
    }

    /// Whether the idle-flush window has elapsed since the last flush.
    pub fn should_flush(&self) -> bool {
        let shared = &self.shared;
        shared.clock.now_millis() - shared.previous_flush_time.load(Ordering::SeqCst)
            >= shared.settings.flush_time_secs() * 1000
    }

    /// Detach and flush the buffer if it holds anything.
    pub async fn flush_buffer(&self) -> Result<()> {
        let detached = {
            let mut buffer = self.shared.buffer.lock().unwrap();
            if buffer.is_empty() {
                None
            } else {
                Some(std::mem::take(&mut *buffer))
            }
        };
        if let Some(buf) = detached {
            self.flush(buf).await?;
        }
        Ok(())
    }

    /// The committable offset; drives the ingestion trigger.
    ///
    /// Ingest requests are batched at commit time: flushing only uploads, and
    /// the framework's periodic commit callback hands every file flushed
    /// since the previous call to the ingestion service.
    pub async fn get_offset(&self) -> Result<i64> {
        let shared = &self.shared;
        let files = {
            let mut lists = shared.file_lists.lock().unwrap();
            if lists.file_names.is_empty() {
                return Ok(shared.committed_offset.load(Ordering::SeqCst));
            }
            std::mem::take(&mut lists.file_names)
        };

        shared.committed_offset.store(
            shared.flushed_offset.load(Ordering::SeqCst),
            Ordering::SeqCst,
        );

        let now = shared.clock.now_millis();
        shared.pipe_status.committed_offset.store(
            shared.committed_offset.load(Ordering::SeqCst) - 1,
            Ordering::SeqCst,
        );
        shared
            .pipe_status
            .file_count_on_ingestion
            .fetch_add(files.len() as i64, Ordering::SeqCst);
        for name in &files {
            shared
                .pipe_status
                .commit_lag
                .record(now - file_name::time_ingested(name)?);
        }

        info!(pipe = %shared.pipe_name, files = ?files, "triggering ingest");
        shared.ingestion.ingest_files(files).await?;

        Ok(shared.committed_offset.load(Ordering::SeqCst))
    }

    pub fn is_buffer_empty(&self) -> bool {
        self.shared.buffer.lock().unwrap().is_empty()
    }

    /// Stop the cleaner tasks, close the ingestion service and emit the final
    /// telemetry report.
    pub async fn close(&mut self) {
        if let Some(handle) = self.cleaner_handle.take() {
            handle.abort();
            let _ = handle.await;
        }
        if let Some(handle) = self.reprocess_handle.take() {
            handle.abort();
            let _ = handle.await;
        }
        self.shared.ingestion.close();
        self.shared
            .telemetry
            .report_pipe_usage(&self.shared.pipe_status, true);
        info!(pipe = %self.shared.pipe_name, "pipe service closed");
    }

    // ---------------------------------------------------------------
    // Initialization
    // ---------------------------------------------------------------

    async fn init(&mut self, record_offset: i64) -> Result<()> {
        info!(pipe = %self.shared.pipe_name, "initializing pipe");
        let creation = PipeCreation::new(
            &self.shared.table_name,
            &self.shared.stage_name,
            &self.shared.pipe_name,
            self.shared.conn.connector_name(),
        );

        self.ensure_table_stage_pipe(&creation).await?;
        let reprocess_files = self.recover(record_offset, &creation).await?;
        self.start_cleaner(reprocess_files);
        self.shared.telemetry.report_pipe_start(&creation);
        Ok(())
    }

    /// Check existence then compatibility for table, stage and pipe in
    /// order, creating whatever is missing. An existing but incompatible
    /// object is fatal.
    async fn ensure_table_stage_pipe(&self, creation: &PipeCreation) -> Result<()> {
        let shared = &self.shared;

        if shared.conn.table_exist(&shared.table_name).await? {
            if !shared.conn.is_table_compatible(&shared.table_name).await? {
                return Err(SinkError::IncompatibleTable {
                    table: shared.table_name.clone(),
                });
            }
            info!(table = %shared.table_name, "using existing table");
            creation.is_reuse_table.store(true, Ordering::SeqCst);
        } else {
            info!(table = %shared.table_name, "creating new table");
            shared.conn.create_table(&shared.table_name).await?;
        }

        if shared.conn.stage_exist(&shared.stage_name).await? {
            if !shared.conn.is_stage_compatible(&shared.stage_name).await? {
                return Err(SinkError::IncompatibleStage {
                    stage: shared.stage_name.clone(),
                });
            }
            info!(stage = %shared.stage_name, "using existing stage");
            creation.is_reuse_stage.store(true, Ordering::SeqCst);
        } else {
            info!(stage = %shared.stage_name, "creating new stage");
            shared.conn.create_stage(&shared.stage_name).await?;
        }

        if shared.conn.pipe_exist(&shared.pipe_name).await? {
            if !shared
                .conn
                .is_pipe_compatible(&shared.table_name, &shared.stage_name, &shared.pipe_name)
                .await?
            {
                return Err(SinkError::IncompatiblePipe {
                    pipe: shared.pipe_name.clone(),
                });
            }
            info!(pipe = %shared.pipe_name, "recovered from existing pipe");
            creation.is_reuse_pipe.store(true, Ordering::SeqCst);
        } else {
            shared
                .conn
                .create_pipe(&shared.table_name, &shared.stage_name, &shared.pipe_name)
                .await?;
        }

        Ok(())
    }

    /// Enumerate the stage and split leftover files into the reprocess set
    /// (start offset at or past the incoming record: the upstream will
    /// redeliver that data, so the stage copy is redundant) and the preserve
    /// set (presumed in flight on the ingestion service, to be reconciled).
    ///
    /// Returns the reprocess set; the preserve set seeds the cleaner list.
    async fn recover(
        &self,
        first_record_offset: i64,
        creation: &PipeCreation,
    ) -> Result<Vec<String>> {
        let shared = &self.shared;
        let files_on_stage = shared
            .conn
            .list_stage(&shared.stage_name, &shared.prefix)
            .await?;

        creation
            .file_count_restart
            .store(files_on_stage.len() as i64, Ordering::SeqCst);

        let mut reprocess_files = Vec::new();
        let mut preserved_files = Vec::new();
        for name in files_on_stage {
            if file_name::start_offset(&name)? >= first_record_offset {
                reprocess_files.push(name);
            } else {
                preserved_files.push(name);
            }
        }

        creation
            .file_count_reprocess_purge
            .store(reprocess_files.len() as i64, Ordering::SeqCst);
        // Preserved files must be on ingestion, otherwise their offsets could
        // not have been committed and the reprocess filter would have taken
        // them.
        shared
            .pipe_status
            .file_count_on_ingestion
            .fetch_add(preserved_files.len() as i64, Ordering::SeqCst);
        shared
            .pipe_status
            .file_count_on_stage
            .fetch_add(preserved_files.len() as i64, Ordering::SeqCst);

        if !reprocess_files.is_empty() {
            info!(
                pipe = %shared.pipe_name,
                count = reprocess_files.len(),
                "scheduling reprocess files for delayed purge"
            );
        }

        let mut lists = shared.file_lists.lock().unwrap();
        lists.cleaner_file_names.extend(preserved_files);
        Ok(reprocess_files)
    }

    fn start_cleaner(&mut self, reprocess_files: Vec<String>) {
        self.cleaner_handle = Some(cleaner::spawn(Arc::clone(&self.shared)));
        if !reprocess_files.is_empty() {
            self.reprocess_handle = Some(cleaner::spawn_reprocess_purge(
                Arc::clone(&self.shared),
                reprocess_files,
            ));
        }
    }

    // ---------------------------------------------------------------
    // Record handling
    // ---------------------------------------------------------------

    fn should_skip_null_value(&self, record: &SinkRecord) -> bool {
        if self.shared.settings.behavior_on_null_values() == BehaviorOnNullValues::Default {
            return false;
        }
        let value_is_null = match &record.value {
            RecordValue::Null => true,
            RecordValue::Content(content) => content.is_null_value(),
            RecordValue::Native { .. } => false,
        };
        if value_is_null {
            debug!(
                pipe = %self.shared.pipe_name,
                offset = record.offset,
                "null valued record skipped"
            );
        }
        value_is_null
    }

    async fn write_broken_record(&self, record: &SinkRecord) -> Result<()> {
        let shared = &self.shared;
        let now = shared.clock.now_millis();

        if let Some(key) = record.key.as_content() {
            let name =
                file_name::broken_record_file_name(&shared.prefix, record.offset, true, now);
            warn!(pipe = %shared.pipe_name, file = %name, "writing broken record key to table stage");
            shared
                .conn
                .put_to_table_stage(&shared.table_name, &name, key.to_stage_bytes())
                .await?;
            shared
                .pipe_status
                .file_count_table_stage_broken_record
                .fetch_add(1, Ordering::SeqCst);
        }
        if let Some(value) = record.value.as_content() {
            let name =
                file_name::broken_record_file_name(&shared.prefix, record.offset, false, now);
            warn!(pipe = %shared.pipe_name, file = %name, "writing broken record value to table stage");
            shared
                .conn
                .put_to_table_stage(&shared.table_name, &name, value.to_stage_bytes())
                .await?;
            shared
                .pipe_status
                .file_count_table_stage_broken_record
                .fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Flushing
    // ---------------------------------------------------------------

    /// Upload a detached buffer as one stage file.
    ///
    /// The buffer was already swapped out, so a failed upload loses nothing
    /// locally: the flushed offset stays put and the error escalates to the
    /// framework, which restarts the task and re-runs recovery.
    async fn flush(&self, buf: PartitionBuffer) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let shared = &self.shared;
        let now = shared.clock.now_millis();
        let name = file_name::file_name(&shared.prefix, buf.first_offset(), buf.last_offset(), now);

        shared
            .conn
            .put_with_cache(&shared.stage_name, &name, buf.data())
            .await?;

        shared
            .flushed_offset
            .fetch_max(buf.last_offset() + 1, Ordering::SeqCst);
        shared.pipe_status.flushed_offset.store(
            shared.flushed_offset.load(Ordering::SeqCst) - 1,
            Ordering::SeqCst,
        );
        shared
            .pipe_status
            .file_count_on_stage
            .fetch_add(1, Ordering::SeqCst);
        shared.pipe_status.memory_usage.store(0, Ordering::SeqCst);
        shared
            .pipe_status
            .total_size_of_data
            .fetch_add(buf.buffer_size(), Ordering::SeqCst);
        shared
            .pipe_status
            .total_number_of_records
            .fetch_add(buf.num_of_records(), Ordering::SeqCst);
        shared.previous_flush_time.store(now, Ordering::SeqCst);

        {
            let mut lists = shared.file_lists.lock().unwrap();
            lists.file_names.push(name.clone());
            lists.cleaner_file_names.push(name.clone());
        }

        info!(
            pipe = %shared.pipe_name,
            file = %name,
            records = buf.num_of_records(),
            bytes = buf.buffer_size(),
            "flushed buffer to stage"
        );
        Ok(())
    }
}
