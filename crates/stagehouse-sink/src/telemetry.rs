//! Pipe telemetry.
//!
//! Every service context owns a [`PipeStatus`]: the counters and gauges that
//! describe the pipe's progress (offsets, file counts, lags). The status is
//! updated with plain atomics on the hot paths and periodically reported
//! through the [`TelemetryService`] capability, which keeps the core
//! decoupled from any particular metrics runtime.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use tracing::{error, info};

/// Running average / maximum of a latency series.
#[derive(Debug, Default)]
pub struct LagStats {
    sum: AtomicI64,
    count: AtomicI64,
    max: AtomicI64,
}

impl LagStats {
    pub fn record(&self, lag_ms: i64) {
        self.sum.fetch_add(lag_ms, Ordering::SeqCst);
        self.count.fetch_add(1, Ordering::SeqCst);
        self.max.fetch_max(lag_ms, Ordering::SeqCst);
    }

    pub fn average(&self) -> i64 {
        let count = self.count.load(Ordering::SeqCst);
        if count == 0 {
            return 0;
        }
        self.sum.load(Ordering::SeqCst) / count
    }

    pub fn max(&self) -> i64 {
        self.max.load(Ordering::SeqCst)
    }

    pub fn count(&self) -> i64 {
        self.count.load(Ordering::SeqCst)
    }
}

/// Counters and gauges for one pipe (one topic partition).
#[derive(Debug)]
pub struct PipeStatus {
    pub table_name: String,
    pub stage_name: String,
    pub pipe_name: String,
    pub connector_name: String,

    /// Highest offset observed by insert.
    pub processed_offset: AtomicI64,
    /// Highest offset persisted to the stage.
    pub flushed_offset: AtomicI64,
    /// Highest offset promised to the upstream log.
    pub committed_offset: AtomicI64,
    /// Highest end offset among purged files.
    pub purged_offset: AtomicI64,

    pub file_count_on_stage: AtomicI64,
    pub file_count_on_ingestion: AtomicI64,
    pub file_count_purged: AtomicI64,
    pub file_count_table_stage_ingest_fail: AtomicI64,
    pub file_count_table_stage_broken_record: AtomicI64,

    pub cleaner_restart_count: AtomicI64,
    pub memory_usage: AtomicI64,
    pub total_size_of_data: AtomicI64,
    pub total_number_of_records: AtomicI64,

    /// Log timestamp → sink arrival.
    pub record_lag: LagStats,
    /// Flush → ingestion trigger.
    pub commit_lag: LagStats,
    /// Flush → loaded confirmation.
    pub ingestion_lag: LagStats,
}

impl PipeStatus {
    pub fn new(table_name: &str, stage_name: &str, pipe_name: &str, connector_name: &str) -> Self {
        Self {
            table_name: table_name.to_string(),
            stage_name: stage_name.to_string(),
            pipe_name: pipe_name.to_string(),
            connector_name: connector_name.to_string(),
            processed_offset: AtomicI64::new(-1),
            flushed_offset: AtomicI64::new(-1),
            committed_offset: AtomicI64::new(-1),
            purged_offset: AtomicI64::new(-1),
            file_count_on_stage: AtomicI64::new(0),
            file_count_on_ingestion: AtomicI64::new(0),
            file_count_purged: AtomicI64::new(0),
            file_count_table_stage_ingest_fail: AtomicI64::new(0),
            file_count_table_stage_broken_record: AtomicI64::new(0),
            cleaner_restart_count: AtomicI64::new(0),
            memory_usage: AtomicI64::new(0),
            total_size_of_data: AtomicI64::new(0),
            total_number_of_records: AtomicI64::new(0),
            record_lag: LagStats::default(),
            commit_lag: LagStats::default(),
            ingestion_lag: LagStats::default(),
        }
    }
}

/// Creation-time report for one pipe: what was reused, what was created, and
/// what recovery found on the stage.
#[derive(Debug)]
pub struct PipeCreation {
    pub table_name: String,
    pub stage_name: String,
    pub pipe_name: String,
    pub connector_name: String,

    pub is_reuse_table: AtomicBool,
    pub is_reuse_stage: AtomicBool,
    pub is_reuse_pipe: AtomicBool,
    /// Files found on the stage at restart.
    pub file_count_restart: AtomicI64,
    /// Files scheduled for reprocess purge.
    pub file_count_reprocess_purge: AtomicI64,
}

impl PipeCreation {
    pub fn new(table_name: &str, stage_name: &str, pipe_name: &str, connector_name: &str) -> Self {
        Self {
            table_name: table_name.to_string(),
            stage_name: stage_name.to_string(),
            pipe_name: pipe_name.to_string(),
            connector_name: connector_name.to_string(),
            is_reuse_table: AtomicBool::new(false),
            is_reuse_stage: AtomicBool::new(false),
            is_reuse_pipe: AtomicBool::new(false),
            file_count_restart: AtomicI64::new(0),
            file_count_reprocess_purge: AtomicI64::new(0),
        }
    }
}

/// Telemetry sink capability.
pub trait TelemetryService: Send + Sync {
    fn report_pipe_start(&self, creation: &PipeCreation);
    fn report_pipe_usage(&self, status: &PipeStatus, is_closing: bool);
    fn report_fatal_error(&self, message: &str);
}

/// Telemetry sink that writes structured log events.
#[derive(Debug, Default)]
pub struct LoggingTelemetry;

impl TelemetryService for LoggingTelemetry {
    fn report_pipe_start(&self, creation: &PipeCreation) {
        info!(
            pipe = %creation.pipe_name,
            table = %creation.table_name,
            stage = %creation.stage_name,
            reuse_table = creation.is_reuse_table.load(Ordering::SeqCst),
            reuse_stage = creation.is_reuse_stage.load(Ordering::SeqCst),
            reuse_pipe = creation.is_reuse_pipe.load(Ordering::SeqCst),
            files_on_restart = creation.file_count_restart.load(Ordering::SeqCst),
            files_reprocess_purge = creation.file_count_reprocess_purge.load(Ordering::SeqCst),
            "pipe started"
        );
    }

    fn report_pipe_usage(&self, status: &PipeStatus, is_closing: bool) {
        info!(
            pipe = %status.pipe_name,
            is_closing,
            processed_offset = status.processed_offset.load(Ordering::SeqCst),
            flushed_offset = status.flushed_offset.load(Ordering::SeqCst),
            committed_offset = status.committed_offset.load(Ordering::SeqCst),
            purged_offset = status.purged_offset.load(Ordering::SeqCst),
            files_on_stage = status.file_count_on_stage.load(Ordering::SeqCst),
            files_on_ingestion = status.file_count_on_ingestion.load(Ordering::SeqCst),
            files_purged = status.file_count_purged.load(Ordering::SeqCst),
            avg_ingestion_lag_ms = status.ingestion_lag.average(),
            "pipe usage"
        );
    }

    fn report_fatal_error(&self, message: &str) {
        error!(message, "fatal pipe error");
    }
}
