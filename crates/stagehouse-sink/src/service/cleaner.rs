//! Periodic stage reconciliation.
//!
//! One cleaner task runs per service context. Every cycle it takes ownership
//! of the files under reconciliation and resolves each one against two
//! status sources with different retention: the ingest report answers for
//! recent files at low latency, while the load history scans a full hour and
//! is authoritative for files the report has already forgotten. Files
//! confirmed loaded are purged from the stage; failed, partially loaded and
//! over-age files are quarantined on the table stage; everything else goes
//! back on the list for the next cycle.
//!
//! A failed cycle never corrupts state: the cleaner flags a forced reset and
//! rebuilds its list from a fresh stage listing, so no in-flight file is
//! forgotten.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use stagehouse_core::file_name;

use crate::connection::IngestStatus;
use crate::error::Result;
use crate::service::context::ContextShared;

pub(crate) const ONE_HOUR_MS: i64 = 60 * 60 * 1000;
pub(crate) const TEN_MINUTES_MS: i64 = 10 * 60 * 1000;

/// Spawn the reconciliation loop for one context.
pub(crate) fn spawn(shared: Arc<ContextShared>) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(pipe = %shared.pipe_name, "cleaner started");
        let interval = Duration::from_millis(shared.settings.cleaner_interval_ms() as u64);

        while !shared.is_stopped.load(Ordering::SeqCst) {
            shared
                .telemetry
                .report_pipe_usage(&shared.pipe_status, false);
            tokio::time::sleep(interval).await;
            if shared.is_stopped.load(Ordering::SeqCst) {
                break;
            }

            if shared.force_cleaner_file_reset.load(Ordering::SeqCst)
                && !reset_cleaner_files(&shared).await
            {
                // Reset failed; try again next cycle.
                continue;
            }

            if let Err(e) = check_status(&shared).await {
                warn!(pipe = %shared.pipe_name, error = %e, "cleaner cycle failed");
                shared.telemetry.report_fatal_error(&e.to_string());
                shared
                    .force_cleaner_file_reset
                    .store(true, Ordering::SeqCst);
            }
        }
        info!(pipe = %shared.pipe_name, "cleaner terminated");
    })
}

/// Spawn the one-shot delayed purge of the recovery reprocess set.
///
/// The upstream log will redeliver these offsets, so the stage copies are
/// deleted after one cleaner period rather than reconciled.
pub(crate) fn spawn_reprocess_purge(
    shared: Arc<ContextShared>,
    files: Vec<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let delay = Duration::from_millis(shared.settings.cleaner_interval_ms() as u64);
        tokio::time::sleep(delay).await;
        info!(
            pipe = %shared.pipe_name,
            count = files.len(),
            "purging reprocess files"
        );
        if let Err(e) = shared.conn.purge_stage(&shared.stage_name, &files).await {
            error!(pipe = %shared.pipe_name, error = %e, "reprocess purge failed");
        }
    })
}

/// Re-list the stage and union the result into the cleaner list.
///
/// Returns true when the reset succeeded and the flag was cleared.
async fn reset_cleaner_files(shared: &ContextShared) -> bool {
    warn!(pipe = %shared.pipe_name, "resetting cleaner files");
    shared
        .pipe_status
        .cleaner_restart_count
        .fetch_add(1, Ordering::SeqCst);

    match shared
        .conn
        .list_stage(&shared.stage_name, &shared.prefix)
        .await
    {
        Ok(listed) => {
            {
                let mut lists = shared.file_lists.lock().unwrap();
                for name in listed {
                    if !lists.cleaner_file_names.contains(&name) {
                        lists.cleaner_file_names.push(name);
                    }
                }
            }
            shared
                .force_cleaner_file_reset
                .store(false, Ordering::SeqCst);
            warn!(pipe = %shared.pipe_name, "cleaner file reset done");
            true
        }
        Err(e) => {
            warn!(pipe = %shared.pipe_name, error = %e, "cleaner file reset failed");
            false
        }
    }
}

/// One reconciliation pass over the current cleaner list.
pub(crate) async fn check_status(shared: &ContextShared) -> Result<()> {
    let mut tmp_file_names = {
        let mut lists = shared.file_lists.lock().unwrap();
        std::mem::take(&mut lists.cleaner_file_names)
    };

    let now = shared.clock.now_millis();
    let mut loaded_files: Vec<String> = Vec::new();
    let mut failed_files: Vec<String> = Vec::new();

    // Recent files answer here; anything the report has forgotten stays in
    // the list for the aging passes below.
    let report = shared.ingestion.read_ingest_report(&tmp_file_names).await?;
    filter_scan_result(report, &mut tmp_file_names, &mut loaded_files, &mut failed_files);

    // Age pass over a snapshot: over an hour with no terminal status is a
    // failure; over ten minutes means the report window has lapsed and the
    // load history must be consulted.
    let mut old_files: Vec<String> = Vec::new();
    for name in tmp_file_names.clone() {
        let time = file_name::time_ingested(&name)?;
        if time < now - ONE_HOUR_MS {
            tmp_file_names.retain(|n| n != &name);
            failed_files.push(name);
        } else if time < now - TEN_MINUTES_MS {
            old_files.push(name);
        }
    }

    if !old_files.is_empty() {
        let history = shared
            .ingestion
            .read_one_hour_history(&tmp_file_names, now - ONE_HOUR_MS)
            .await?;
        filter_scan_result(history, &mut tmp_file_names, &mut loaded_files, &mut failed_files);
    }

    if !loaded_files.is_empty() {
        shared
            .conn
            .purge_stage(&shared.stage_name, &loaded_files)
            .await?;
    }
    if !failed_files.is_empty() {
        warn!(
            pipe = %shared.pipe_name,
            files = ?failed_files,
            "moving failed files to table stage"
        );
        shared
            .conn
            .move_to_table_stage(&shared.table_name, &shared.stage_name, &failed_files)
            .await?;
    }

    {
        // Files found in neither source wait for the next cycle.
        let mut lists = shared.file_lists.lock().unwrap();
        lists.cleaner_file_names.append(&mut tmp_file_names);
    }

    for name in &loaded_files {
        shared
            .pipe_status
            .purged_offset
            .fetch_max(file_name::end_offset(name)?, Ordering::SeqCst);
        shared
            .pipe_status
            .ingestion_lag
            .record(now - file_name::time_ingested(name)?);
    }
    let removed = (loaded_files.len() + failed_files.len()) as i64;
    shared
        .pipe_status
        .file_count_on_stage
        .fetch_add(-removed, Ordering::SeqCst);
    shared
        .pipe_status
        .file_count_on_ingestion
        .fetch_add(-removed, Ordering::SeqCst);
    shared
        .pipe_status
        .file_count_table_stage_ingest_fail
        .fetch_add(failed_files.len() as i64, Ordering::SeqCst);
    shared
        .pipe_status
        .file_count_purged
        .fetch_add(loaded_files.len() as i64, Ordering::SeqCst);

    Ok(())
}

/// Partition a status scan: loaded and failed files leave `all_files`, any
/// non-terminal status leaves the file in place.
fn filter_scan_result(
    file_status: HashMap<String, IngestStatus>,
    all_files: &mut Vec<String>,
    loaded_files: &mut Vec<String>,
    failed_files: &mut Vec<String>,
) {
    for (name, status) in file_status {
        match status {
            IngestStatus::Loaded => {
                all_files.retain(|n| n != &name);
                loaded_files.push(name);
            }
            IngestStatus::Failed | IngestStatus::PartiallyLoaded => {
                all_files.retain(|n| n != &name);
                failed_files.push(name);
            }
            _ => {}
        }
    }
}
