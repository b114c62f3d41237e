//! In-memory connection and ingestion backend.
//!
//! Implements the connection and ingestion contracts over an
//! `object_store::memory::InMemory` store. Used by the integration tests and
//! for local development: stage files live under `stages/{stage}/...`, the
//! quarantine area under `table_stages/{table}/...`, and ingestion outcomes
//! are scripted per file through [`InMemoryIngestion`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::ObjectStore;
use tracing::debug;

use crate::connection::{ConnectionService, IngestStatus, IngestionService};
use crate::error::{Result, SinkError};
use crate::telemetry::{LoggingTelemetry, TelemetryService};

#[derive(Debug, Default)]
struct WarehouseObjects {
    tables: HashSet<String>,
    stages: HashSet<String>,
    pipes: HashSet<String>,
    incompatible: HashSet<String>,
}

/// In-memory warehouse connection.
pub struct InMemoryConnection {
    connector_name: String,
    store: Arc<InMemory>,
    objects: Mutex<WarehouseObjects>,
    closed: AtomicBool,
    ingestion: Arc<InMemoryIngestion>,
    telemetry: Arc<dyn TelemetryService>,
}

impl InMemoryConnection {
    pub fn new(connector_name: &str) -> Self {
        Self {
            connector_name: connector_name.to_string(),
            store: Arc::new(InMemory::new()),
            objects: Mutex::new(WarehouseObjects::default()),
            closed: AtomicBool::new(false),
            ingestion: Arc::new(InMemoryIngestion::new()),
            telemetry: Arc::new(LoggingTelemetry),
        }
    }

    /// The shared ingestion backend, for scripting statuses in tests.
    pub fn ingestion(&self) -> Arc<InMemoryIngestion> {
        Arc::clone(&self.ingestion)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Mark an object name as incompatible so bootstrap fails on reuse.
    pub fn mark_incompatible(&self, name: &str) {
        self.objects
            .lock()
            .unwrap()
            .incompatible
            .insert(name.to_string());
    }

    /// Seed a file onto a stage, bypassing the sink (restart simulation).
    pub async fn seed_stage_file(
        &self,
        stage_name: &str,
        file_name: &str,
        content: &str,
    ) -> Result<()> {
        let path = stage_path(stage_name, file_name);
        self.store
            .put(&path, Bytes::from(content.to_string()).into())
            .await?;
        Ok(())
    }

    /// All file names currently on a stage.
    pub async fn stage_file_names(&self, stage_name: &str) -> Result<Vec<String>> {
        self.list_under(&format!("stages/{}", stage_name)).await
    }

    /// All file names currently on a table stage.
    pub async fn table_stage_file_names(&self, table_name: &str) -> Result<Vec<String>> {
        self.list_under(&format!("table_stages/{}", table_name)).await
    }

    /// Read the content of a staged file.
    pub async fn read_stage_file(&self, stage_name: &str, file_name: &str) -> Result<Bytes> {
        let path = stage_path(stage_name, file_name);
        Ok(self.store.get(&path).await?.bytes().await?)
    }

    async fn list_under(&self, root: &str) -> Result<Vec<String>> {
        let prefix = Path::from(root.to_string());
        let metas: Vec<_> = self.store.list(Some(&prefix)).try_collect().await?;
        let strip = format!("{}/", root);
        Ok(metas
            .into_iter()
            .map(|meta| {
                let location = meta.location.to_string();
                location
                    .strip_prefix(&strip)
                    .map(|s| s.to_string())
                    .unwrap_or(location)
            })
            .collect())
    }
}

fn stage_path(stage_name: &str, file_name: &str) -> Path {
    Path::from(format!("stages/{}/{}", stage_name, file_name))
}

fn table_stage_path(table_name: &str, file_name: &str) -> Path {
    Path::from(format!("table_stages/{}/{}", table_name, file_name))
}

#[async_trait]
impl ConnectionService for InMemoryConnection {
    fn connector_name(&self) -> &str {
        &self.connector_name
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn table_exist(&self, table_name: &str) -> Result<bool> {
        Ok(self.objects.lock().unwrap().tables.contains(table_name))
    }

    async fn stage_exist(&self, stage_name: &str) -> Result<bool> {
        Ok(self.objects.lock().unwrap().stages.contains(stage_name))
    }

    async fn pipe_exist(&self, pipe_name: &str) -> Result<bool> {
        Ok(self.objects.lock().unwrap().pipes.contains(pipe_name))
    }

    async fn is_table_compatible(&self, table_name: &str) -> Result<bool> {
        Ok(!self.objects.lock().unwrap().incompatible.contains(table_name))
    }

    async fn is_stage_compatible(&self, stage_name: &str) -> Result<bool> {
        Ok(!self.objects.lock().unwrap().incompatible.contains(stage_name))
    }

    async fn is_pipe_compatible(
        &self,
        _table_name: &str,
        _stage_name: &str,
        pipe_name: &str,
    ) -> Result<bool> {
        Ok(!self.objects.lock().unwrap().incompatible.contains(pipe_name))
    }

    async fn create_table(&self, table_name: &str) -> Result<()> {
        self.objects
            .lock()
            .unwrap()
            .tables
            .insert(table_name.to_string());
        Ok(())
    }

    async fn create_stage(&self, stage_name: &str) -> Result<()> {
        self.objects
            .lock()
            .unwrap()
            .stages
            .insert(stage_name.to_string());
        Ok(())
    }

    async fn create_pipe(
        &self,
        _table_name: &str,
        _stage_name: &str,
        pipe_name: &str,
    ) -> Result<()> {
        self.objects
            .lock()
            .unwrap()
            .pipes
            .insert(pipe_name.to_string());
        Ok(())
    }

    async fn list_stage(&self, stage_name: &str, prefix: &str) -> Result<Vec<String>> {
        let root = format!("stages/{}", stage_name);
        let listing = self.list_under(&root).await?;
        let wanted = format!("{}/", prefix);
        Ok(listing
            .into_iter()
            .filter(|name| name.starts_with(&wanted))
            .collect())
    }

    async fn put_with_cache(&self, stage_name: &str, file_name: &str, content: &str) -> Result<()> {
        let path = stage_path(stage_name, file_name);
        self.store
            .put(&path, Bytes::from(content.to_string()).into())
            .await?;
        debug!(stage = %stage_name, file = %file_name, "staged file written");
        Ok(())
    }

    async fn put_to_table_stage(
        &self,
        table_name: &str,
        file_name: &str,
        content: Bytes,
    ) -> Result<()> {
        let path = table_stage_path(table_name, file_name);
        self.store.put(&path, content.into()).await?;
        Ok(())
    }

    async fn purge_stage(&self, stage_name: &str, files: &[String]) -> Result<()> {
        for file_name in files {
            match self.store.delete(&stage_path(stage_name, file_name)).await {
                Ok(()) => {}
                Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn move_to_table_stage(
        &self,
        table_name: &str,
        stage_name: &str,
        files: &[String],
    ) -> Result<()> {
        for file_name in files {
            let from = stage_path(stage_name, file_name);
            let content = self.store.get(&from).await?.bytes().await?;
            self.store
                .put(&table_stage_path(table_name, file_name), content.into())
                .await?;
            self.store.delete(&from).await?;
        }
        Ok(())
    }

    fn build_ingest_service(
        &self,
        _stage_name: &str,
        _pipe_name: &str,
    ) -> Arc<dyn IngestionService> {
        Arc::clone(&self.ingestion) as Arc<dyn IngestionService>
    }

    fn telemetry_client(&self) -> Arc<dyn TelemetryService> {
        Arc::clone(&self.telemetry)
    }
}

/// In-memory ingestion backend with scriptable per-file statuses.
///
/// The report and history sources are separate maps, mirroring the different
/// retention windows of the real endpoints.
pub struct InMemoryIngestion {
    report: Mutex<HashMap<String, IngestStatus>>,
    history: Mutex<HashMap<String, IngestStatus>>,
    ingest_requests: Mutex<Vec<Vec<String>>>,
    fail_next_ingest: AtomicBool,
    closed: AtomicBool,
}

impl Default for InMemoryIngestion {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryIngestion {
    pub fn new() -> Self {
        Self {
            report: Mutex::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
            ingest_requests: Mutex::new(Vec::new()),
            fail_next_ingest: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Script the ingest-report status of a file.
    pub fn set_report_status(&self, file_name: &str, status: IngestStatus) {
        self.report
            .lock()
            .unwrap()
            .insert(file_name.to_string(), status);
    }

    /// Script the load-history status of a file.
    pub fn set_history_status(&self, file_name: &str, status: IngestStatus) {
        self.history
            .lock()
            .unwrap()
            .insert(file_name.to_string(), status);
    }

    /// Make the next `ingest_files` call fail after its internal backoff.
    pub fn fail_next_ingest(&self) {
        self.fail_next_ingest.store(true, Ordering::SeqCst);
    }

    /// Every batch handed to `ingest_files`, in call order.
    pub fn ingest_requests(&self) -> Vec<Vec<String>> {
        self.ingest_requests.lock().unwrap().clone()
    }

    /// All files ever handed to `ingest_files`.
    pub fn ingested_files(&self) -> Vec<String> {
        self.ingest_requests
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IngestionService for InMemoryIngestion {
    async fn ingest_files(&self, files: Vec<String>) -> Result<()> {
        if self.fail_next_ingest.swap(false, Ordering::SeqCst) {
            return Err(SinkError::Ingest(
                "ingest request failed after backoff".to_string(),
            ));
        }
        self.ingest_requests.lock().unwrap().push(files);
        Ok(())
    }

    async fn read_ingest_report(&self, files: &[String]) -> Result<HashMap<String, IngestStatus>> {
        let report = self.report.lock().unwrap();
        Ok(files
            .iter()
            .filter_map(|name| report.get(name).map(|status| (name.clone(), *status)))
            .collect())
    }

    async fn read_one_hour_history(
        &self,
        files: &[String],
        _since_millis: i64,
    ) -> Result<HashMap<String, IngestStatus>> {
        let history = self.history.lock().unwrap();
        Ok(files
            .iter()
            .filter_map(|name| history.get(name).map(|status| (name.clone(), *status)))
            .collect())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
