//! Job Service
//!
//! The request-facing surface: stage an upload, start a job, poll progress,
//! fetch the output reference and delete a job. Also owns the periodic sweep
//! that evicts expired records.

use crate::config::{Config, ObjectStoreConfig, StoreBackend};
use crate::controller::{JobController, JobRequest};
use crate::dispatch::{CancellationRegistry, JobQueue};
use crate::error::{JobError, Result};
use crate::inference::{Enhancer, NearestEnhancer, OnnxEnhancer};
use crate::job_store::{JobStore, MemoryJobStore};
use crate::metrics;
use crate::object_store::{HttpObjectStore, LocalObjectStore, ObjectStore};
use crate::persistent_store::SledJobStore;
use crate::record::{JobRecord, JobStatus, ProgressView};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Store backend selected by configuration
pub fn build_store(config: &Config) -> Result<Arc<dyn JobStore>> {
    match config.store.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryJobStore::new())),
        StoreBackend::Sled => Ok(Arc::new(SledJobStore::open(&config.store.sled_path)?)),
    }
}

/// ONNX model when one is configured, nearest-neighbour otherwise
pub fn build_enhancer(config: &Config) -> Result<Arc<dyn Enhancer>> {
    match &config.model_path {
        Some(path) => Ok(Arc::new(OnnxEnhancer::load(
            path,
            config.tiling.scale,
            config.tiling.tile_pad,
        )?)),
        None => {
            warn!("MODEL_PATH not set, using nearest-neighbour upscaling");
            Ok(Arc::new(NearestEnhancer))
        }
    }
}

pub fn build_object_store(config: &Config) -> Result<Option<Arc<dyn ObjectStore>>> {
    Ok(match &config.object_store {
        Some(ObjectStoreConfig::Directory(dir)) => Some(Arc::new(LocalObjectStore::new(dir.clone()))),
        Some(ObjectStoreConfig::Http { base_url }) => Some(Arc::new(HttpObjectStore::new(base_url.clone())?)),
        None => None,
    })
}

pub struct UpscaleService {
    config: Arc<Config>,
    store: Arc<dyn JobStore>,
    queue: JobQueue,
    registry: Arc<CancellationRegistry>,
    sweep_cancel: CancellationToken,
    sweep_handle: Option<JoinHandle<()>>,
}

impl UpscaleService {
    /// Build every component from configuration and start the workers
    pub fn from_config(config: Config) -> Result<Self> {
        let store = build_store(&config)?;
        let enhancer = build_enhancer(&config)?;
        let object_store = build_object_store(&config)?;
        Self::start_with(config, store, enhancer, object_store)
    }

    /// Start with explicit components; used by tests to inject stubs
    pub fn start_with(
        config: Config,
        store: Arc<dyn JobStore>,
        enhancer: Arc<dyn Enhancer>,
        object_store: Option<Arc<dyn ObjectStore>>,
    ) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(config.inputs_dir())?;
        std::fs::create_dir_all(&config.output_dir)?;

        let config = Arc::new(config);
        let controller = JobController::new(store.clone(), enhancer, object_store, config.clone());
        let registry = Arc::new(CancellationRegistry::new());
        let mut queue = JobQueue::new(registry.clone());
        let workers = &config.worker_config;
        queue.spawn_queue(&workers.queue_name, workers.worker_count, workers.queue_capacity, controller);

        let sweep_cancel = CancellationToken::new();
        let sweep_handle = tokio::spawn(sweep_expired(
            store.clone(),
            Duration::from_secs(config.store.sweep_interval_secs.max(1)),
            sweep_cancel.clone(),
        ));

        info!(
            queue = %workers.queue_name,
            workers = workers.worker_count,
            backend = ?config.store.backend,
            "Upscale service started"
        );

        Ok(Self {
            config,
            store,
            queue,
            registry,
            sweep_cancel,
            sweep_handle: Some(sweep_handle),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Persist uploaded bytes as `inputs/<id><ext>`, keeping the upload's extension
    pub async fn stage_upload(&self, id: &str, file_name: &str, bytes: &[u8]) -> Result<PathBuf> {
        validate_id(id)?;
        let path = match Path::new(file_name).extension().and_then(|e| e.to_str()) {
            Some(ext) => self.config.inputs_dir().join(format!("{}.{}", id, ext.to_ascii_lowercase())),
            None => self.config.inputs_dir().join(id),
        };
        tokio::fs::create_dir_all(self.config.inputs_dir()).await?;
        tokio::fs::write(&path, bytes).await?;
        info!(job_id = %id, path = %path.display(), bytes = bytes.len(), "Upload staged");
        Ok(path)
    }

    /// Create the queued record for a staged input and dispatch it.
    ///
    /// An id whose job is still active or already done is refused until it
    /// is deleted; only an errored job may be started again.
    pub async fn start(&self, id: &str) -> Result<()> {
        validate_id(id)?;
        if let Some(existing) = self.store.read(id)? {
            if existing.status != JobStatus::Error {
                return Err(JobError::JobExists(format!("{} is {}", id, existing.status)));
            }
        }
        let input_path = self.find_staged_input(id).await?;
        let request = JobRequest::with_defaults(id, input_path, &self.config);
        request.params()?;

        let expiry = self.config.store.record_expiry();
        self.store.write(id, &JobRecord::queued(id), expiry)?;

        if let Err(e) = self
            .queue
            .enqueue(request, &self.config.worker_config.queue_name)
            .await
        {
            // nothing will ever advance this record
            self.store.delete(id)?;
            return Err(e);
        }
        metrics::JOBS_SUBMITTED.inc();
        info!(job_id = %id, "Job queued");
        Ok(())
    }

    pub fn progress(&self, id: &str) -> Result<ProgressView> {
        self.store
            .read(id)?
            .map(|record| ProgressView::from(&record))
            .ok_or_else(|| JobError::JobNotFound(id.to_string()))
    }

    /// Output reference of a finished job
    pub fn download(&self, id: &str) -> Result<String> {
        let record = self
            .store
            .read(id)?
            .ok_or_else(|| JobError::JobNotFound(id.to_string()))?;
        match (record.is_done(), record.output_reference) {
            (true, Some(reference)) => Ok(reference),
            _ => Err(JobError::OutputNotReady(format!("{} is {}", id, record.status))),
        }
    }

    /// Cancel an in-flight job, remove its local output and delete the record
    pub async fn delete(&self, id: &str) -> Result<()> {
        let record = self
            .store
            .read(id)?
            .ok_or_else(|| JobError::JobNotFound(id.to_string()))?;

        if self.registry.cancel(id) {
            debug!(job_id = %id, "Cancellation signalled");
        }

        if let Some(reference) = &record.output_reference {
            let path = Path::new(reference);
            if path.is_absolute() || path.starts_with(&self.config.output_dir) {
                match tokio::fs::remove_file(path).await {
                    Ok(()) => debug!(job_id = %id, path = %path.display(), "Output removed"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!(job_id = %id, error = %e, "Failed to remove output"),
                }
            }
        }

        self.store.delete(id)?;
        info!(job_id = %id, "Job deleted");
        Ok(())
    }

    async fn find_staged_input(&self, id: &str) -> Result<PathBuf> {
        let mut entries = match tokio::fs::read_dir(self.config.inputs_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(JobError::InputNotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.file_stem().and_then(|s| s.to_str()) == Some(id) {
                return Ok(path);
            }
        }
        Err(JobError::InputNotFound(id.to_string()))
    }

    /// Stop the sweep, cancel in-flight jobs and wait for workers to exit
    pub async fn shutdown(mut self) {
        self.sweep_cancel.cancel();
        if let Some(handle) = self.sweep_handle.take() {
            let _ = handle.await;
        }
        let abandoned = self.queue.shutdown().await;
        info!(abandoned = abandoned, "Upscale service stopped");
    }
}

/// Ids become file names, so path separators and dot segments are refused
fn validate_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(JobError::InvalidParameters(format!("invalid job id: {:?}", id)))
    }
}

/// Periodically evict expired records until `cancel` fires
pub async fn sweep_expired(store: Arc<dyn JobStore>, every: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Record sweep stopping");
                break;
            }
            _ = interval.tick() => {
                match store.purge_expired() {
                    Ok(0) => {}
                    Ok(purged) => debug!(purged = purged, "Expired job records swept"),
                    Err(e) => warn!(error = %e, "Record sweep failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_store::Expiry;

    #[test]
    fn test_id_validation() {
        assert!(validate_id("3f2b-11aa_x").is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id("..").is_err());
        assert!(validate_id("../etc").is_err());
        assert!(validate_id("a/b").is_err());
    }

    #[test]
    fn test_build_store_by_backend() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.store.sled_path = dir.path().join("jobs_db");

        assert!(build_store(&config).is_ok());
        config.store.backend = StoreBackend::Sled;
        let store = build_store(&config).unwrap();
        store.write("x", &JobRecord::queued("x"), Expiry::Never).unwrap();
        assert!(store.read("x").unwrap().is_some());
    }
}
