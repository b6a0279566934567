//! Job Controller
//!
//! Runs one upscaling job end to end and owns every write to its record
//! while it runs:
//!
//! ```text
//! QUEUED -> RUNNING (0, then 5 once decoded) -> RUNNING (per tile, <= 99)
//!        -> FINALIZING -> DONE (100 + output reference in one write)
//! RUNNING | FINALIZING -> ERROR
//! ```
//!
//! Every progress write goes through [`JobStore::update`], which refuses to
//! recreate a missing record. A write that finds the record gone means the
//! job was deleted and the controller stops as cancelled.

use crate::codec::{self, output_path_for};
use crate::config::Config;
use crate::error::{JobError, Result};
use crate::inference::Enhancer;
use crate::job_store::{Expiry, JobStore};
use crate::metrics::{self, Timer};
use crate::object_store::ObjectStore;
use crate::record::{tile_progress, JobRecord, JobStatus};
use crate::stitch::{BufferMode, OutputBuffer};
use crate::tiling::{output_dimensions, schedule, TileParams};
use image::imageops;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Progress reported once the source image is decoded
pub const DECODED_PROGRESS: u8 = 5;

/// Everything a worker needs to run one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_id: String,
    pub input_path: PathBuf,
    pub scale: u32,
    pub tile_size: u32,
    pub tile_pad: u32,
    pub buffer_mode: BufferMode,
}

impl JobRequest {
    /// Request using the configured tiling and buffer defaults
    pub fn with_defaults(job_id: impl Into<String>, input_path: impl Into<PathBuf>, config: &Config) -> Self {
        Self {
            job_id: job_id.into(),
            input_path: input_path.into(),
            scale: config.tiling.scale,
            tile_size: config.tiling.tile_size,
            tile_pad: config.tiling.tile_pad,
            buffer_mode: config.buffer_mode,
        }
    }

    pub fn params(&self) -> Result<TileParams> {
        TileParams::new(self.tile_size, self.tile_pad, self.scale)
    }
}

#[derive(Clone)]
pub struct JobController {
    store: Arc<dyn JobStore>,
    enhancer: Arc<dyn Enhancer>,
    object_store: Option<Arc<dyn ObjectStore>>,
    config: Arc<Config>,
}

impl JobController {
    pub fn new(
        store: Arc<dyn JobStore>,
        enhancer: Arc<dyn Enhancer>,
        object_store: Option<Arc<dyn ObjectStore>>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            enhancer,
            object_store,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Where the finished raster for `request` is written
    pub fn output_path(&self, request: &JobRequest) -> PathBuf {
        output_path_for(&self.config.output_dir, &request.job_id, &request.input_path)
    }

    fn scratch_path(&self, job_id: &str) -> PathBuf {
        self.config.scratch_dir().join(format!("{}.rgb", job_id))
    }

    /// Run `request` to completion, returning the output reference.
    ///
    /// On failure the record is marked `error` (or deleted when configured),
    /// files this run created are removed, and the error is returned to the
    /// caller. A redelivered request for a finished job leaves the record and
    /// its output untouched.
    pub async fn run(&self, request: JobRequest, cancel: CancellationToken) -> Result<String> {
        let job_id = request.job_id.clone();
        if let Some(existing) = self.store.read(&job_id)? {
            if existing.status.is_terminal() {
                info!(job_id = %job_id, status = %existing.status, "Ignoring redelivered job");
                return match existing.output_reference {
                    Some(reference) if existing.status == JobStatus::Done => Ok(reference),
                    _ => Err(JobError::AlreadyFinished(job_id)),
                };
            }
        }

        info!(
            job_id = %job_id,
            input = %request.input_path.display(),
            scale = request.scale,
            enhancer = self.enhancer.name(),
            "Job started"
        );

        metrics::JOBS_RUNNING.inc();
        let mut created = RunArtifacts::default();
        let result = self.execute(&request, &cancel, &mut created).await;
        metrics::JOBS_RUNNING.dec();

        match &result {
            Ok(reference) => {
                metrics::JOBS_COMPLETED.inc();
                info!(job_id = %job_id, output = %reference, "Job done");
            }
            Err(err) => {
                if matches!(err, JobError::Cancelled(_)) {
                    metrics::JOBS_CANCELLED.inc();
                    info!(job_id = %job_id, reason = %err, "Job cancelled");
                } else {
                    metrics::JOBS_FAILED.inc();
                    error!(job_id = %job_id, error = %err, "Job failed");
                }
                self.remove_created(&request, &created);
                self.record_failure(&job_id, err);
            }
        }
        result
    }

    async fn execute(
        &self,
        request: &JobRequest,
        cancel: &CancellationToken,
        created: &mut RunArtifacts,
    ) -> Result<String> {
        let job_id = request.job_id.as_str();
        ensure_live(job_id, cancel)?;

        let started = chrono::Utc::now().to_rfc3339();
        self.advance(job_id, JobStatus::Running, |r| {
            r.progress = 0;
            r.started_time = Some(started.clone());
        })?;

        let params = request.params()?;
        let source = Arc::new(codec::load_rgb(&request.input_path, &self.config.load_retry).await?);
        let (src_w, src_h) = source.dimensions();
        self.advance(job_id, JobStatus::Running, |r| r.progress = DECODED_PROGRESS)?;

        let windows = schedule(src_w, src_h, &params)?;
        let (out_w, out_h) = output_dimensions(src_w, src_h, params.scale)?;
        let mut buffer = OutputBuffer::create(
            out_w,
            out_h,
            params.scale,
            request.buffer_mode,
            self.config.mmap_threshold_bytes,
            &self.scratch_path(job_id),
        )?;
        created.scratch = true;
        debug!(
            job_id = %job_id,
            width = src_w,
            height = src_h,
            tiles = windows.len(),
            output = ?buffer.dimensions(),
            buffer = buffer.mode().as_str(),
            "Tiling source"
        );

        let total = windows.len();
        for (index, window) in windows.into_iter().enumerate() {
            ensure_live(job_id, cancel)?;

            let timer = Timer::new();
            let enhancer = self.enhancer.clone();
            let source = source.clone();
            let scale = params.scale;
            let (returned, pasted) = tokio::task::spawn_blocking(move || {
                let tile = imageops::crop_imm(&*source, window.x, window.y, window.width, window.height)
                    .to_image();
                let result = enhancer
                    .enhance(&tile, scale)
                    .and_then(|upscaled| buffer.paste(&window, &upscaled));
                (buffer, result)
            })
            .await?;
            buffer = returned;
            pasted?;
            timer.observe_duration_seconds(&metrics::TILE_LATENCY);
            metrics::TILES_PROCESSED.inc();

            let progress = tile_progress(index + 1, total);
            self.advance(job_id, JobStatus::Running, |r| r.progress = progress)?;
            debug!(
                job_id = %job_id,
                tile = index + 1,
                total = total,
                progress = progress,
                elapsed_ms = timer.elapsed().as_millis() as u64,
                "Tile stitched"
            );
        }

        ensure_live(job_id, cancel)?;
        self.advance(job_id, JobStatus::Finalizing, |_| {})?;

        let timer = Timer::new();
        let output_path = self.output_path(request);
        let input_path = request.input_path.clone();
        let target = output_path.clone();
        created.output = true;
        tokio::task::spawn_blocking(move || buffer.finalize(&target, &input_path)).await??;

        let reference = match &self.object_store {
            Some(store) => {
                let key = output_path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| job_id.to_string());
                let reference = store.put(&output_path, &key).await?;
                // the stored copy is now the only one the record points at
                remove_if_exists(&output_path);
                reference
            }
            None => output_path.to_string_lossy().to_string(),
        };
        timer.observe_duration_seconds(&metrics::FINALIZE_LATENCY);

        let completed = chrono::Utc::now().to_rfc3339();
        self.advance(job_id, JobStatus::Done, |r| {
            r.progress = 100;
            r.completed_time = Some(completed.clone());
            r.output_reference = Some(reference.clone());
        })?;

        Ok(reference)
    }

    /// Move the record to `next`, applying `apply` in the same write
    fn advance(
        &self,
        job_id: &str,
        next: JobStatus,
        mut apply: impl FnMut(&mut JobRecord),
    ) -> Result<JobRecord> {
        let mut illegal = None;
        let updated = self.store.update(
            job_id,
            self.config.store.record_expiry(),
            &mut |record: &mut JobRecord| {
                if record.status.can_transition_to(next) {
                    record.status = next;
                    apply(record);
                } else {
                    illegal = Some(record.status);
                }
            },
        )?;

        if let Some(current) = illegal {
            return Err(JobError::Storage(format!(
                "job {} cannot move from {} to {}",
                job_id, current, next
            )));
        }
        updated.ok_or_else(|| JobError::Cancelled(format!("record for {} was removed", job_id)))
    }

    /// Record that `job_id` failed with `err`.
    ///
    /// Running and finalizing records become `error`; a record that never
    /// left `queued` is deleted, and finished records are left alone.
    pub(crate) fn record_failure(&self, job_id: &str, err: &JobError) {
        let store_config = &self.config.store;
        let status = match self.store.read(job_id) {
            Ok(Some(record)) => record.status,
            Ok(None) => {
                debug!(job_id = %job_id, "Record already gone, nothing to mark");
                return;
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Failed to read record after failure");
                return;
            }
        };

        if status.is_terminal() {
            debug!(job_id = %job_id, status = %status, "Record already finished, left as is");
            return;
        }
        if status == JobStatus::Queued || store_config.delete_record_on_error {
            match self.store.delete(job_id) {
                Ok(_) => debug!(job_id = %job_id, status = %status, "Record deleted after failure"),
                Err(e) => warn!(job_id = %job_id, error = %e, "Failed to delete errored record"),
            }
            return;
        }

        let message = err.to_string();
        let marked = self.store.update(
            job_id,
            store_config.error_expiry(),
            &mut |record: &mut JobRecord| {
                if record.status.can_transition_to(JobStatus::Error) {
                    record.status = JobStatus::Error;
                    record.error = Some(message.clone());
                    record.output_reference = None;
                }
            },
        );
        match marked {
            Ok(Some(_)) => debug!(job_id = %job_id, "Record marked as errored"),
            Ok(None) => debug!(job_id = %job_id, "Record already gone, nothing to mark"),
            Err(e) => warn!(job_id = %job_id, error = %e, "Failed to mark record as errored"),
        }
    }

    fn remove_created(&self, request: &JobRequest, created: &RunArtifacts) {
        if created.output {
            remove_if_exists(&self.output_path(request));
        }
        if created.scratch {
            remove_if_exists(&self.scratch_path(&request.job_id));
        }
    }
}

/// Files a single run has created and must clean up if it fails
#[derive(Debug, Default)]
struct RunArtifacts {
    scratch: bool,
    output: bool,
}

fn ensure_live(job_id: &str, cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(JobError::Cancelled(job_id.to_string()));
    }
    Ok(())
}

fn remove_if_exists(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed partial file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove partial file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::NearestEnhancer;
    use crate::job_store::MemoryJobStore;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    fn controller(dir: &TempDir) -> (JobController, Arc<MemoryJobStore>, Config) {
        let mut config = Config::default();
        config.data_dir = dir.path().join("data");
        config.output_dir = dir.path().join("outputs");
        config.load_retry.max_attempts = 2;
        config.load_retry.delay_ms = 1;
        let store = Arc::new(MemoryJobStore::new());
        let controller = JobController::new(
            store.clone(),
            Arc::new(NearestEnhancer),
            None,
            Arc::new(config.clone()),
        );
        (controller, store, config)
    }

    fn staged(config: &Config, id: &str) -> JobRequest {
        let input = config.inputs_dir().join(format!("{}.png", id));
        std::fs::create_dir_all(input.parent().unwrap()).unwrap();
        RgbImage::from_pixel(40, 30, Rgb([1, 2, 3])).save(&input).unwrap();
        JobRequest {
            job_id: id.to_string(),
            input_path: input,
            scale: 2,
            tile_size: 16,
            tile_pad: 4,
            buffer_mode: BufferMode::Memory,
        }
    }

    #[tokio::test]
    async fn test_run_marks_done_with_reference() {
        let dir = TempDir::new().unwrap();
        let (controller, store, config) = controller(&dir);
        let request = staged(&config, "ok");
        store.write("ok", &JobRecord::queued("ok"), Expiry::Never).unwrap();

        let reference = controller.run(request, CancellationToken::new()).await.unwrap();
        let record = store.read("ok").unwrap().unwrap();

        assert_eq!(record.status, JobStatus::Done);
        assert_eq!(record.progress, 100);
        assert_eq!(record.output_reference.as_deref(), Some(reference.as_str()));
        assert!(record.started_time.is_some() && record.completed_time.is_some());
        let output = image::open(&reference).unwrap();
        assert_eq!((output.width(), output.height()), (80, 60));
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_before_running() {
        let dir = TempDir::new().unwrap();
        let (controller, store, config) = controller(&dir);
        let request = staged(&config, "stop");
        store.write("stop", &JobRecord::queued("stop"), Expiry::Never).unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let err = controller.run(request.clone(), token).await.unwrap_err();

        assert!(matches!(err, JobError::Cancelled(_)));
        assert!(!controller.output_path(&request).exists());
        // never started, so nothing is left for pollers
        assert!(store.read("stop").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deleted_record_is_not_resurrected() {
        let dir = TempDir::new().unwrap();
        let (controller, store, config) = controller(&dir);
        let request = staged(&config, "gone");

        let err = controller.run(request, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, JobError::Cancelled(_)));
        assert!(store.read("gone").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_input_marks_error() {
        let dir = TempDir::new().unwrap();
        let (controller, store, config) = controller(&dir);
        let mut request = staged(&config, "bad");
        request.input_path = dir.path().join("missing.png");
        store.write("bad", &JobRecord::queued("bad"), Expiry::Never).unwrap();

        let err = controller.run(request, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, JobError::InputNotReady { attempts: 2, .. }));

        let record = store.read("bad").unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Error);
        assert!(record.error.unwrap().contains("not ready"));
        assert!(record.output_reference.is_none());
    }

    #[tokio::test]
    async fn test_failure_leaves_finished_record_alone() {
        let dir = TempDir::new().unwrap();
        let (controller, store, config) = controller(&dir);
        let request = staged(&config, "kept");
        store.write("kept", &JobRecord::queued("kept"), Expiry::Never).unwrap();
        let reference = controller.run(request, CancellationToken::new()).await.unwrap();

        controller.record_failure("kept", &JobError::Inference("late".to_string()));

        let record = store.read("kept").unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Done);
        assert_eq!(record.output_reference.as_deref(), Some(reference.as_str()));
        assert!(record.error.is_none());
    }
}
