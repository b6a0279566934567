pub mod codec;
pub mod config;
pub mod controller;
pub mod dispatch;
pub mod error;
pub mod geo;
pub mod inference;
pub mod job_store;
pub mod metrics;
pub mod object_store;
pub mod persistent_store;
pub mod record;
pub mod retry;
pub mod service;
pub mod stitch;
pub mod tiling;

// Re-export commonly used types for easier testing
pub use crate::config::Config;
pub use crate::controller::{JobController, JobRequest};
pub use crate::dispatch::{CancellationRegistry, JobQueue};
pub use crate::error::{JobError, Result};
pub use crate::geo::{GeoMetadata, GeoTransform};
pub use crate::inference::{Enhancer, NearestEnhancer, OnnxEnhancer};
pub use crate::job_store::{Expiry, JobStore, MemoryJobStore};
pub use crate::object_store::{HttpObjectStore, LocalObjectStore, ObjectStore};
pub use crate::persistent_store::SledJobStore;
pub use crate::record::{tile_progress, JobRecord, JobStatus, ProgressView};
pub use crate::service::UpscaleService;
pub use crate::stitch::{BufferMode, OutputBuffer};
pub use crate::tiling::{schedule, TileParams, TileWindow};
