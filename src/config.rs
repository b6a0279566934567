use crate::error::{JobError, Result};
use crate::job_store::Expiry;
use crate::stitch::BufferMode;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Scratch root; staged uploads live under `inputs/`
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    pub tiling: TilingConfig,
    pub buffer_mode: BufferMode,
    pub mmap_threshold_bytes: u64,
    pub store: StoreConfig,
    pub worker_config: WorkerConfig,
    pub load_retry: LoadRetryConfig,
    /// ONNX model used for inference; nearest-neighbour upscaling when absent
    pub model_path: Option<PathBuf>,
    pub object_store: Option<ObjectStoreConfig>,
    pub metrics_bind: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TilingConfig {
    pub scale: u32,
    pub tile_size: u32,
    pub tile_pad: u32,
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            scale: 4,
            tile_size: 512,
            tile_pad: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    Sled,
}

impl FromStr for StoreBackend {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "sled" => Ok(StoreBackend::Sled),
            other => Err(JobError::Config(format!("unknown store backend: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub sled_path: PathBuf,
    /// Safety-net expiry, refreshed on every record write
    pub record_ttl_secs: u64,
    /// How long an `error` record stays visible to pollers
    pub error_retention_secs: u64,
    pub delete_record_on_error: bool,
    pub sweep_interval_secs: u64,
}

impl StoreConfig {
    /// Expiry applied to every record write; `0` keeps records forever
    pub fn record_expiry(&self) -> Expiry {
        Expiry::from_secs(self.record_ttl_secs)
    }

    pub fn error_expiry(&self) -> Expiry {
        Expiry::from_secs(self.error_retention_secs)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            sled_path: PathBuf::from("./data/jobs_db"),
            record_ttl_secs: 86_400,
            error_retention_secs: 3_600,
            delete_record_on_error: false,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Sized to the number of inference accelerators
    pub worker_count: usize,
    pub queue_name: String,
    pub queue_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: 1,
            queue_name: "gpu".to_string(),
            queue_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadRetryConfig {
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl Default for LoadRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ObjectStoreConfig {
    /// Copy finished outputs into a directory
    Directory(PathBuf),
    /// PUT finished outputs under a base URL
    Http { base_url: String },
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./tmp"),
            output_dir: PathBuf::from("./outputs"),
            tiling: TilingConfig::default(),
            buffer_mode: BufferMode::Memory,
            mmap_threshold_bytes: 1024 * 1024 * 1024,
            store: StoreConfig::default(),
            worker_config: WorkerConfig::default(),
            load_retry: LoadRetryConfig::default(),
            model_path: None,
            object_store: None,
            metrics_bind: None,
        }
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| JobError::Config(format!("{} has an invalid value: {}", name, raw))),
        _ => Ok(default),
    }
}

fn optional_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl Config {
    pub fn load() -> Result<Self> {
        let defaults = Config::default();

        let data_dir = optional_var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);
        let output_dir = optional_var("OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.output_dir);

        let tiling = TilingConfig {
            scale: parse_var("SCALE", defaults.tiling.scale)?,
            tile_size: parse_var("TILE_SIZE", defaults.tiling.tile_size)?,
            tile_pad: parse_var("TILE_PAD", defaults.tiling.tile_pad)?,
        };

        let buffer_mode: BufferMode = parse_var("BUFFER_MODE", defaults.buffer_mode)?;
        let mmap_threshold_bytes = parse_var("MMAP_THRESHOLD_BYTES", defaults.mmap_threshold_bytes)?;

        let store = StoreConfig {
            backend: parse_var("STORE_BACKEND", defaults.store.backend)?,
            sled_path: optional_var("SLED_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.store.sled_path),
            record_ttl_secs: parse_var("RECORD_TTL_SECS", defaults.store.record_ttl_secs)?,
            error_retention_secs: parse_var(
                "ERROR_RETENTION_SECS",
                defaults.store.error_retention_secs,
            )?,
            delete_record_on_error: parse_var(
                "DELETE_RECORD_ON_ERROR",
                defaults.store.delete_record_on_error,
            )?,
            sweep_interval_secs: parse_var("SWEEP_INTERVAL_SECS", defaults.store.sweep_interval_secs)?,
        };

        let worker_config = WorkerConfig {
            worker_count: parse_var("WORKER_COUNT", defaults.worker_config.worker_count)?,
            queue_name: optional_var("QUEUE_NAME").unwrap_or(defaults.worker_config.queue_name),
            queue_capacity: parse_var("QUEUE_CAPACITY", defaults.worker_config.queue_capacity)?,
        };

        let load_retry = LoadRetryConfig {
            max_attempts: parse_var("LOAD_MAX_ATTEMPTS", defaults.load_retry.max_attempts)?,
            delay_ms: parse_var("LOAD_RETRY_DELAY_MS", defaults.load_retry.delay_ms)?,
        };

        // HTTP target wins when both are set
        let object_store = match (optional_var("OBJECT_STORE_URL"), optional_var("OBJECT_STORE_DIR")) {
            (Some(base_url), _) => Some(ObjectStoreConfig::Http { base_url }),
            (None, Some(dir)) => Some(ObjectStoreConfig::Directory(PathBuf::from(dir))),
            (None, None) => None,
        };

        let config = Self {
            data_dir,
            output_dir,
            tiling,
            buffer_mode,
            mmap_threshold_bytes,
            store,
            worker_config,
            load_retry,
            model_path: optional_var("MODEL_PATH").map(PathBuf::from),
            object_store,
            metrics_bind: optional_var("METRICS_BIND"),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tiling.scale == 0 {
            return Err(JobError::Config("SCALE must be at least 1".to_string()));
        }
        if self.tiling.tile_pad >= self.tiling.tile_size {
            return Err(JobError::Config(format!(
                "TILE_PAD ({}) must be smaller than TILE_SIZE ({})",
                self.tiling.tile_pad, self.tiling.tile_size
            )));
        }
        if self.worker_config.worker_count == 0 {
            return Err(JobError::Config("WORKER_COUNT must be at least 1".to_string()));
        }
        if self.load_retry.max_attempts == 0 {
            return Err(JobError::Config("LOAD_MAX_ATTEMPTS must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn inputs_dir(&self) -> PathBuf {
        self.data_dir.join("inputs")
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.data_dir.join("scratch")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_parameters() {
        let config = Config::default();
        assert_eq!(config.tiling.scale, 4);
        assert_eq!(config.tiling.tile_size, 512);
        assert_eq!(config.tiling.tile_pad, 64);
        assert_eq!(config.worker_config.queue_name, "gpu");
        assert_eq!(config.load_retry.max_attempts, 10);
        assert_eq!(config.load_retry.delay_ms, 500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_pad_not_below_tile() {
        let mut config = Config::default();
        config.tiling.tile_pad = config.tiling.tile_size;
        assert!(matches!(config.validate(), Err(JobError::Config(_))));
    }

    #[test]
    fn test_store_backend_parsing() {
        assert_eq!("SLED".parse::<StoreBackend>().unwrap(), StoreBackend::Sled);
        assert_eq!("memory".parse::<StoreBackend>().unwrap(), StoreBackend::Memory);
        assert!("redis".parse::<StoreBackend>().is_err());
    }

    #[test]
    fn test_derived_directories() {
        let config = Config {
            data_dir: PathBuf::from("/srv/sr"),
            ..Config::default()
        };
        assert_eq!(config.inputs_dir(), PathBuf::from("/srv/sr/inputs"));
        assert_eq!(config.scratch_dir(), PathBuf::from("/srv/sr/scratch"));
    }
}
