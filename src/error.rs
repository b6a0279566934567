use thiserror::Error;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Input not ready after {attempts} attempts: {path}")]
    InputNotReady { path: String, attempts: u32 },

    #[error("No staged input for job: {0}")]
    InputNotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Tile at ({x}, {y}) expected {expected_width}x{expected_height}, got {width}x{height}")]
    TileShapeMismatch {
        x: u32,
        y: u32,
        expected_width: u32,
        expected_height: u32,
        width: u32,
        height: u32,
    },

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Geospatial metadata error: {0}")]
    Geo(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Upload error: {0}")]
    Upload(String),

    #[error("Upload rejected: {0}")]
    UploadRejected(String),

    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Job cancelled: {0}")]
    Cancelled(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job already exists: {0}")]
    JobExists(String),

    #[error("Job already finished: {0}")]
    AlreadyFinished(String),

    #[error("Output not ready for job: {0}")]
    OutputNotReady(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl JobError {
    /// Whether a retry executor may attempt the operation again.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, JobError::InputNotReady { .. } | JobError::Upload(_))
    }
}

pub type Result<T> = std::result::Result<T, JobError>;

impl From<image::ImageError> for JobError {
    fn from(err: image::ImageError) -> Self {
        JobError::Codec(err.to_string())
    }
}

impl From<tiff::TiffError> for JobError {
    fn from(err: tiff::TiffError) -> Self {
        JobError::Geo(err.to_string())
    }
}

impl From<sled::Error> for JobError {
    fn from(err: sled::Error) -> Self {
        JobError::Storage(err.to_string())
    }
}

impl From<bincode::Error> for JobError {
    fn from(err: bincode::Error) -> Self {
        JobError::Storage(format!("record serialization failed: {}", err))
    }
}

impl From<reqwest::Error> for JobError {
    fn from(err: reqwest::Error) -> Self {
        JobError::Upload(err.to_string())
    }
}

impl From<tokio::task::JoinError> for JobError {
    fn from(err: tokio::task::JoinError) -> Self {
        JobError::Inference(format!("Thread join error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        let not_ready = JobError::InputNotReady {
            path: "tmp/inputs/a.png".to_string(),
            attempts: 10,
        };
        assert!(not_ready.is_recoverable());
        assert!(JobError::Upload("503".to_string()).is_recoverable());
        assert!(!JobError::Inference("boom".to_string()).is_recoverable());
        assert!(!JobError::JobNotFound("x".to_string()).is_recoverable());
        assert!(!JobError::UploadRejected("403".to_string()).is_recoverable());
    }

    #[test]
    fn test_tile_mismatch_message() {
        let err = JobError::TileShapeMismatch {
            x: 448,
            y: 0,
            expected_width: 608,
            expected_height: 2048,
            width: 600,
            height: 2048,
        };
        let msg = err.to_string();
        assert!(msg.contains("(448, 0)"));
        assert!(msg.contains("608x2048"));
    }
}
