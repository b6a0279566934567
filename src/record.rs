//! Job record data model
//!
//! One `JobRecord` exists per active job id. It is written by exactly one
//! owning worker and read by any number of pollers.

use serde::{Deserialize, Serialize};

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Record created, job waiting in the dispatch queue
    Queued,
    /// A worker owns the job and is processing tiles
    Running,
    /// All tiles written; output being encoded and persisted
    Finalizing,
    /// Output persisted and referenced by the record
    Done,
    /// Processing failed; the record carries the message
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }

    /// Allowed edges of the job state machine. Self-loops on `Running` are
    /// per-tile progress updates.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Running, Running)
                | (Running, Finalizing)
                | (Finalizing, Done)
                | (Running, Error)
                | (Finalizing, Error)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Finalizing => "finalizing",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub progress: u8,
    pub status: JobStatus,
    pub started_time: Option<String>,
    pub completed_time: Option<String>,
    pub output_reference: Option<String>,
    pub error: Option<String>,
}

impl JobRecord {
    /// Fresh record written by the start operation
    pub fn queued(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            progress: 0,
            status: JobStatus::Queued,
            started_time: None,
            completed_time: None,
            output_reference: None,
            error: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == JobStatus::Done
    }
}

/// Per-tile progress while running: `ceil(done / total * 100)` capped at 99
/// so 100 is only ever observed together with an output reference.
pub fn tile_progress(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (completed.min(total) * 100).div_ceil(total);
    pct.min(99) as u8
}

/// What a polling client sees
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressView {
    pub progress: u8,
    pub status: JobStatus,
    pub completed_time: Option<String>,
    pub error: Option<String>,
}

impl From<&JobRecord> for ProgressView {
    fn from(record: &JobRecord) -> Self {
        Self {
            progress: record.progress,
            status: record.status,
            completed_time: record.completed_time.clone(),
            error: record.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_edges() {
        use JobStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(Running));
        assert!(Running.can_transition_to(Finalizing));
        assert!(Finalizing.can_transition_to(Done));
        assert!(Running.can_transition_to(Error));
        assert!(Finalizing.can_transition_to(Error));

        assert!(!Queued.can_transition_to(Done));
        assert!(!Queued.can_transition_to(Error));
        assert!(!Running.can_transition_to(Done));
        assert!(!Done.can_transition_to(Running));
        assert!(!Error.can_transition_to(Running));
    }

    #[test]
    fn test_tile_progress_caps_below_100() {
        assert_eq!(tile_progress(1, 4), 25);
        assert_eq!(tile_progress(2, 4), 50);
        assert_eq!(tile_progress(3, 4), 75);
        assert_eq!(tile_progress(4, 4), 99);
        assert_eq!(tile_progress(1, 3), 34);
        assert_eq!(tile_progress(0, 0), 0);
    }

    #[test]
    fn test_record_wire_shape() {
        let mut record = JobRecord::queued("job-1");
        record.status = JobStatus::Finalizing;
        record.progress = 99;

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "finalizing");
        assert_eq!(json["progress"], 99);
        assert!(json["output_reference"].is_null());
        assert!(json["completed_time"].is_null());
    }
}
