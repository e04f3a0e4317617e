use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};
use crate::store::{TenantId, WorkerName};

/// Automatic retries granted to a task after a processing failure.
pub const MAX_AUTOMATIC_RETRIES: u32 = 1;

/// One unit of work: one input resource of one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId {
    pub tenant: TenantId,
    pub resource_path: String,
}

impl TaskId {
    pub fn new(tenant: TenantId, resource_path: impl Into<String>) -> Result<Self> {
        let resource_path = resource_path.into();
        if resource_path.trim().is_empty() {
            return Err(FleetError::InvalidResourcePath(
                "resource path must not be empty".to_string(),
            ));
        }
        if resource_path.chars().any(|c| c.is_control()) {
            return Err(FleetError::InvalidResourcePath(format!(
                "{resource_path:?} contains control characters"
            )));
        }
        Ok(Self {
            tenant,
            resource_path,
        })
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.tenant, self.resource_path)
    }
}

/// Observable state of a task within its tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Processing,
    Done,
    /// Error recorded and retry budget exhausted.
    Failed,
    /// Never submitted, deleted while queued, or purged by a reset.
    Unknown,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Queued => write!(f, "queued"),
            TaskState::Processing => write!(f, "processing"),
            TaskState::Done => write!(f, "done"),
            TaskState::Failed => write!(f, "failed"),
            TaskState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Who is processing a task and since when.
///
/// The serialized form doubles as the claim token: a transition out of
/// processing only applies while the stored record is byte-for-byte the one
/// the claimant wrote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub worker: WorkerName,
    pub started_at: DateTime<Utc>,
}

impl ProcessingRecord {
    pub fn new(worker: WorkerName) -> Self {
        Self {
            worker,
            started_at: Utc::now(),
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Whether the task has been processing longer than `timeout` at `now`.
    pub fn is_older_than(&self, timeout: std::time::Duration, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(timeout) {
            Ok(timeout) => now - self.started_at > timeout,
            Err(_) => false,
        }
    }
}

/// A task a worker has claimed, together with the record proving the claim.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub task: TaskId,
    pub record: ProcessingRecord,
    pub(crate) encoded_record: String,
}

impl ClaimedTask {
    pub fn encoded_record(&self) -> &str {
        &self.encoded_record
    }
}

/// Outcome of moving a claimed task out of processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Completed,
    /// Failure with retry budget left; the task went back to the queue.
    Retried { attempt: u32 },
    /// Failure with the retry budget exhausted.
    Failed,
    /// The claim was no longer ours (reclaimed by the monitor); nothing changed.
    Stale,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn task_id_rejects_empty_and_control_paths() {
        let tenant = TenantId::new("acme").unwrap();
        assert!(TaskId::new(tenant.clone(), "uploads/cat.png").is_ok());
        assert!(TaskId::new(tenant.clone(), "  ").is_err());
        assert!(TaskId::new(tenant, "a\nb").is_err());
    }

    #[test]
    fn record_encoding_is_stable() {
        let record = ProcessingRecord::new(WorkerName::new("w1").unwrap());
        let encoded = record.encode().unwrap();
        let decoded = ProcessingRecord::decode(&encoded).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.encode().unwrap(), encoded);
    }

    #[test]
    fn record_age_against_timeout() {
        let mut record = ProcessingRecord::new(WorkerName::new("w1").unwrap());
        let now = Utc::now();
        record.started_at = now - chrono::Duration::seconds(61);
        assert!(record.is_older_than(Duration::from_secs(60), now));
        assert!(!record.is_older_than(Duration::from_secs(120), now));
    }

    #[test]
    fn task_state_display() {
        assert_eq!(TaskState::Queued.to_string(), "queued");
        assert_eq!(TaskState::Failed.to_string(), "failed");
    }
}
