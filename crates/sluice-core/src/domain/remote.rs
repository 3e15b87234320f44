//! Typed shapes of the remote endpoints.
//!
//! Every response is validated on ingress into one of these types. Missing
//! fields fall back to the documented defaults (`#[serde(default)]`), and
//! unknown status strings map to [`RemoteBatchStatus::Unknown`] which is
//! treated as non-terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{BatchId, WorkItemId};
use super::work_item::WorkItem;

/// Status of a remote batch job.
///
/// `validating -> in_progress -> finalizing -> completed`, or
/// `-> expired | cancelled | failed`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RemoteBatchStatus {
    Validating,
    InProgress,
    Finalizing,
    Completed,
    Expired,
    Cancelling,
    Cancelled,
    Failed,
    Unknown(String),
}

/// What the poller does with a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPhase {
    /// Not terminal yet; check again next cycle.
    Running,
    /// Terminal success; hand to the reconciler.
    Succeeded,
    /// Terminal failure; mark the ledger row failed.
    Failed,
}

impl RemoteBatchStatus {
    pub fn phase(&self) -> BatchPhase {
        match self {
            RemoteBatchStatus::Completed => BatchPhase::Succeeded,
            RemoteBatchStatus::Expired
            | RemoteBatchStatus::Cancelled
            | RemoteBatchStatus::Failed => BatchPhase::Failed,
            RemoteBatchStatus::Validating
            | RemoteBatchStatus::InProgress
            | RemoteBatchStatus::Finalizing
            | RemoteBatchStatus::Cancelling
            | RemoteBatchStatus::Unknown(_) => BatchPhase::Running,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase() != BatchPhase::Running
    }

    pub fn as_str(&self) -> &str {
        match self {
            RemoteBatchStatus::Validating => "validating",
            RemoteBatchStatus::InProgress => "in_progress",
            RemoteBatchStatus::Finalizing => "finalizing",
            RemoteBatchStatus::Completed => "completed",
            RemoteBatchStatus::Expired => "expired",
            RemoteBatchStatus::Cancelling => "cancelling",
            RemoteBatchStatus::Cancelled => "cancelled",
            RemoteBatchStatus::Failed => "failed",
            RemoteBatchStatus::Unknown(raw) => raw,
        }
    }
}

impl From<String> for RemoteBatchStatus {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "validating" => RemoteBatchStatus::Validating,
            "in_progress" => RemoteBatchStatus::InProgress,
            "finalizing" => RemoteBatchStatus::Finalizing,
            "completed" => RemoteBatchStatus::Completed,
            "expired" => RemoteBatchStatus::Expired,
            "cancelling" => RemoteBatchStatus::Cancelling,
            "cancelled" => RemoteBatchStatus::Cancelled,
            "failed" => RemoteBatchStatus::Failed,
            _ => RemoteBatchStatus::Unknown(raw),
        }
    }
}

impl From<RemoteBatchStatus> for String {
    fn from(status: RemoteBatchStatus) -> Self {
        status.as_str().to_string()
    }
}

impl std::fmt::Display for RemoteBatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCounts {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub completed: u64,
    #[serde(default)]
    pub failed: u64,
}

/// `GET /batches/{id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteBatch {
    pub id: String,
    pub status: RemoteBatchStatus,
    #[serde(default)]
    pub request_counts: RequestCounts,
    #[serde(default)]
    pub output_file_id: Option<String>,
    #[serde(default)]
    pub error_file_id: Option<String>,
}

impl RemoteBatch {
    pub fn new(id: impl Into<String>, status: RemoteBatchStatus) -> Self {
        Self {
            id: id.into(),
            status,
            request_counts: RequestCounts::default(),
            output_file_id: None,
            error_file_id: None,
        }
    }

    pub fn with_output(mut self, file_id: impl Into<String>) -> Self {
        self.output_file_id = Some(file_id.into());
        self
    }

    pub fn with_errors(mut self, file_id: impl Into<String>) -> Self {
        self.error_file_id = Some(file_id.into());
        self
    }
}

/// One entry of `GET .../runs?status=in_progress`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub head_branch: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// One item inside a dispatch payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchItem {
    pub id: WorkItemId,
    /// Correlation id the runner must put on the remote request line.
    pub custom_id: String,
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl From<&WorkItem> for DispatchItem {
    fn from(item: &WorkItem) -> Self {
        Self {
            id: item.id.clone(),
            custom_id: item.id.to_correlation_id(),
            payload: item.payload.clone(),
        }
    }
}

/// Body of the outbound dispatch call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub event_type: String,
    pub batch_id: BatchId,
    pub task_type: String,
    pub items: Vec<DispatchItem>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::validating("validating", BatchPhase::Running)]
    #[case::in_progress("in_progress", BatchPhase::Running)]
    #[case::finalizing("finalizing", BatchPhase::Running)]
    #[case::cancelling("cancelling", BatchPhase::Running)]
    #[case::completed("completed", BatchPhase::Succeeded)]
    #[case::expired("expired", BatchPhase::Failed)]
    #[case::cancelled("cancelled", BatchPhase::Failed)]
    #[case::failed("failed", BatchPhase::Failed)]
    #[case::unknown("paused", BatchPhase::Running)]
    fn status_phase(#[case] raw: &str, #[case] expected: BatchPhase) {
        let status = RemoteBatchStatus::from(raw.to_string());
        assert_eq!(status.phase(), expected);
        assert_eq!(status.as_str(), raw);
    }

    #[test]
    fn batch_response_defaults_missing_fields() {
        let json = serde_json::json!({ "id": "batch_1", "status": "in_progress" });
        let batch: RemoteBatch = serde_json::from_value(json).unwrap();
        assert_eq!(batch.status, RemoteBatchStatus::InProgress);
        assert_eq!(batch.request_counts, RequestCounts::default());
        assert_eq!(batch.output_file_id, None);
    }

    #[test]
    fn workflow_run_tolerates_nulls() {
        let json = serde_json::json!({ "id": 9, "name": null, "event": "repository_dispatch" });
        let run: WorkflowRun = serde_json::from_value(json).unwrap();
        assert_eq!(run.name, None);
        assert_eq!(run.event.as_deref(), Some("repository_dispatch"));
    }
}
