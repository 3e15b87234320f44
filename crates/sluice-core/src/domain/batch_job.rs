//! BatchJob ledger row and its one-way state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::SluiceError;
use super::ids::BatchId;

/// Ledger view of `completed`.
///
/// State transitions:
/// - Pending -> Succeeded
/// - Pending -> Failed
///
/// Terminal states never revert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchJobState {
    Pending,
    Succeeded,
    Failed,
}

impl BatchJobState {
    pub fn from_completed(completed: Option<bool>) -> Self {
        match completed {
            None => BatchJobState::Pending,
            Some(true) => BatchJobState::Succeeded,
            Some(false) => BatchJobState::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, BatchJobState::Pending)
    }
}

/// One dispatched batch, tracked in the ledger.
///
/// The orchestrator writes the row twice: [`BatchJob::new`] at dispatch, and
/// the terminal update. `requested` and `remote_batch_id` are filled in by the
/// downstream runner once it has submitted the remote batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    pub batch_id: BatchId,

    pub task_type: String,

    #[serde(default)]
    pub remote_batch_id: Option<String>,

    #[serde(default)]
    pub item_count: usize,

    #[serde(default)]
    pub completed: Option<bool>,

    #[serde(default, deserialize_with = "null_as_false")]
    pub requested: bool,

    pub created_at: DateTime<Utc>,
}

fn null_as_false<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or(false))
}

impl BatchJob {
    pub fn new(
        batch_id: BatchId,
        task_type: impl Into<String>,
        item_count: usize,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            batch_id,
            task_type: task_type.into(),
            remote_batch_id: None,
            item_count,
            completed: None,
            requested: false,
            created_at,
        }
    }

    /// Record that the runner submitted the remote batch.
    pub fn with_remote(mut self, remote_batch_id: impl Into<String>) -> Self {
        self.remote_batch_id = Some(remote_batch_id.into());
        self.requested = true;
        self
    }

    pub fn state(&self) -> BatchJobState {
        BatchJobState::from_completed(self.completed)
    }

    pub fn is_pending(&self) -> bool {
        self.completed.is_none()
    }

    /// Move to a terminal state.
    ///
    /// Repeating the same transition is a no-op; flipping an already terminal
    /// row to the other value is a consistency error.
    pub fn resolve(&mut self, succeeded: bool) -> Result<(), SluiceError> {
        match self.completed {
            None => {
                self.completed = Some(succeeded);
                Ok(())
            }
            Some(current) if current == succeeded => Ok(()),
            Some(current) => Err(SluiceError::Consistency(format!(
                "{} is already completed={current}, refusing completed={succeeded}",
                self.batch_id
            ))),
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn job() -> BatchJob {
        BatchJob::new(BatchId::from_ulid(Ulid::new()), "translate", 3, Utc::now())
    }

    #[test]
    fn new_job_is_pending_and_not_requested() {
        let job = job();
        assert_eq!(job.state(), BatchJobState::Pending);
        assert!(!job.requested);
        assert_eq!(job.remote_batch_id, None);
    }

    #[test]
    fn resolve_is_one_way() {
        let mut job = job();
        job.resolve(true).unwrap();
        assert_eq!(job.state(), BatchJobState::Succeeded);

        // same value again is fine
        job.resolve(true).unwrap();

        let err = job.resolve(false).unwrap_err();
        assert!(matches!(err, SluiceError::Consistency(_)));
        assert_eq!(job.completed, Some(true));
    }

    #[test]
    fn with_remote_marks_requested() {
        let job = job().with_remote("batch_abc");
        assert!(job.requested);
        assert_eq!(job.remote_batch_id.as_deref(), Some("batch_abc"));
    }

    #[test]
    fn null_requested_reads_as_not_submitted() {
        let mut row = serde_json::to_value(job()).unwrap();
        row["requested"] = serde_json::Value::Null;

        let parsed: BatchJob = serde_json::from_value(row).unwrap();
        assert!(!parsed.requested);
    }
}
