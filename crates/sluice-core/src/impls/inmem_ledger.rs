//! InMemoryLedger - 開発・テスト用の BatchJob ledger

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{BatchId, BatchJob, StoreError};
use crate::ports::BatchLedger;

#[derive(Debug, Default)]
struct LedgerState {
    jobs: Vec<BatchJob>,
    fail_creates: u32,
    fail_flag_writes: u32,
    flag_writes: Vec<(BatchId, bool)>,
}

#[derive(Clone, Default)]
pub struct InMemoryLedger {
    state: Arc<Mutex<LedgerState>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a row directly (as the downstream runner would).
    pub async fn insert(&self, job: BatchJob) {
        self.state.lock().await.jobs.push(job);
    }

    /// Mark a row as submitted (as the downstream runner would).
    pub async fn record_submission(&self, batch_id: &BatchId, remote_batch_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(job) = state.jobs.iter_mut().find(|j| &j.batch_id == batch_id) {
            job.remote_batch_id = Some(remote_batch_id.to_string());
            job.requested = true;
        }
    }

    pub async fn job(&self, batch_id: &BatchId) -> Option<BatchJob> {
        let state = self.state.lock().await;
        state.jobs.iter().find(|j| &j.batch_id == batch_id).cloned()
    }

    pub async fn jobs(&self) -> Vec<BatchJob> {
        self.state.lock().await.jobs.clone()
    }

    pub async fn fail_next_creates(&self, n: u32) {
        self.state.lock().await.fail_creates = n;
    }

    pub async fn fail_next_flag_writes(&self, n: u32) {
        self.state.lock().await.fail_flag_writes = n;
    }

    async fn pending(&self, requested: bool, limit: usize) -> Vec<BatchJob> {
        let state = self.state.lock().await;
        let mut pending: Vec<BatchJob> = state
            .jobs
            .iter()
            .filter(|j| j.is_pending() && j.requested == requested)
            .cloned()
            .collect();
        pending.sort_by_key(|j| j.created_at);
        pending.truncate(limit);
        pending
    }

    /// Successful terminal writes, in order.
    pub async fn flag_writes(&self) -> Vec<(BatchId, bool)> {
        self.state.lock().await.flag_writes.clone()
    }
}

#[async_trait]
impl BatchLedger for InMemoryLedger {
    async fn create(&self, job: &BatchJob) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.fail_creates > 0 {
            state.fail_creates -= 1;
            return Err(StoreError::Unavailable("injected create failure".into()));
        }
        if state.jobs.iter().any(|j| j.batch_id == job.batch_id) {
            return Err(StoreError::Conflict(format!("{} already exists", job.batch_id)));
        }
        state.jobs.push(job.clone());
        Ok(())
    }

    async fn list_submitted(&self, limit: usize) -> Result<Vec<BatchJob>, StoreError> {
        Ok(self.pending(true, limit).await)
    }

    async fn list_unsubmitted(&self, limit: usize) -> Result<Vec<BatchJob>, StoreError> {
        Ok(self.pending(false, limit).await)
    }

    async fn set_completed(&self, batch_id: &BatchId, completed: bool) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.fail_flag_writes > 0 {
            state.fail_flag_writes -= 1;
            return Err(StoreError::Unavailable("injected flag write failure".into()));
        }
        let job = state
            .jobs
            .iter_mut()
            .find(|j| &j.batch_id == batch_id)
            .ok_or_else(|| StoreError::Rejected {
                status: 404,
                message: format!("{batch_id} not found"),
            })?;
        job.resolve(completed)
            .map_err(|e| StoreError::Conflict(e.to_string()))?;
        state.flag_writes.push((*batch_id, completed));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use ulid::Ulid;

    fn job(offset_secs: i64) -> BatchJob {
        BatchJob::new(
            BatchId::from_ulid(Ulid::new()),
            "translate",
            1,
            Utc::now() + Duration::seconds(offset_secs),
        )
    }

    #[tokio::test]
    async fn pending_rows_are_listed_oldest_first() {
        let ledger = InMemoryLedger::new();
        let newer = job(10);
        let older = job(0);
        ledger.create(&newer).await.unwrap();
        ledger.create(&older).await.unwrap();

        let pending = ledger.list_unsubmitted(10).await.unwrap();
        assert_eq!(pending[0].batch_id, older.batch_id);
        assert_eq!(pending[1].batch_id, newer.batch_id);

        ledger.set_completed(&older.batch_id, true).await.unwrap();
        assert_eq!(ledger.list_unsubmitted(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn submitted_and_unsubmitted_rows_are_listed_apart() {
        let ledger = InMemoryLedger::new();
        let waiting = job(0);
        let submitted = job(10);
        ledger.create(&waiting).await.unwrap();
        ledger.create(&submitted).await.unwrap();
        ledger.record_submission(&submitted.batch_id, "remote-1").await;

        let ids = |jobs: Vec<BatchJob>| jobs.into_iter().map(|j| j.batch_id).collect::<Vec<_>>();
        assert_eq!(ids(ledger.list_submitted(1).await.unwrap()), vec![submitted.batch_id]);
        assert_eq!(ids(ledger.list_unsubmitted(1).await.unwrap()), vec![waiting.batch_id]);
    }

    #[tokio::test]
    async fn terminal_rows_never_flip() {
        let ledger = InMemoryLedger::new();
        let j = job(0);
        ledger.create(&j).await.unwrap();
        ledger.set_completed(&j.batch_id, false).await.unwrap();

        let err = ledger.set_completed(&j.batch_id, true).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(ledger.job(&j.batch_id).await.unwrap().completed, Some(false));
    }
}
