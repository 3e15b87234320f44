//! BatchLedger port - BatchJob 行の保存先
//!
//! orchestrator がこの ledger に書くのは 1 lifecycle につき 2 回だけ:
//! 作成（dispatch 成功時）と terminal update（completed = true / false）。

use async_trait::async_trait;

use crate::domain::{BatchId, BatchJob, StoreError};

#[async_trait]
pub trait BatchLedger: Send + Sync {
    async fn create(&self, job: &BatchJob) -> Result<(), StoreError>;

    /// Pending rows the runner has submitted (`completed IS NULL AND requested`),
    /// oldest first, at most `limit`.
    async fn list_submitted(&self, limit: usize) -> Result<Vec<BatchJob>, StoreError>;

    /// Pending rows not yet submitted by the runner, oldest first, at most `limit`.
    async fn list_unsubmitted(&self, limit: usize) -> Result<Vec<BatchJob>, StoreError>;

    /// Conditional terminal update (`completed IS NULL` -> value).
    ///
    /// Setting the value a row already holds succeeds; flipping a terminal row
    /// returns [`StoreError::Conflict`].
    async fn set_completed(&self, batch_id: &BatchId, completed: bool) -> Result<(), StoreError>;
}
