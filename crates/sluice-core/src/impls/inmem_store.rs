//! InMemoryWorkStore - 開発・テスト用の work store
//!
//! # 学習ポイント
//! - tokio::sync::Mutex で state を守る（lock を跨いで await しない）
//! - fault injection: statement timeout / write 失敗を再現できる
//!
//! 行の順序は挿入順で、これが「query-return order」になる。

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{ClaimTier, ItemUpdate, StoreError, WorkItem, WorkItemId};
use crate::ports::WorkClaimStore;

/// Injected failures. Counters are "fail the next N calls".
#[derive(Debug, Default)]
struct Faults {
    /// Selects with a limit above this value fail with a statement timeout.
    timeout_above: Option<usize>,
    marks: u32,
    releases: u32,
    result_writes: u32,
}

impl Faults {
    fn take(counter: &mut u32) -> bool {
        if *counter == 0 {
            return false;
        }
        *counter -= 1;
        true
    }
}

#[derive(Debug, Default)]
struct StoreState {
    items: Vec<WorkItem>,
    faults: Faults,
    /// Limits passed to `select_candidates`, in call order.
    select_limits: Vec<usize>,
    result_write_calls: usize,
}

impl StoreState {
    fn find_mut(&mut self, id: &WorkItemId) -> Option<&mut WorkItem> {
        self.items.iter_mut().find(|item| &item.id == id)
    }

    fn stale<'a>(
        &'a self,
        task_type: &'a str,
        cutoff: DateTime<Utc>,
    ) -> impl Iterator<Item = &'a WorkItem> + 'a {
        self.items
            .iter()
            .filter(move |item| item.task_type == task_type && item.is_stale(cutoff))
    }
}

#[derive(Clone, Default)]
pub struct InMemoryWorkStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryWorkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, item: WorkItem) {
        self.state.lock().await.items.push(item);
    }

    pub async fn insert_all(&self, items: impl IntoIterator<Item = WorkItem>) {
        self.state.lock().await.items.extend(items);
    }

    pub async fn item(&self, id: &WorkItemId) -> Option<WorkItem> {
        let state = self.state.lock().await;
        state.items.iter().find(|item| &item.id == id).cloned()
    }

    pub async fn items(&self) -> Vec<WorkItem> {
        self.state.lock().await.items.clone()
    }

    pub async fn claimed_count(&self) -> usize {
        let state = self.state.lock().await;
        state.items.iter().filter(|item| item.is_claimed()).count()
    }

    /// Selects asking for more than `limit` rows time out.
    pub async fn set_timeout_above(&self, limit: Option<usize>) {
        self.state.lock().await.faults.timeout_above = limit;
    }

    pub async fn fail_next_marks(&self, n: u32) {
        self.state.lock().await.faults.marks = n;
    }

    pub async fn fail_next_releases(&self, n: u32) {
        self.state.lock().await.faults.releases = n;
    }

    pub async fn fail_next_result_writes(&self, n: u32) {
        self.state.lock().await.faults.result_writes = n;
    }

    pub async fn select_limits(&self) -> Vec<usize> {
        self.state.lock().await.select_limits.clone()
    }

    pub async fn result_write_calls(&self) -> usize {
        self.state.lock().await.result_write_calls
    }
}

#[async_trait]
impl WorkClaimStore for InMemoryWorkStore {
    async fn select_candidates(
        &self,
        task_type: &str,
        tier: ClaimTier,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let mut state = self.state.lock().await;
        state.select_limits.push(limit);
        if state.faults.timeout_above.is_some_and(|max| limit > max) {
            return Err(StoreError::StatementTimeout(format!(
                "canceling statement due to statement timeout (limit={limit})"
            )));
        }
        Ok(state
            .items
            .iter()
            .filter(|item| item.task_type == task_type && tier.matches(item))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_claimed(
        &self,
        ids: &[WorkItemId],
        claimed_at: DateTime<Utc>,
    ) -> Result<Vec<WorkItemId>, StoreError> {
        let mut state = self.state.lock().await;
        if Faults::take(&mut state.faults.marks) {
            return Err(StoreError::Unavailable("injected mark failure".into()));
        }
        let mut flipped = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(item) = state.find_mut(id)
                && item.try_claim(claimed_at)
            {
                flipped.push(id.clone());
            }
        }
        Ok(flipped)
    }

    async fn count_stale_claims(
        &self,
        task_type: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let state = self.state.lock().await;
        Ok(state.stale(task_type, cutoff).count())
    }

    async fn select_stale_claims(
        &self,
        task_type: &str,
        cutoff: DateTime<Utc>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .stale(task_type, cutoff)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn release_stale(
        &self,
        ids: &[WorkItemId],
        cutoff: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        if Faults::take(&mut state.faults.releases) {
            return Err(StoreError::Unavailable("injected release failure".into()));
        }
        let wanted: HashSet<&WorkItemId> = ids.iter().collect();
        let mut released = 0;
        for item in state.items.iter_mut() {
            if wanted.contains(&item.id) && item.is_stale(cutoff) {
                item.release();
                released += 1;
            }
        }
        Ok(released)
    }

    async fn apply_results(&self, updates: &[ItemUpdate]) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        state.result_write_calls += 1;
        if Faults::take(&mut state.faults.result_writes) {
            return Err(StoreError::Unavailable("injected result write failure".into()));
        }
        let mut written = 0;
        for update in updates {
            if let Some(item) = state.find_mut(&update.id) {
                item.apply(update);
                written += 1;
            }
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ResultOutcome;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap()
    }

    fn item(id: &str) -> WorkItem {
        WorkItem::new(WorkItemId::new(id), "translate")
    }

    #[tokio::test]
    async fn mark_only_flips_unclaimed_rows() {
        let store = InMemoryWorkStore::new();
        store.insert_all([item("1"), item("2")]).await;

        let first = store
            .mark_claimed(&[WorkItemId::new("1")], at(1))
            .await
            .unwrap();
        let second = store
            .mark_claimed(&[WorkItemId::new("1"), WorkItemId::new("2")], at(2))
            .await
            .unwrap();

        assert_eq!(first, vec![WorkItemId::new("1")]);
        assert_eq!(second, vec![WorkItemId::new("2")]);
        assert_eq!(store.claimed_count().await, 2);
    }

    #[tokio::test]
    async fn select_times_out_above_threshold() {
        let store = InMemoryWorkStore::new();
        store.insert(item("1")).await;
        store.set_timeout_above(Some(10)).await;

        let err = store
            .select_candidates("translate", ClaimTier::Unprocessed, 11)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StatementTimeout(_)));

        let ok = store
            .select_candidates("translate", ClaimTier::Unprocessed, 10)
            .await
            .unwrap();
        assert_eq!(ok.len(), 1);
        assert_eq!(store.select_limits().await, vec![11, 10]);
    }

    #[tokio::test]
    async fn release_is_scoped_to_stale_claims() {
        let store = InMemoryWorkStore::new();
        store.insert_all([item("old"), item("fresh")]).await;
        store.mark_claimed(&[WorkItemId::new("old")], at(1)).await.unwrap();
        store.mark_claimed(&[WorkItemId::new("fresh")], at(5)).await.unwrap();

        let released = store
            .release_stale(&[WorkItemId::new("old"), WorkItemId::new("fresh")], at(3))
            .await
            .unwrap();

        assert_eq!(released, 1);
        assert!(!store.item(&WorkItemId::new("old")).await.unwrap().is_claimed());
        assert!(store.item(&WorkItemId::new("fresh")).await.unwrap().is_claimed());
    }

    #[tokio::test]
    async fn injected_result_write_failure_leaves_rows_untouched() {
        let store = InMemoryWorkStore::new();
        store.insert(item("1")).await;
        store.mark_claimed(&[WorkItemId::new("1")], at(1)).await.unwrap();
        store.fail_next_result_writes(1).await;

        let update = ItemUpdate {
            id: WorkItemId::new("1"),
            result_status: ResultOutcome::Success,
            result: Some(serde_json::json!({"output": "x"})),
        };
        assert!(store.apply_results(&[update.clone()]).await.is_err());
        assert!(store.item(&WorkItemId::new("1")).await.unwrap().is_claimed());

        assert_eq!(store.apply_results(&[update]).await.unwrap(), 1);
        assert!(!store.item(&WorkItemId::new("1")).await.unwrap().is_claimed());
    }

    #[tokio::test]
    async fn results_for_unknown_ids_are_not_inserted() {
        let store = InMemoryWorkStore::new();
        store.insert(item("1")).await;

        let written = store
            .apply_results(&[
                ItemUpdate {
                    id: WorkItemId::new("1"),
                    result_status: ResultOutcome::EmptyResult,
                    result: None,
                },
                ItemUpdate {
                    id: WorkItemId::new("gone"),
                    result_status: ResultOutcome::EmptyResult,
                    result: None,
                },
            ])
            .await
            .unwrap();

        assert_eq!(written, 1);
        assert_eq!(store.items().await.len(), 1);
    }
}
