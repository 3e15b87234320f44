//! WorkClaimStore port - work item の正本（source of truth）
//!
//! # 設計原則
//! - すべての mutation は条件付き（conditional）で、冪等に書く
//! - プロセス内ロックは使わない。競合は store 側の条件付き write で解決する
//! - claim は「select → mark」の 2 往復。mark は実際に flip した id だけを返す

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{ClaimTier, ItemUpdate, StoreError, WorkItem, WorkItemId};

#[async_trait]
pub trait WorkClaimStore: Send + Sync {
    /// Unclaimed rows of `task_type` matching `tier`, in store order, at most `limit`.
    async fn select_candidates(
        &self,
        task_type: &str,
        tier: ClaimTier,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError>;

    /// Flip `claimed` null -> true for `ids`, only where it is still null.
    ///
    /// Returns the ids that were actually flipped.
    async fn mark_claimed(
        &self,
        ids: &[WorkItemId],
        claimed_at: DateTime<Utc>,
    ) -> Result<Vec<WorkItemId>, StoreError>;

    /// Exact number of claims of `task_type` taken strictly before `cutoff`.
    async fn count_stale_claims(
        &self,
        task_type: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    /// One page of claims of `task_type` taken strictly before `cutoff`.
    async fn select_stale_claims(
        &self,
        task_type: &str,
        cutoff: DateTime<Utc>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<WorkItem>, StoreError>;

    /// Release claims for `ids`, scoped to rows still claimed before `cutoff`.
    ///
    /// Returns the number of rows released.
    async fn release_stale(
        &self,
        ids: &[WorkItemId],
        cutoff: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    /// Write reconciliation results onto existing rows. Each update clears the claim.
    ///
    /// Ids with no row are skipped, never inserted. Returns the number of rows written.
    async fn apply_results(&self, updates: &[ItemUpdate]) -> Result<usize, StoreError>;
}
