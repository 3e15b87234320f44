//! LeaseClaimer - 未処理の WorkItem を tier 順に選んで claim する
//!
//! # フロー
//! 1. tier ごとに `select_candidates`（Unprocessed を使い切ってから PreviouslyInvalid）
//! 2. statement timeout なら要求サイズを半分にして同じ tier を再試行（floor 未満になったら諦める）
//! 3. 集めた id を 1 回の条件付き bulk update で claim
//! 4. store が実際に flip した id だけを返す
//!
//! mark に失敗したら cycle は fatal。mark されていない item は絶対に submit しない。

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{ClaimTier, SluiceError, StoreError, WorkItem, WorkItemId};
use crate::ports::{Clock, WorkClaimStore};

#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub task_type: String,
    pub batch_size: usize,
    pub hard_limit: Option<usize>,
}

impl ClaimRequest {
    pub fn new(task_type: impl Into<String>, batch_size: usize) -> Self {
        Self {
            task_type: task_type.into(),
            batch_size,
            hard_limit: None,
        }
    }

    pub fn with_hard_limit(mut self, limit: Option<usize>) -> Self {
        self.hard_limit = limit;
        self
    }

    fn target(&self) -> usize {
        match self.hard_limit {
            Some(limit) => self.batch_size.min(limit),
            None => self.batch_size,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct TierCount {
    pub tier: ClaimTier,
    pub selected: usize,
}

#[derive(Debug, Clone)]
pub struct ClaimOutcome {
    /// Items this cycle now owns, in query-return order.
    pub items: Vec<WorkItem>,
    pub requested: usize,
    /// Size after shrinking.
    pub effective_size: usize,
    pub shrinks: u32,
    pub tiers: Vec<TierCount>,
    /// Candidates another invocation flipped first.
    pub lost_races: usize,
}

pub struct LeaseClaimer {
    store: Arc<dyn WorkClaimStore>,
    clock: Arc<dyn Clock>,
    floor: usize,
}

impl LeaseClaimer {
    pub fn new(store: Arc<dyn WorkClaimStore>, clock: Arc<dyn Clock>, floor: usize) -> Self {
        Self {
            store,
            clock,
            floor: floor.max(1),
        }
    }

    pub async fn claim(&self, request: &ClaimRequest) -> Result<ClaimOutcome, SluiceError> {
        let requested = request.target();
        let mut size = requested;
        let mut shrinks = 0;
        let mut candidates: Vec<WorkItem> = Vec::new();
        let mut seen: HashSet<WorkItemId> = HashSet::new();
        let mut tiers = Vec::with_capacity(ClaimTier::ORDER.len());

        for tier in ClaimTier::ORDER {
            let mut want = size.saturating_sub(candidates.len());
            if want == 0 {
                break;
            }

            let rows = loop {
                match self
                    .store
                    .select_candidates(&request.task_type, tier, want)
                    .await
                {
                    Ok(rows) => break rows,
                    Err(StoreError::StatementTimeout(message)) => {
                        let next = want / 2;
                        if next < self.floor {
                            warn!(
                                task_type = %request.task_type,
                                tier = tier.as_str(),
                                size = want,
                                floor = self.floor,
                                "statement timeout at claim floor, giving up"
                            );
                            return Err(StoreError::StatementTimeout(message).into());
                        }
                        info!(
                            task_type = %request.task_type,
                            tier = tier.as_str(),
                            from = want,
                            to = next,
                            "statement timeout, shrinking claim size"
                        );
                        shrinks += 1;
                        size = candidates.len() + next;
                        want = next;
                    }
                    Err(e) => return Err(e.into()),
                }
            };

            let before = candidates.len();
            for row in rows {
                if seen.insert(row.id.clone()) {
                    candidates.push(row);
                }
            }
            tiers.push(TierCount {
                tier,
                selected: candidates.len() - before,
            });
            debug!(tier = tier.as_str(), selected = candidates.len() - before, "tier selected");
        }
        candidates.truncate(size);

        if candidates.is_empty() {
            return Ok(ClaimOutcome {
                items: Vec::new(),
                requested,
                effective_size: size,
                shrinks,
                tiers,
                lost_races: 0,
            });
        }

        let claimed_at = self.clock.now();
        let ids: Vec<WorkItemId> = candidates.iter().map(|c| c.id.clone()).collect();
        let flipped: HashSet<WorkItemId> = self
            .store
            .mark_claimed(&ids, claimed_at)
            .await?
            .into_iter()
            .collect();

        let lost_races = candidates.len() - flipped.len().min(candidates.len());
        if lost_races > 0 {
            warn!(
                task_type = %request.task_type,
                lost_races,
                "some candidates were claimed by another invocation"
            );
        }

        let items: Vec<WorkItem> = candidates
            .into_iter()
            .filter(|c| flipped.contains(&c.id))
            .map(|mut c| {
                c.try_claim(claimed_at);
                c
            })
            .collect();

        info!(
            task_type = %request.task_type,
            claimed = items.len(),
            requested,
            effective_size = size,
            shrinks,
            "claimed work items"
        );

        Ok(ClaimOutcome {
            items,
            requested,
            effective_size: size,
            shrinks,
            tiers,
            lost_races,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ErrorKind, ResultOutcome};
    use crate::impls::InMemoryWorkStore;
    use crate::ports::FixedClock;
    use chrono::{TimeZone, Utc};

    fn clock() -> Arc<FixedClock> {
        Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ))
    }

    fn items(range: std::ops::Range<usize>) -> Vec<WorkItem> {
        range
            .map(|i| WorkItem::new(WorkItemId::new(i.to_string()), "translate"))
            .collect()
    }

    fn claimer(store: &InMemoryWorkStore, floor: usize) -> LeaseClaimer {
        LeaseClaimer::new(Arc::new(store.clone()), clock(), floor)
    }

    #[tokio::test]
    async fn shrinks_by_half_until_the_store_answers() {
        let store = InMemoryWorkStore::new();
        store.insert_all(items(0..2000)).await;
        store.set_timeout_above(Some(250)).await;

        let outcome = claimer(&store, 250)
            .claim(&ClaimRequest::new("translate", 1000))
            .await
            .unwrap();

        assert_eq!(store.select_limits().await, vec![1000, 500, 250]);
        assert_eq!(outcome.items.len(), 250);
        assert_eq!(outcome.effective_size, 250);
        assert_eq!(outcome.shrinks, 2);
        assert_eq!(store.claimed_count().await, 250);
    }

    #[tokio::test]
    async fn surfaces_timeout_below_floor_without_claiming() {
        let store = InMemoryWorkStore::new();
        store.insert_all(items(0..2000)).await;
        store.set_timeout_above(Some(100)).await;

        let err = claimer(&store, 250)
            .claim(&ClaimRequest::new("translate", 1000))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Transient);
        assert_eq!(store.select_limits().await, vec![1000, 500, 250]);
        assert_eq!(store.claimed_count().await, 0);
    }

    #[tokio::test]
    async fn unprocessed_tier_is_exhausted_before_invalid_tier() {
        let store = InMemoryWorkStore::new();
        store
            .insert_all([
                WorkItem::new(WorkItemId::new("bad-1"), "translate")
                    .with_result_status(ResultOutcome::InvalidFormat),
                WorkItem::new(WorkItemId::new("new-1"), "translate"),
                WorkItem::new(WorkItemId::new("bad-2"), "translate")
                    .with_result_status(ResultOutcome::InvalidFormat),
                WorkItem::new(WorkItemId::new("new-2"), "translate"),
                WorkItem::new(WorkItemId::new("done"), "translate")
                    .with_result_status(ResultOutcome::Success),
            ])
            .await;

        let outcome = claimer(&store, 1)
            .claim(&ClaimRequest::new("translate", 3))
            .await
            .unwrap();

        let ids: Vec<&str> = outcome.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["new-1", "new-2", "bad-1"]);
        assert_eq!(store.select_limits().await, vec![3, 1]);
        assert_eq!(outcome.tiers[0].selected, 2);
        assert_eq!(outcome.tiers[1].selected, 1);
    }

    #[tokio::test]
    async fn hard_limit_caps_the_target() {
        let store = InMemoryWorkStore::new();
        store.insert_all(items(0..50)).await;

        let outcome = claimer(&store, 1)
            .claim(&ClaimRequest::new("translate", 40).with_hard_limit(Some(10)))
            .await
            .unwrap();

        assert_eq!(outcome.requested, 10);
        assert_eq!(outcome.items.len(), 10);
    }

    #[tokio::test]
    async fn repeated_cycles_make_progress_without_double_claims() {
        let store = InMemoryWorkStore::new();
        store.insert_all(items(0..25)).await;
        let claimer = claimer(&store, 1);

        let mut seen = HashSet::new();
        for _ in 0..3 {
            let outcome = claimer
                .claim(&ClaimRequest::new("translate", 10))
                .await
                .unwrap();
            for item in outcome.items {
                assert!(item.is_claimed());
                assert!(seen.insert(item.id), "item claimed twice");
            }
        }
        assert_eq!(seen.len(), 25);
    }

    #[tokio::test]
    async fn mark_failure_is_fatal() {
        let store = InMemoryWorkStore::new();
        store.insert_all(items(0..5)).await;
        store.fail_next_marks(1).await;

        let result = claimer(&store, 1)
            .claim(&ClaimRequest::new("translate", 5))
            .await;

        assert!(result.is_err());
        assert_eq!(store.claimed_count().await, 0);
    }

    #[tokio::test]
    async fn empty_queue_claims_nothing() {
        let store = InMemoryWorkStore::new();
        let outcome = claimer(&store, 1)
            .claim(&ClaimRequest::new("translate", 5))
            .await
            .unwrap();
        assert!(outcome.items.is_empty());
    }
}
