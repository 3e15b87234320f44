//! WorkItem record and claim (lease) management.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::WorkItemId;
use super::outcome::{ItemUpdate, ResultOutcome};

/// A row of the work store.
///
/// Design:
/// - The store is the single source of truth; this is a snapshot of one row.
/// - `claimed` is tri-state in the store (null / true). `None` means unclaimed.
/// - Invariant: `claimed == Some(true)` implies `claimed_at.is_some()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,

    pub task_type: String,

    #[serde(default)]
    pub claimed: Option<bool>,

    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,

    /// Outcome of the last reconciliation (`None` = never processed).
    #[serde(default)]
    pub result_status: Option<ResultOutcome>,

    #[serde(default)]
    pub result: Option<serde_json::Value>,

    /// Payload fields, opaque to the orchestrator.
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl WorkItem {
    pub fn new(id: WorkItemId, task_type: impl Into<String>) -> Self {
        Self {
            id,
            task_type: task_type.into(),
            claimed: None,
            claimed_at: None,
            result_status: None,
            result: None,
            payload: serde_json::Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    pub fn with_result_status(mut self, status: ResultOutcome) -> Self {
        self.result_status = Some(status);
        self
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed == Some(true)
    }

    pub fn lease(&self) -> Option<LeaseClaim> {
        match (self.claimed, self.claimed_at) {
            (Some(true), Some(claimed_at)) => Some(LeaseClaim { claimed_at }),
            _ => None,
        }
    }

    /// Conditional claim: only flips an unclaimed row. Returns whether it flipped.
    pub fn try_claim(&mut self, at: DateTime<Utc>) -> bool {
        if self.claimed.is_some() {
            return false;
        }
        self.claimed = Some(true);
        self.claimed_at = Some(at);
        true
    }

    /// Release the claim (claimed -> null).
    pub fn release(&mut self) {
        self.claimed = None;
        self.claimed_at = None;
    }

    /// A claim is stale when it was taken strictly before `cutoff`.
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        self.lease().is_some_and(|lease| lease.claimed_at < cutoff)
    }

    /// Fold a reconciliation result into this row (idempotent).
    pub fn apply(&mut self, update: &ItemUpdate) {
        self.release();
        self.result_status = Some(update.result_status);
        if update.result_status.is_success() {
            self.result = update.result.clone();
        }
    }
}

/// The `(claimed, claimed_at)` pair of a claimed row.
///
/// No TTL is enforced by the store; stuck-lease recovery enforces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseClaim {
    pub claimed_at: DateTime<Utc>,
}

impl LeaseClaim {
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.claimed_at
    }
}

/// Priority tiers used when selecting claim candidates.
///
/// The primary tier is exhausted before the secondary tier is concatenated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimTier {
    /// Never processed (`result_status IS NULL`).
    Unprocessed,
    /// Processed before, but the result was invalid.
    PreviouslyInvalid,
}

impl ClaimTier {
    pub const ORDER: [ClaimTier; 2] = [ClaimTier::Unprocessed, ClaimTier::PreviouslyInvalid];

    /// Does an unclaimed row belong to this tier?
    pub fn matches(self, item: &WorkItem) -> bool {
        if item.claimed.is_some() {
            return false;
        }
        match self {
            ClaimTier::Unprocessed => item.result_status.is_none(),
            ClaimTier::PreviouslyInvalid => {
                item.result_status == Some(ResultOutcome::InvalidFormat)
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClaimTier::Unprocessed => "unprocessed",
            ClaimTier::PreviouslyInvalid => "previously_invalid",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rstest::rstest;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn claim_is_conditional() {
        let mut item = WorkItem::new(WorkItemId::new("1"), "translate");
        assert!(item.try_claim(at(1)));
        assert!(!item.try_claim(at(2)));
        assert_eq!(item.claimed_at, Some(at(1)));
        assert_eq!(item.lease().unwrap().age(at(3)), Duration::hours(2));
    }

    #[test]
    fn staleness_is_strict() {
        let mut item = WorkItem::new(WorkItemId::new("1"), "translate");
        item.try_claim(at(1));
        assert!(!item.is_stale(at(1)));
        assert!(item.is_stale(at(2)));
    }

    #[test]
    fn apply_clears_claim_and_keeps_payload_only_on_success() {
        let mut item = WorkItem::new(WorkItemId::new("1"), "translate");
        item.try_claim(at(1));

        item.apply(&ItemUpdate {
            id: item.id.clone(),
            result_status: ResultOutcome::EmptyResult,
            result: None,
        });

        assert_eq!(item.claimed, None);
        assert_eq!(item.claimed_at, None);
        assert_eq!(item.result_status, Some(ResultOutcome::EmptyResult));
        assert_eq!(item.result, None);
    }

    #[rstest]
    #[case::fresh(None, ClaimTier::Unprocessed, true)]
    #[case::fresh_not_secondary(None, ClaimTier::PreviouslyInvalid, false)]
    #[case::invalid(Some(ResultOutcome::InvalidFormat), ClaimTier::PreviouslyInvalid, true)]
    #[case::invalid_not_primary(Some(ResultOutcome::InvalidFormat), ClaimTier::Unprocessed, false)]
    #[case::done(Some(ResultOutcome::Success), ClaimTier::Unprocessed, false)]
    #[case::done_not_secondary(Some(ResultOutcome::Success), ClaimTier::PreviouslyInvalid, false)]
    fn tier_predicates(
        #[case] status: Option<ResultOutcome>,
        #[case] tier: ClaimTier,
        #[case] expected: bool,
    ) {
        let mut item = WorkItem::new(WorkItemId::new("1"), "translate");
        item.result_status = status;
        assert_eq!(tier.matches(&item), expected);
    }

    #[test]
    fn claimed_rows_match_no_tier() {
        let mut item = WorkItem::new(WorkItemId::new("1"), "translate");
        item.try_claim(at(1));
        assert!(ClaimTier::ORDER.iter().all(|tier| !tier.matches(&item)));
    }

    #[test]
    fn payload_fields_are_flattened() {
        let json = serde_json::json!({
            "id": 7,
            "task_type": "translate",
            "claimed": null,
            "source_text": "hola"
        });
        let item: WorkItem = serde_json::from_value(json).unwrap();
        assert_eq!(item.id.as_str(), "7");
        assert_eq!(item.payload["source_text"], "hola");
        assert!(!item.is_claimed());
    }
}
