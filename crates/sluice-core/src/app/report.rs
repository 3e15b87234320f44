//! Cycle reports returned by the orchestrator entry points.
//!
//! A cycle never propagates an error past its boundary; failures end up in
//! `success = false` plus `error`.

use serde::Serialize;

use crate::app::claimer::TierCount;
use crate::app::gate::GateDecision;
use crate::app::poller::PollSummary;
use crate::app::recovery::{RecoveryHealth, RecoverySummary};
use crate::app::submitter::Submission;
use crate::domain::{CycleId, ErrorKind, SluiceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Stuck-lease recovery is failing and the gate is fail-closed.
    RecoveryUnhealthy,
    ConcurrencyCeiling,
    /// In-flight count unknown and the gate is fail-closed.
    GateUnavailable,
    NoWork,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorDetail {
    pub kind: String,
    pub message: String,
}

impl From<&SluiceError> for ErrorDetail {
    fn from(err: &SluiceError) -> Self {
        let kind = match err.kind() {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Parse => "parse",
            ErrorKind::Consistency => "consistency",
            ErrorKind::Configuration => "configuration",
        };
        Self {
            kind: kind.to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClaimCycleReport {
    pub cycle_id: CycleId,
    pub task_type: String,
    pub success: bool,
    pub skipped: Option<SkipReason>,
    pub recovery_health: RecoveryHealth,
    pub gate: Option<GateDecision>,
    pub requested: usize,
    pub effective_size: usize,
    pub shrinks: u32,
    pub tiers: Vec<TierCount>,
    pub claimed: usize,
    pub lost_races: usize,
    pub submission: Option<Submission>,
    pub error: Option<ErrorDetail>,
}

impl ClaimCycleReport {
    pub(crate) fn new(cycle_id: CycleId, task_type: &str, recovery_health: RecoveryHealth) -> Self {
        Self {
            cycle_id,
            task_type: task_type.to_string(),
            success: true,
            skipped: None,
            recovery_health,
            gate: None,
            requested: 0,
            effective_size: 0,
            shrinks: 0,
            tiers: Vec::new(),
            claimed: 0,
            lost_races: 0,
            submission: None,
            error: None,
        }
    }

    pub(crate) fn skip(mut self, reason: SkipReason) -> Self {
        self.skipped = Some(reason);
        self
    }

    pub(crate) fn fail(mut self, err: &SluiceError) -> Self {
        self.success = false;
        self.error = Some(err.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PollCycleReport {
    pub cycle_id: CycleId,
    pub success: bool,
    pub summary: PollSummary,
    pub elapsed_ms: u64,
    pub error: Option<ErrorDetail>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryReport {
    pub cycle_id: CycleId,
    pub task_type: String,
    pub success: bool,
    pub summary: Option<RecoverySummary>,
    pub health: RecoveryHealth,
    pub error: Option<ErrorDetail>,
}
