//! Orchestrator - 3 つの entry point
//!
//! - `run_claim_submit_cycle`: Recovery health → Admission → Claim → Submit
//! - `run_poll_reconcile_cycle`: Poll → Reconcile（budget 内）
//! - `run_recovery`: stuck claim の解放
//!
//! どの cycle もエラーを外に投げず、report に `success` と `error` を載せて返す。
//! cycle ごとに `CycleId` を持つ span を張る。

use std::sync::Arc;

use tracing::{Instrument, error, info, info_span, warn};

use crate::app::budget::InvocationBudget;
use crate::app::claimer::{ClaimRequest, LeaseClaimer};
use crate::app::gate::{ConcurrencyGate, DegradationMode};
use crate::app::poller::BatchPoller;
use crate::app::recovery::StuckLeaseRecovery;
use crate::app::report::{
    ClaimCycleReport, ErrorDetail, PollCycleReport, RecoveryReport, SkipReason,
};
use crate::app::submitter::BatchSubmitter;
use crate::config::SluiceConfig;
use crate::domain::{CycleId, SluiceError};
use crate::ports::{Clock, IdGenerator};

pub struct Orchestrator {
    pub(crate) config: SluiceConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) ids: Arc<dyn IdGenerator>,
    pub(crate) claimer: LeaseClaimer,
    pub(crate) gate: ConcurrencyGate,
    pub(crate) submitter: BatchSubmitter,
    pub(crate) poller: BatchPoller,
    pub(crate) recovery: StuckLeaseRecovery,
}

impl Orchestrator {
    pub fn config(&self) -> &SluiceConfig {
        &self.config
    }

    /// Claim pending work and dispatch it as one batch.
    ///
    /// `task_type` and `batch_size` override the configured values.
    pub async fn run_claim_submit_cycle(
        &self,
        task_type: Option<&str>,
        batch_size: Option<usize>,
    ) -> ClaimCycleReport {
        let cycle_id = self.ids.generate_cycle_id();
        let task_type = task_type.unwrap_or(&self.config.task_type).to_string();
        let span = info_span!("claim_cycle", cycle_id = %cycle_id, task_type = %task_type);
        self.claim_submit(cycle_id, &task_type, batch_size)
            .instrument(span)
            .await
    }

    async fn claim_submit(
        &self,
        cycle_id: CycleId,
        task_type: &str,
        batch_size: Option<usize>,
    ) -> ClaimCycleReport {
        let health = self.recovery.health(task_type);
        let mut report = ClaimCycleReport::new(cycle_id, task_type, health);

        if !health.is_healthy() {
            match self.config.gate_degradation {
                DegradationMode::FailClosed => {
                    warn!(
                        consecutive_failures = health.consecutive_failures,
                        "recovery unhealthy, skipping claim (fail_closed)"
                    );
                    return report.skip(SkipReason::RecoveryUnhealthy);
                }
                DegradationMode::FailOpen => warn!(
                    consecutive_failures = health.consecutive_failures,
                    "recovery unhealthy, claiming anyway (fail_open)"
                ),
            }
        }

        let decision = self.gate.admit(task_type).await;
        let admitted = decision.admitted;
        let degraded = decision.degraded;
        report.gate = Some(decision);
        if !admitted {
            let reason = if degraded {
                SkipReason::GateUnavailable
            } else {
                SkipReason::ConcurrencyCeiling
            };
            return report.skip(reason);
        }

        let request = ClaimRequest::new(
            task_type,
            batch_size.unwrap_or_else(|| self.config.batch_size_for(task_type)),
        )
        .with_hard_limit(self.config.hard_limit);
        let claim = match self.claimer.claim(&request).await {
            Ok(claim) => claim,
            Err(e) => {
                error!(error = %e, "claim failed");
                return report.fail(&e);
            }
        };
        report.requested = claim.requested;
        report.effective_size = claim.effective_size;
        report.shrinks = claim.shrinks;
        report.tiers = claim.tiers;
        report.claimed = claim.items.len();
        report.lost_races = claim.lost_races;

        if claim.items.is_empty() {
            info!("no pending work");
            return report.skip(SkipReason::NoWork);
        }

        let batch_id = self.ids.generate_batch_id();
        match self.submitter.submit(batch_id, task_type, &claim.items).await {
            Ok(submission) => {
                self.gate.invalidate(task_type);
                report.submission = Some(submission);
                report
            }
            Err(e) => report.fail(&e),
        }
    }

    /// Poll pending batches and reconcile the completed ones within the budget.
    pub async fn run_poll_reconcile_cycle(&self) -> PollCycleReport {
        let cycle_id = self.ids.generate_cycle_id();
        let span = info_span!("poll_cycle", cycle_id = %cycle_id);
        async {
            let budget = InvocationBudget::start(
                self.clock.clone(),
                self.config.wall_clock_budget,
                self.config.safety_buffer,
            );
            let result = self.poller.poll(&budget).await;
            let elapsed_ms = budget.elapsed().as_millis() as u64;
            match result {
                Ok(summary) => {
                    let error: Option<ErrorDetail> = summary
                        .consistency_error
                        .clone()
                        .map(|msg| (&SluiceError::Consistency(msg)).into());
                    info!(
                        examined = summary.examined,
                        reconciled = summary.reconciled,
                        failed = summary.failed,
                        deferred = summary.deferred,
                        elapsed_ms,
                        "poll cycle finished"
                    );
                    PollCycleReport {
                        cycle_id,
                        success: error.is_none(),
                        summary,
                        elapsed_ms,
                        error,
                    }
                }
                Err(e) => {
                    error!(error = %e, "poll cycle failed");
                    PollCycleReport {
                        cycle_id,
                        success: false,
                        summary: Default::default(),
                        elapsed_ms,
                        error: Some((&e).into()),
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Release claims older than the stuck-lease timeout.
    pub async fn run_recovery(&self, task_type: Option<&str>) -> RecoveryReport {
        let cycle_id = self.ids.generate_cycle_id();
        let task_type = task_type.unwrap_or(&self.config.task_type).to_string();
        let span = info_span!("recovery", cycle_id = %cycle_id, task_type = %task_type);
        async {
            let result = self.recovery.recover(&task_type).await;
            let health = self.recovery.health(&task_type);
            match result {
                Ok(summary) => RecoveryReport {
                    cycle_id,
                    task_type: task_type.clone(),
                    success: true,
                    summary: Some(summary),
                    health,
                    error: None,
                },
                Err(e) => RecoveryReport {
                    cycle_id,
                    task_type: task_type.clone(),
                    success: false,
                    summary: None,
                    health,
                    error: Some((&e).into()),
                },
            }
        }
        .instrument(span)
        .await
    }
}
