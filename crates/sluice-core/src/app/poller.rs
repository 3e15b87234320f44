//! BatchPoller - 未解決の BatchJob の remote status を budget 内で確認する
//!
//! cap は submit 済み（requested=true）の行にかかる。未 submit の行は別の query で
//! 同じ cap まで取り、submit 済みの行の後に処理する。
//!
//! # フロー（1 行ずつ、古い順）
//! 1. 残り budget が 0 なら残りを次の invocation に回す
//! 2. requested=false: runner がまだ submit していない。stuck timeout を超えたら completed=false
//! 3. `get_batch` を `min(per_call_timeout, remaining)` で呼ぶ
//! 4. Succeeded → ResultReconciler（同じ budget で）/ Failed → completed=false / Running → 何もしない
//!
//! 通信エラーは行を pending のまま残す（次の cycle で再確認）。

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::app::budget::InvocationBudget;
use crate::app::reconciler::ResultReconciler;
use crate::domain::{BatchJob, BatchPhase, ErrorKind, RemoteError, SluiceError};
use crate::ports::{BatchInferenceApi, BatchLedger, Clock};

#[derive(Debug, Clone, Default, Serialize)]
pub struct PollSummary {
    pub examined: usize,
    pub reconciled: usize,
    pub records_written: usize,
    pub failed: usize,
    pub still_running: usize,
    /// Not yet submitted by the runner.
    pub awaiting_submission: usize,
    /// Never submitted past the stuck timeout; marked failed.
    pub abandoned: usize,
    pub errors: usize,
    /// Left for the next invocation because the budget ran out.
    pub deferred: usize,
    /// Set when a consistency error stopped the cycle.
    pub consistency_error: Option<String>,
}

pub struct BatchPoller {
    ledger: Arc<dyn BatchLedger>,
    inference: Arc<dyn BatchInferenceApi>,
    reconciler: ResultReconciler,
    clock: Arc<dyn Clock>,
    cap: usize,
    per_call_timeout: Duration,
    stuck_timeout: Duration,
}

impl BatchPoller {
    pub fn new(
        ledger: Arc<dyn BatchLedger>,
        inference: Arc<dyn BatchInferenceApi>,
        reconciler: ResultReconciler,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger,
            inference,
            reconciler,
            clock,
            cap: 50,
            per_call_timeout: Duration::from_secs(30),
            stuck_timeout: Duration::from_secs(2 * 60 * 60),
        }
    }

    pub fn with_cap(mut self, cap: usize) -> Self {
        self.cap = cap;
        self
    }

    pub fn with_per_call_timeout(mut self, timeout: Duration) -> Self {
        self.per_call_timeout = timeout;
        self
    }

    pub fn with_stuck_timeout(mut self, timeout: Duration) -> Self {
        self.stuck_timeout = timeout;
        self
    }

    pub async fn poll(&self, budget: &InvocationBudget) -> Result<PollSummary, SluiceError> {
        let mut jobs = self.ledger.list_submitted(self.cap).await?;
        jobs.extend(self.ledger.list_unsubmitted(self.cap).await?);
        let mut summary = PollSummary::default();
        let total = jobs.len();

        for (idx, job) in jobs.iter().enumerate() {
            if budget.is_exhausted() {
                summary.deferred = total - idx;
                info!(
                    deferred = summary.deferred,
                    elapsed_ms = budget.elapsed().as_millis() as u64,
                    "budget exhausted, deferring remaining batches"
                );
                break;
            }
            summary.examined += 1;

            let Some(remote_id) = job.remote_batch_id.as_deref().filter(|_| job.requested) else {
                self.handle_unsubmitted(job, &mut summary).await;
                continue;
            };

            let timeout = budget.call_timeout(self.per_call_timeout);
            let remote = match tokio::time::timeout(timeout, self.inference.get_batch(remote_id))
                .await
            {
                Ok(Ok(remote)) => remote,
                Ok(Err(e)) => {
                    warn!(batch_id = %job.batch_id, remote_id, error = %e, "status lookup failed, leaving pending");
                    summary.errors += 1;
                    continue;
                }
                Err(_) => {
                    let e = RemoteError::Timeout(format!("get_batch after {timeout:?}"));
                    warn!(batch_id = %job.batch_id, remote_id, error = %e, "status lookup timed out, leaving pending");
                    summary.errors += 1;
                    continue;
                }
            };

            let counts = remote.request_counts;
            info!(
                batch_id = %job.batch_id,
                remote_id,
                status = %remote.status,
                total = counts.total,
                completed = counts.completed,
                failed = counts.failed,
                "remote batch status"
            );

            match remote.status.phase() {
                BatchPhase::Running => summary.still_running += 1,
                BatchPhase::Failed => match self.ledger.set_completed(&job.batch_id, false).await {
                    Ok(()) => summary.failed += 1,
                    Err(e) => {
                        warn!(batch_id = %job.batch_id, error = %e, "failed to record terminal failure");
                        summary.errors += 1;
                    }
                },
                BatchPhase::Succeeded => match self.reconciler.reconcile(job, &remote, budget).await {
                    Ok(rec) => {
                        summary.reconciled += 1;
                        summary.records_written += rec.written;
                    }
                    Err(e) if e.kind() == ErrorKind::Consistency => {
                        summary.errors += 1;
                        summary.consistency_error = Some(e.to_string());
                        summary.deferred = total - idx - 1;
                        error!(
                            alert = true,
                            batch_id = %job.batch_id,
                            error = %e,
                            "stopping poll cycle on consistency error"
                        );
                        break;
                    }
                    Err(e) => {
                        warn!(batch_id = %job.batch_id, error = %e, "reconciliation failed, batch stays pending");
                        summary.errors += 1;
                    }
                },
            }
        }

        Ok(summary)
    }

    async fn handle_unsubmitted(&self, job: &BatchJob, summary: &mut PollSummary) {
        let age = job.age(self.clock.now()).to_std().unwrap_or(Duration::ZERO);
        if age <= self.stuck_timeout {
            debug!(batch_id = %job.batch_id, "batch not yet submitted by runner");
            summary.awaiting_submission += 1;
            return;
        }
        match self.ledger.set_completed(&job.batch_id, false).await {
            Ok(()) => {
                warn!(
                    batch_id = %job.batch_id,
                    age_secs = age.as_secs(),
                    "batch never submitted, abandoning"
                );
                summary.abandoned += 1;
            }
            Err(e) => {
                warn!(batch_id = %job.batch_id, error = %e, "failed to abandon unsubmitted batch");
                summary.errors += 1;
            }
        }
    }
}
