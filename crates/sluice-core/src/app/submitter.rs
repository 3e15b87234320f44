//! BatchSubmitter - claim 済みの batch を downstream runner に dispatch する
//!
//! - dispatch は linear backoff（`base_delay × attempt`）で固定回数までリトライ
//! - 恒久エラー（429 以外の 4xx）はリトライしない
//! - 成功したら ledger に BatchJob 行を作る（completed=null, requested=false）。
//!   作成は store リトライ（exponential）で包む。リトライ後の Conflict は前の試行が書けていたとみなす
//!
//! リトライを使い切った場合、claim 済みの item は「claim されたが submit されていない」まま残り、
//! StuckLeaseRecovery が回収する。

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info};

use crate::app::retry::RetryPolicy;
use crate::domain::{
    BatchId, BatchJob, DispatchItem, DispatchRequest, SluiceError, StoreError, WorkItem,
};
use crate::ports::{BatchLedger, Clock, WorkflowRunner};

#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub batch_id: BatchId,
    pub item_count: usize,
    pub attempts: u32,
    /// `false` when the ledger row could not be created after dispatch.
    pub ledger_recorded: bool,
}

pub struct BatchSubmitter {
    runner: Arc<dyn WorkflowRunner>,
    ledger: Arc<dyn BatchLedger>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    ledger_retry: RetryPolicy,
    event_type: String,
}

impl BatchSubmitter {
    pub fn new(
        runner: Arc<dyn WorkflowRunner>,
        ledger: Arc<dyn BatchLedger>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        event_type: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            ledger,
            clock,
            retry,
            ledger_retry: RetryPolicy::exponential(3, Duration::from_millis(500), 2.0),
            event_type: event_type.into(),
        }
    }

    pub fn with_ledger_retry(mut self, retry: RetryPolicy) -> Self {
        self.ledger_retry = retry;
        self
    }

    async fn record(&self, job: &BatchJob) -> Result<(), StoreError> {
        self.ledger_retry
            .run("ledger_create", |attempt| async move {
                match self.ledger.create(job).await {
                    // 前の試行の応答だけが失われたケース
                    Err(StoreError::Conflict(_)) if attempt > 1 => Ok(()),
                    other => other,
                }
            })
            .await
    }

    pub async fn submit(
        &self,
        batch_id: BatchId,
        task_type: &str,
        items: &[WorkItem],
    ) -> Result<Submission, SluiceError> {
        let now = self.clock.now();
        let request = DispatchRequest {
            event_type: self.event_type.clone(),
            batch_id,
            task_type: task_type.to_string(),
            items: items.iter().map(DispatchItem::from).collect(),
            timestamp: now,
        };

        let mut attempts = 0;
        let dispatched = self
            .retry
            .run("dispatch", |attempt| {
                attempts = attempt;
                self.runner.dispatch(&request)
            })
            .await;
        if let Err(e) = dispatched {
            error!(
                batch_id = %batch_id,
                attempts,
                items = items.len(),
                error = %e,
                "dispatch failed, claims left for stuck-lease recovery"
            );
            return Err(e.into());
        }

        info!(batch_id = %batch_id, task_type, items = items.len(), attempts, "batch dispatched");

        let job = BatchJob::new(batch_id, task_type, items.len(), now);
        let ledger_recorded = match self.record(&job).await {
            Ok(()) => true,
            Err(e) => {
                // dispatch は成功している。runner 側の ledger 書き込みか recovery で回復する
                error!(
                    alert = true,
                    batch_id = %batch_id,
                    error = %e,
                    "consistency error: batch dispatched but ledger row not created"
                );
                false
            }
        };

        Ok(Submission {
            batch_id,
            item_count: items.len(),
            attempts,
            ledger_recorded,
        })
    }
}
