//! StuckLeaseRecovery - 期限切れの claim を解放する
//!
//! `claimed_at < now - timeout`（厳密に前）の claim を固定サイズの page で解放する。
//! 解放は `claimed_at < cutoff` 条件付きの bulk update なので、並行して取られた新しい claim は触らない。
//!
//! 連続失敗回数は Cache に永続化し、閾値を超えたら `alert = true` でログに出す。
//! claim cycle はこの health を見て claim を止めるかどうか決める。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::app::retry::RetryPolicy;
use crate::domain::{SluiceError, WorkItemId};
use crate::ports::cache::{increment_counter, read_counter, reset_counter};
use crate::ports::{Cache, Clock, WorkClaimStore};

#[derive(Debug, Clone, Serialize)]
pub struct RecoverySummary {
    pub cutoff: DateTime<Utc>,
    /// Stale claims counted before paging.
    pub stale_found: usize,
    pub examined: usize,
    pub released: usize,
    pub pages: usize,
    /// More stale claims remain than the cap allowed.
    pub capped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecoveryHealth {
    pub consecutive_failures: u32,
    pub threshold: u32,
}

impl RecoveryHealth {
    pub fn is_healthy(&self) -> bool {
        self.consecutive_failures < self.threshold
    }
}

pub struct StuckLeaseRecovery {
    store: Arc<dyn WorkClaimStore>,
    cache: Arc<dyn Cache>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    page_size: usize,
    total_cap: usize,
    alert_threshold: u32,
    retry: RetryPolicy,
}

impl StuckLeaseRecovery {
    pub fn new(
        store: Arc<dyn WorkClaimStore>,
        cache: Arc<dyn Cache>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            clock,
            timeout,
            page_size: 500,
            total_cap: 5000,
            alert_threshold: 3,
            retry: RetryPolicy::exponential(3, Duration::from_millis(500), 2.0),
        }
    }

    pub fn with_paging(mut self, page_size: usize, total_cap: usize) -> Self {
        self.page_size = page_size.max(1);
        self.total_cap = total_cap;
        self
    }

    pub fn with_alert_threshold(mut self, threshold: u32) -> Self {
        self.alert_threshold = threshold.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn failure_key(task_type: &str) -> String {
        format!("recovery.failures.{task_type}")
    }

    pub fn health(&self, task_type: &str) -> RecoveryHealth {
        let consecutive_failures = read_counter(self.cache.as_ref(), &Self::failure_key(task_type))
            .unwrap_or_else(|e| {
                warn!(error = %e, "recovery failure counter unreadable");
                0
            });
        RecoveryHealth {
            consecutive_failures,
            threshold: self.alert_threshold,
        }
    }

    pub async fn recover(&self, task_type: &str) -> Result<RecoverySummary, SluiceError> {
        let result = self.release_stale(task_type).await;
        let key = Self::failure_key(task_type);
        match &result {
            Ok(_) => {
                if let Err(e) = reset_counter(self.cache.as_ref(), &key) {
                    warn!(error = %e, "could not reset recovery failure counter");
                }
            }
            Err(err) => match increment_counter(self.cache.as_ref(), &key) {
                Ok(failures) if failures >= self.alert_threshold => error!(
                    alert = true,
                    task_type,
                    consecutive_failures = failures,
                    threshold = self.alert_threshold,
                    error = %err,
                    "stuck-lease recovery keeps failing"
                ),
                Ok(failures) => warn!(
                    task_type,
                    consecutive_failures = failures,
                    error = %err,
                    "stuck-lease recovery failed"
                ),
                Err(e) => warn!(error = %e, "could not record recovery failure"),
            },
        }
        result
    }

    async fn release_stale(&self, task_type: &str) -> Result<RecoverySummary, SluiceError> {
        let timeout = chrono::Duration::from_std(self.timeout)
            .map_err(|e| SluiceError::Configuration(format!("stuck lease timeout: {e}")))?;
        let cutoff = self.clock.now() - timeout;

        let stale_found = self
            .retry
            .run("count_stale_claims", |_| {
                self.store.count_stale_claims(task_type, cutoff)
            })
            .await?;
        let mut summary = RecoverySummary {
            cutoff,
            stale_found,
            examined: 0,
            released: 0,
            pages: 0,
            capped: false,
        };
        if stale_found == 0 {
            debug!(task_type, %cutoff, "no stale claims");
            return Ok(summary);
        }
        info!(task_type, stale_found, %cutoff, "releasing stale claims");

        // 解放された行は結果集合から消えるので、offset は解放できなかった行の分だけ進める
        let mut offset = 0;
        while summary.examined < self.total_cap {
            let limit = self.page_size.min(self.total_cap - summary.examined);
            let page = self
                .retry
                .run("select_stale_claims", |_| {
                    self.store.select_stale_claims(task_type, cutoff, limit, offset)
                })
                .await?;
            if page.is_empty() {
                break;
            }

            let ids: Vec<WorkItemId> = page.iter().map(|item| item.id.clone()).collect();
            let released = self
                .retry
                .run("release_stale", |_| self.store.release_stale(&ids, cutoff))
                .await
                .inspect_err(|e| {
                    warn!(task_type, page = summary.pages + 1, error = %e, "page release failed");
                })?;

            summary.pages += 1;
            summary.examined += page.len();
            summary.released += released;
            offset += page.len().saturating_sub(released);
            debug!(page = summary.pages, size = page.len(), released, "page released");

            if page.len() < limit {
                break;
            }
        }
        summary.capped = summary.examined >= self.total_cap && stale_found > summary.examined;

        info!(
            task_type,
            released = summary.released,
            pages = summary.pages,
            capped = summary.capped,
            "stale claims released"
        );
        Ok(summary)
    }
}
