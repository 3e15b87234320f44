//! ConcurrencyGate - downstream で実行中の自分の job 数による admission control
//!
//! # 自分の run かどうか
//! 独立した述語の組み合わせ: `(name 一致 OR path 部分一致) AND (event 一致 OR branch 一致)`
//!
//! # 劣化モード
//! run 一覧の取得が連続失敗の上限に達したとき:
//! - FailClosed（既定）: deny
//! - FailOpen: in-flight を 0 とみなして admit
//!
//! in-flight 数は Cache に短い TTL で置き、dispatch 成功後に invalidate する。

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::app::retry::RetryPolicy;
use crate::domain::WorkflowRun;
use crate::ports::Cache;
use crate::ports::WorkflowRunner;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationMode {
    #[default]
    FailClosed,
    FailOpen,
}

/// How our own runs look in the runner's listing.
#[derive(Debug, Clone)]
pub struct RunMatcher {
    pub name: String,
    pub path: String,
    pub event: String,
    pub branch: String,
}

pub fn matches_name(run: &WorkflowRun, name: &str) -> bool {
    run.name.as_deref() == Some(name)
}

pub fn matches_path(run: &WorkflowRun, path: &str) -> bool {
    !path.is_empty() && run.path.as_deref().is_some_and(|p| p.contains(path))
}

pub fn matches_event(run: &WorkflowRun, event: &str) -> bool {
    run.event.as_deref() == Some(event)
}

pub fn matches_branch(run: &WorkflowRun, branch: &str) -> bool {
    run.head_branch.as_deref() == Some(branch)
}

impl RunMatcher {
    pub fn is_own_run(&self, run: &WorkflowRun) -> bool {
        let primary = matches_name(run, &self.name) || matches_path(run, &self.path);
        let corroborated = matches_event(run, &self.event) || matches_branch(run, &self.branch);
        primary && corroborated
    }

    pub fn count(&self, runs: &[WorkflowRun]) -> usize {
        runs.iter().filter(|run| self.is_own_run(run)).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateDecision {
    pub admitted: bool,
    /// `None` when the listing was unavailable.
    pub in_flight: Option<usize>,
    pub max_concurrent: usize,
    /// Decided by the degradation mode rather than by a count.
    pub degraded: bool,
}

pub struct ConcurrencyGate {
    runner: Arc<dyn WorkflowRunner>,
    cache: Arc<dyn Cache>,
    matcher: RunMatcher,
    max_concurrent: usize,
    mode: DegradationMode,
    /// Consecutive listing failures tolerated before degrading.
    retry: RetryPolicy,
    cache_ttl: Duration,
}

impl ConcurrencyGate {
    pub fn new(
        runner: Arc<dyn WorkflowRunner>,
        cache: Arc<dyn Cache>,
        matcher: RunMatcher,
        max_concurrent: usize,
    ) -> Self {
        Self {
            runner,
            cache,
            matcher,
            max_concurrent,
            mode: DegradationMode::FailClosed,
            retry: RetryPolicy::exponential(3, Duration::from_millis(500), 2.0),
            cache_ttl: Duration::from_secs(30),
        }
    }

    pub fn with_mode(mut self, mode: DegradationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    fn cache_key(task_type: &str) -> String {
        format!("gate.in_flight.{task_type}")
    }

    /// Count of our runs in progress, cached for `cache_ttl`.
    pub async fn in_flight(&self, task_type: &str) -> Option<usize> {
        let key = Self::cache_key(task_type);
        match self.cache.get(&key) {
            Ok(Some(v)) => {
                if let Some(n) = v.as_u64() {
                    debug!(task_type, in_flight = n, "in-flight count from cache");
                    return Some(n as usize);
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "gate cache read failed"),
        }

        let runs = self
            .retry
            .run("list_in_progress_runs", |_| self.runner.list_in_progress_runs())
            .await;
        match runs {
            Ok(runs) => {
                let count = self.matcher.count(&runs);
                if let Err(e) = self
                    .cache
                    .set(&key, serde_json::json!(count), Some(self.cache_ttl))
                {
                    warn!(error = %e, "gate cache write failed");
                }
                Some(count)
            }
            Err(e) => {
                error!(
                    task_type,
                    attempts = self.retry.max_attempts,
                    error = %e,
                    "run listing failed past the failure ceiling"
                );
                None
            }
        }
    }

    pub async fn admit(&self, task_type: &str) -> GateDecision {
        match self.in_flight(task_type).await {
            Some(in_flight) => {
                let admitted = in_flight < self.max_concurrent;
                if admitted {
                    debug!(task_type, in_flight, max = self.max_concurrent, "admitted");
                } else {
                    info!(
                        task_type,
                        in_flight,
                        max = self.max_concurrent,
                        "concurrency ceiling reached, skipping cycle"
                    );
                }
                GateDecision {
                    admitted,
                    in_flight: Some(in_flight),
                    max_concurrent: self.max_concurrent,
                    degraded: false,
                }
            }
            None => {
                let admitted = self.mode == DegradationMode::FailOpen;
                if admitted {
                    warn!(task_type, mode = "fail_open", "in-flight count unknown, assuming 0");
                } else {
                    warn!(task_type, mode = "fail_closed", "in-flight count unknown, denying");
                }
                GateDecision {
                    admitted,
                    in_flight: None,
                    max_concurrent: self.max_concurrent,
                    degraded: true,
                }
            }
        }
    }

    /// Forget the cached count (after a dispatch).
    pub fn invalidate(&self, task_type: &str) {
        if let Err(e) = self.cache.invalidate(&Self::cache_key(task_type)) {
            warn!(error = %e, "gate cache invalidate failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::{MemoryCache, ScriptedRunner};
    use crate::ports::FixedClock;
    use chrono::{TimeZone, Utc};
    use rstest::rstest;

    fn matcher() -> RunMatcher {
        RunMatcher {
            name: "sluice-batch".into(),
            path: ".github/workflows/sluice-batch.yml".into(),
            event: "repository_dispatch".into(),
            branch: "main".into(),
        }
    }

    fn run(
        id: u64,
        name: Option<&str>,
        path: Option<&str>,
        event: Option<&str>,
        branch: Option<&str>,
    ) -> WorkflowRun {
        WorkflowRun {
            id,
            name: name.map(String::from),
            path: path.map(String::from),
            event: event.map(String::from),
            head_branch: branch.map(String::from),
            status: Some("in_progress".into()),
        }
    }

    fn own(id: u64) -> WorkflowRun {
        run(id, Some("sluice-batch"), None, Some("repository_dispatch"), None)
    }

    #[rstest]
    #[case::name_and_event(Some("sluice-batch"), None, Some("repository_dispatch"), None, true)]
    #[case::path_and_branch(
        Some("renamed"),
        Some(".github/workflows/sluice-batch.yml@refs/heads/main"),
        Some("push"),
        Some("main"),
        true
    )]
    #[case::name_without_corroboration(Some("sluice-batch"), None, Some("push"), Some("dev"), false)]
    #[case::corroboration_without_primary(Some("lint"), Some("lint.yml"), Some("repository_dispatch"), Some("main"), false)]
    #[case::all_missing(None, None, None, None, false)]
    fn own_run_predicate(
        #[case] name: Option<&str>,
        #[case] path: Option<&str>,
        #[case] event: Option<&str>,
        #[case] branch: Option<&str>,
        #[case] expected: bool,
    ) {
        assert_eq!(matcher().is_own_run(&run(1, name, path, event, branch)), expected);
    }

    fn gate(runner: &ScriptedRunner, max: usize) -> ConcurrencyGate {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        ConcurrencyGate::new(
            Arc::new(runner.clone()),
            Arc::new(MemoryCache::new(clock)),
            matcher(),
            max,
        )
        .with_retry(RetryPolicy::linear(3, Duration::ZERO))
    }

    #[tokio::test]
    async fn three_of_four_admits() {
        let runner = ScriptedRunner::new();
        runner.set_runs(vec![
            own(1),
            own(2),
            own(3),
            run(4, Some("lint"), None, Some("push"), Some("main")),
        ]);

        let decision = gate(&runner, 4).admit("translate").await;
        assert!(decision.admitted);
        assert_eq!(decision.in_flight, Some(3));
    }

    #[tokio::test]
    async fn four_of_four_denies() {
        let runner = ScriptedRunner::new();
        runner.set_runs(vec![own(1), own(2), own(3), own(4)]);

        let decision = gate(&runner, 4).admit("translate").await;
        assert!(!decision.admitted);
        assert_eq!(decision.in_flight, Some(4));
    }

    #[tokio::test]
    async fn count_is_cached_until_invalidated() {
        let runner = ScriptedRunner::new();
        runner.set_runs(vec![own(1)]);
        let gate = gate(&runner, 4);

        gate.admit("translate").await;
        gate.admit("translate").await;
        assert_eq!(runner.list_calls(), 1);

        gate.invalidate("translate");
        gate.admit("translate").await;
        assert_eq!(runner.list_calls(), 2);
    }

    #[tokio::test]
    async fn transient_listing_failures_below_ceiling_are_absorbed() {
        let runner = ScriptedRunner::new();
        runner.set_runs(vec![own(1)]);
        runner.fail_next_listings(2);

        let decision = gate(&runner, 4).admit("translate").await;
        assert!(decision.admitted);
        assert!(!decision.degraded);
        assert_eq!(runner.list_calls(), 3);
    }

    #[rstest]
    #[case::fail_closed(DegradationMode::FailClosed, false)]
    #[case::fail_open(DegradationMode::FailOpen, true)]
    #[tokio::test]
    async fn degradation_past_ceiling(#[case] mode: DegradationMode, #[case] admitted: bool) {
        let runner = ScriptedRunner::new();
        runner.fail_next_listings(3);

        let decision = gate(&runner, 4).with_mode(mode).admit("translate").await;
        assert_eq!(decision.admitted, admitted);
        assert!(decision.degraded);
        assert_eq!(decision.in_flight, None);
    }
}
