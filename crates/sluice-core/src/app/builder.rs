//! OrchestratorBuilder - port の注入と orchestrator の構築
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）: 設定不備と port の注入漏れは build() で弾く

use std::sync::Arc;

use crate::app::claimer::LeaseClaimer;
use crate::app::gate::{ConcurrencyGate, RunMatcher};
use crate::app::orchestrator::Orchestrator;
use crate::app::poller::BatchPoller;
use crate::app::reconciler::ResultReconciler;
use crate::app::recovery::StuckLeaseRecovery;
use crate::app::retry::RetryPolicy;
use crate::app::submitter::BatchSubmitter;
use crate::config::{ConfigError, SluiceConfig};
use crate::impls::FileCache;
use crate::ports::{
    BatchInferenceApi, BatchLedger, Cache, Clock, IdGenerator, SystemClock, UlidGenerator,
    WorkClaimStore, WorkflowRunner,
};

/// OrchestratorBuilder は Orchestrator を構築
///
/// # 使用例
/// ```ignore
/// let orchestrator = OrchestratorBuilder::new(config)
///     .with_store(store)
///     .with_ledger(ledger)
///     .with_inference(inference)
///     .with_runner(runner)
///     .build()?;
/// ```
///
/// clock / id generator / cache は省略可能（SystemClock / UlidGenerator /
/// `config.cache_path` の FileCache）。cache を省略すると recovery の失敗カウンタは
/// プロセスをまたいで残る。
pub struct OrchestratorBuilder {
    config: SluiceConfig,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    store: Option<Arc<dyn WorkClaimStore>>,
    ledger: Option<Arc<dyn BatchLedger>>,
    inference: Option<Arc<dyn BatchInferenceApi>>,
    runner: Option<Arc<dyn WorkflowRunner>>,
    cache: Option<Arc<dyn Cache>>,
}

/// BuildError は構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing port: {0}. It must be provided before build().")]
    MissingPort(&'static str),

    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
}

impl OrchestratorBuilder {
    pub fn new(config: SluiceConfig) -> Self {
        Self {
            config,
            clock: None,
            ids: None,
            store: None,
            ledger: None,
            inference: None,
            runner: None,
            cache: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn WorkClaimStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn BatchLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_inference(mut self, inference: Arc<dyn BatchInferenceApi>) -> Self {
        self.inference = Some(inference);
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn WorkflowRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// # 検証
    /// - `SluiceConfig::validate()`
    /// - store / ledger / inference / runner がすべて注入済み
    pub fn build(self) -> Result<Orchestrator, BuildError> {
        self.config.validate()?;
        let store = self.store.ok_or(BuildError::MissingPort("work store"))?;
        let ledger = self.ledger.ok_or(BuildError::MissingPort("batch ledger"))?;
        let inference = self
            .inference
            .ok_or(BuildError::MissingPort("batch inference api"))?;
        let runner = self.runner.ok_or(BuildError::MissingPort("workflow runner"))?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let cache: Arc<dyn Cache> = match self.cache {
            Some(cache) => cache,
            None => Arc::new(FileCache::new(&self.config.cache_path, clock.clone())),
        };
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(clock.clone())));

        let config = self.config;
        let store_retry = RetryPolicy::exponential(3, config.store_retry_delay, 2.0);

        let claimer = LeaseClaimer::new(store.clone(), clock.clone(), config.claim_floor);

        let gate = ConcurrencyGate::new(
            runner.clone(),
            cache.clone(),
            RunMatcher {
                name: config.workflow_name.clone(),
                path: config.workflow_path.clone(),
                event: config.run_event.clone(),
                branch: config.run_branch.clone(),
            },
            config.max_concurrent_jobs,
        )
        .with_mode(config.gate_degradation)
        .with_retry(RetryPolicy::exponential(
            config.gate_failure_ceiling,
            config.store_retry_delay,
            2.0,
        ))
        .with_cache_ttl(config.gate_cache_ttl);

        let submitter = BatchSubmitter::new(
            runner,
            ledger.clone(),
            clock.clone(),
            RetryPolicy::linear(config.dispatch_attempts, config.dispatch_base_delay),
            config.dispatch_event.clone(),
        )
        .with_ledger_retry(store_retry.clone());

        let reconciler = ResultReconciler::new(
            store.clone(),
            ledger.clone(),
            inference.clone(),
            cache.clone(),
            config.required_field.clone(),
        )
        .with_chunk_size(config.write_chunk_size)
        .with_download_timeout(config.per_call_timeout)
        .with_download_retry(RetryPolicy::exponential(
            config.download_attempts,
            config.download_retry_delay,
            2.0,
        ))
        .with_store_retry(store_retry.clone())
        .with_flag_retry(RetryPolicy::exponential(
            config.flag_write_attempts,
            config.store_retry_delay,
            2.0,
        ));

        let poller = BatchPoller::new(ledger, inference, reconciler, clock.clone())
            .with_cap(config.poll_cap)
            .with_per_call_timeout(config.per_call_timeout)
            .with_stuck_timeout(config.stuck_lease_timeout);

        let recovery = StuckLeaseRecovery::new(store, cache, clock.clone(), config.stuck_lease_timeout)
            .with_paging(config.recovery_page_size, config.recovery_cap)
            .with_alert_threshold(config.recovery_alert_threshold)
            .with_retry(store_retry);

        Ok(Orchestrator {
            config,
            clock,
            ids,
            claimer,
            gate,
            submitter,
            poller,
            recovery,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::{
        InMemoryLedger, InMemoryWorkStore, MemoryCache, ScriptedInference, ScriptedRunner,
    };

    fn complete(config: SluiceConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
            .with_store(Arc::new(InMemoryWorkStore::new()))
            .with_ledger(Arc::new(InMemoryLedger::new()))
            .with_inference(Arc::new(ScriptedInference::new()))
            .with_runner(Arc::new(ScriptedRunner::new()))
            .with_cache(Arc::new(MemoryCache::new(Arc::new(SystemClock))))
    }

    #[test]
    fn test_build_success() {
        assert!(complete(SluiceConfig::default()).build().is_ok());
    }

    #[test]
    fn test_build_missing_port() {
        let result = OrchestratorBuilder::new(SluiceConfig::default())
            .with_store(Arc::new(InMemoryWorkStore::new()))
            .build();
        assert!(matches!(result, Err(BuildError::MissingPort("batch ledger"))));
    }

    #[test]
    fn test_build_without_cache_falls_back_to_file() {
        let result = OrchestratorBuilder::new(SluiceConfig::default())
            .with_store(Arc::new(InMemoryWorkStore::new()))
            .with_ledger(Arc::new(InMemoryLedger::new()))
            .with_inference(Arc::new(ScriptedInference::new()))
            .with_runner(Arc::new(ScriptedRunner::new()))
            .build();
        assert!(result.is_ok());
    }

    #[test]
    fn test_build_invalid_config() {
        let result = complete(SluiceConfig::default().with_poll_cap(0)).build();
        assert!(matches!(
            result,
            Err(BuildError::InvalidConfig(ConfigError::Validation(_)))
        ));
    }
}
