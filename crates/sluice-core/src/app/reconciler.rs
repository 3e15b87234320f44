//! ResultReconciler - 完了した batch の結果を work store に書き戻す
//!
//! # 順序の不変条件
//! destination write（claim 解放 + 結果）が完了してから `completed = true` を書く。
//!
//! - destination write が失敗 → reconcile 失敗。completed は null のまま（次の cycle でやり直し）
//! - destination write 成功 + flag write 失敗 → flag write だけをリトライ
//! - それでも失敗 → ConsistencyError（`alert = true` でログ）
//!
//! destination write は既存行への条件付き update なので、同じ batch を何度 reconcile しても結果は変わらない。
//!
//! download と destination write は poll cycle の budget 内でだけリトライする。
//! budget が尽きたら batch は pending のまま次の invocation に回る。
//! flag write は destination write の後なので budget では止めない。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::app::artifact::{self, ParsedArtifact};
use crate::app::budget::InvocationBudget;
use crate::app::retry::RetryPolicy;
use crate::domain::{
    BatchId, BatchJob, ItemUpdate, RemoteBatch, RemoteError, ResultOutcome, SluiceError,
};
use crate::ports::cache::STATS_KEY;
use crate::ports::{BatchInferenceApi, BatchLedger, Cache, WorkClaimStore};

#[derive(Debug, Clone, Serialize, Default)]
pub struct Reconciliation {
    pub batch_id: Option<BatchId>,
    pub records: usize,
    pub written: usize,
    pub malformed: usize,
    pub unmapped: usize,
    pub error_lines: usize,
    pub outcomes: BTreeMap<ResultOutcome, usize>,
}

pub struct ResultReconciler {
    store: Arc<dyn WorkClaimStore>,
    ledger: Arc<dyn BatchLedger>,
    inference: Arc<dyn BatchInferenceApi>,
    cache: Arc<dyn Cache>,
    required_field: String,
    chunk_size: usize,
    download_timeout: Duration,
    download_retry: RetryPolicy,
    store_retry: RetryPolicy,
    flag_retry: RetryPolicy,
}

impl ResultReconciler {
    pub fn new(
        store: Arc<dyn WorkClaimStore>,
        ledger: Arc<dyn BatchLedger>,
        inference: Arc<dyn BatchInferenceApi>,
        cache: Arc<dyn Cache>,
        required_field: impl Into<String>,
    ) -> Self {
        Self {
            store,
            ledger,
            inference,
            cache,
            required_field: required_field.into(),
            chunk_size: 500,
            download_timeout: Duration::from_secs(30),
            download_retry: RetryPolicy::exponential(3, Duration::from_secs(1), 2.0),
            store_retry: RetryPolicy::exponential(3, Duration::from_millis(500), 2.0),
            flag_retry: RetryPolicy::exponential(3, Duration::from_millis(500), 2.0),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_download_timeout(mut self, timeout: Duration) -> Self {
        self.download_timeout = timeout;
        self
    }

    pub fn with_download_retry(mut self, retry: RetryPolicy) -> Self {
        self.download_retry = retry;
        self
    }

    pub fn with_store_retry(mut self, retry: RetryPolicy) -> Self {
        self.store_retry = retry;
        self
    }

    pub fn with_flag_retry(mut self, retry: RetryPolicy) -> Self {
        self.flag_retry = retry;
        self
    }

    async fn download(
        &self,
        file_id: &str,
        budget: &InvocationBudget,
    ) -> Result<String, RemoteError> {
        self.download_retry
            .run_within("download_file", budget, |_| async move {
                let timeout = budget.call_timeout(self.download_timeout);
                if timeout.is_zero() {
                    return Err(RemoteError::Timeout(format!(
                        "no budget left to download {file_id}"
                    )));
                }
                match tokio::time::timeout(timeout, self.inference.download_file(file_id)).await {
                    Ok(result) => result,
                    Err(_) => Err(RemoteError::Timeout(format!(
                        "download of {file_id} after {timeout:?}"
                    ))),
                }
            })
            .await
    }

    pub async fn reconcile(
        &self,
        job: &BatchJob,
        remote: &RemoteBatch,
        budget: &InvocationBudget,
    ) -> Result<Reconciliation, SluiceError> {
        let batch_id = job.batch_id;

        let parsed = match &remote.output_file_id {
            Some(file_id) => {
                let content = self.download(file_id, budget).await?;
                artifact::parse_results(&content, &self.required_field)
            }
            None => ParsedArtifact::default(),
        };

        let mut error_lines = 0;
        if let Some(file_id) = &remote.error_file_id {
            match self.download(file_id, budget).await {
                Ok(content) => error_lines = artifact::log_error_lines(&content),
                Err(e) => warn!(batch_id = %batch_id, error = %e, "error artifact unavailable"),
            }
        }

        let mut outcomes: BTreeMap<ResultOutcome, usize> = BTreeMap::new();
        for record in &parsed.records {
            *outcomes.entry(record.outcome).or_default() += 1;
        }
        let records = parsed.records.len();
        let updates: Vec<ItemUpdate> = parsed.records.into_iter().map(ItemUpdate::from).collect();

        // 1. destination write
        let mut written = 0;
        for chunk in updates.chunks(self.chunk_size) {
            if budget.is_exhausted() {
                warn!(
                    batch_id = %batch_id,
                    written,
                    "budget exhausted before destination write, batch stays pending"
                );
                return Err(RemoteError::Timeout(format!(
                    "{batch_id}: invocation budget exhausted during reconciliation"
                ))
                .into());
            }
            match self
                .store_retry
                .run_within("apply_results", budget, |_| self.store.apply_results(chunk))
                .await
            {
                Ok(n) => written += n,
                Err(e) => {
                    warn!(
                        batch_id = %batch_id,
                        written,
                        error = %e,
                        "destination write failed, batch stays pending"
                    );
                    return Err(e.into());
                }
            }
        }
        if !updates.is_empty()
            && let Err(e) = self.cache.invalidate(STATS_KEY)
        {
            warn!(error = %e, "stats cache invalidate failed");
        }

        // 2. completed flag（destination write の後でのみ）
        if let Err(e) = self
            .flag_retry
            .run("set_completed", |_| self.ledger.set_completed(&batch_id, true))
            .await
        {
            error!(
                alert = true,
                batch_id = %batch_id,
                written,
                error = %e,
                "consistency error: results written but completed flag not set"
            );
            return Err(SluiceError::Consistency(format!(
                "{batch_id}: results written but completed flag write failed: {e}"
            )));
        }

        info!(
            batch_id = %batch_id,
            records,
            written,
            malformed = parsed.malformed,
            unmapped = parsed.unmapped,
            error_lines,
            "batch reconciled"
        );

        Ok(Reconciliation {
            batch_id: Some(batch_id),
            records,
            written,
            malformed: parsed.malformed,
            unmapped: parsed.unmapped,
            error_lines,
            outcomes,
        })
    }
}
