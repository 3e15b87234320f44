//! RestWorkStore - PostgREST 形式の REST API 上の work store / batch ledger
//!
//! - 読み取り: filter 付き GET（limit / offset / order）
//! - 書き込み: id リスト + 条件付きの PATCH（`Prefer: return=representation`）。結果の書き戻しも PATCH で、
//!   存在しない行を insert しない
//! - 件数: `Prefer: count=exact` の `Content-Range` ヘッダ
//!
//! statement timeout（SQLSTATE 57014）は `StoreError::StatementTimeout` に変換し、
//! claimer がサイズを半分にしてリトライできるようにする。

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::json;

use crate::domain::{
    BatchId, BatchJob, ClaimTier, ItemUpdate, ResultOutcome, StoreError, WorkItem, WorkItemId,
};
use crate::ports::{BatchLedger, WorkClaimStore};

const STATEMENT_TIMEOUT_CODE: &str = "57014";

/// Ids per `in.(..)` filter, keeps the PATCH url bounded.
const PATCH_ID_CHUNK: usize = 100;

#[derive(Debug, Clone)]
pub struct RestStoreConfig {
    /// e.g. `https://project.supabase.co/rest/v1`
    pub base_url: String,
    pub api_key: String,
    pub items_table: String,
    pub ledger_table: String,
    pub timeout: Duration,
}

impl RestStoreConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            items_table: "work_items".to_string(),
            ledger_table: "batch_jobs".to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_tables(mut self, items: impl Into<String>, ledger: impl Into<String>) -> Self {
        self.items_table = items.into();
        self.ledger_table = ledger.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Clone)]
pub struct RestWorkStore {
    config: RestStoreConfig,
    client: Client,
}

#[derive(Deserialize)]
struct IdRow {
    id: WorkItemId,
}

impl RestWorkStore {
    pub fn new(config: RestStoreConfig) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| StoreError::InvalidResponse(format!("http client: {e}")))?;
        Ok(Self { config, client })
    }

    fn url(&self, table: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), table)
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("apikey", &self.config.api_key)
            .bearer_auth(&self.config.api_key)
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, StoreError> {
        let response = self
            .authed(req)
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_failure(status.as_u16(), body))
    }

    async fn fetch<T: serde::de::DeserializeOwned>(
        &self,
        req: RequestBuilder,
    ) -> Result<T, StoreError> {
        self.send(req)
            .await?
            .json::<T>()
            .await
            .map_err(|e| StoreError::InvalidResponse(e.to_string()))
    }

    async fn patch_ids(
        &self,
        filters: Vec<(&str, String)>,
        body: serde_json::Value,
    ) -> Result<Vec<WorkItemId>, StoreError> {
        let req = self
            .client
            .patch(self.url(&self.config.items_table))
            .query(&filters)
            .query(&[("select", "id")])
            .header("Prefer", "return=representation")
            .json(&body);
        let rows: Vec<IdRow> = self.fetch(req).await?;
        Ok(rows.into_iter().map(|r| r.id).collect())
    }

    async fn list_pending(
        &self,
        requested: &str,
        limit: usize,
    ) -> Result<Vec<BatchJob>, StoreError> {
        let req = self
            .client
            .get(self.url(&self.config.ledger_table))
            .query(&[
                ("select", "*".to_string()),
                ("completed", "is.null".to_string()),
                ("requested", requested.to_string()),
                ("order", "created_at.asc".to_string()),
                ("limit", limit.to_string()),
            ]);
        self.fetch(req).await
    }
}

fn classify_failure(status: u16, body: String) -> StoreError {
    if body.contains(STATEMENT_TIMEOUT_CODE) {
        return StoreError::StatementTimeout(body);
    }
    match status {
        409 => StoreError::Conflict(body),
        429 | 500..=599 => StoreError::Unavailable(format!("status {status}: {body}")),
        _ => StoreError::Rejected {
            status,
            message: body,
        },
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// `in.("a","b")` filter value.
fn in_list(ids: &[WorkItemId]) -> String {
    let quoted: Vec<String> = ids
        .iter()
        .map(|id| format!("\"{}\"", id.as_str().replace('"', "\\\"")))
        .collect();
    format!("in.({})", quoted.join(","))
}

fn tier_filter(tier: ClaimTier) -> (&'static str, String) {
    match tier {
        ClaimTier::Unprocessed => ("result_status", "is.null".to_string()),
        ClaimTier::PreviouslyInvalid => (
            "result_status",
            format!("eq.{}", ResultOutcome::InvalidFormat.as_str()),
        ),
    }
}

/// PATCH bodies for result writes, each with the ids that share it.
///
/// Non-success outcomes carry no `result`, so the stored payload is kept.
fn group_updates(updates: &[ItemUpdate]) -> Vec<(serde_json::Value, Vec<WorkItemId>)> {
    let mut groups: Vec<(serde_json::Value, Vec<WorkItemId>)> = Vec::new();
    for update in updates {
        let mut body = json!({
            "claimed": null,
            "claimed_at": null,
            "result_status": update.result_status,
        });
        if let Some(result) = &update.result {
            body["result"] = result.clone();
        }
        match groups.iter_mut().find(|(b, _)| *b == body) {
            Some((_, ids)) => ids.push(update.id.clone()),
            None => groups.push((body, vec![update.id.clone()])),
        }
    }
    groups
}

/// Total from a `Content-Range` header such as `0-24/3573` or `*/0`.
fn parse_content_range(header: &str) -> Option<usize> {
    header.rsplit('/').next()?.trim().parse().ok()
}

#[async_trait]
impl WorkClaimStore for RestWorkStore {
    async fn select_candidates(
        &self,
        task_type: &str,
        tier: ClaimTier,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let (tier_col, tier_value) = tier_filter(tier);
        let req = self
            .client
            .get(self.url(&self.config.items_table))
            .query(&[
                ("select", "*".to_string()),
                ("task_type", format!("eq.{task_type}")),
                ("claimed", "is.null".to_string()),
                (tier_col, tier_value),
                ("order", "id.asc".to_string()),
                ("limit", limit.to_string()),
            ]);
        self.fetch(req).await
    }

    async fn mark_claimed(
        &self,
        ids: &[WorkItemId],
        claimed_at: DateTime<Utc>,
    ) -> Result<Vec<WorkItemId>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.patch_ids(
            vec![("id", in_list(ids)), ("claimed", "is.null".to_string())],
            json!({ "claimed": true, "claimed_at": timestamp(claimed_at) }),
        )
        .await
    }

    async fn count_stale_claims(
        &self,
        task_type: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let req = self
            .client
            .get(self.url(&self.config.items_table))
            .query(&[
                ("select", "id".to_string()),
                ("task_type", format!("eq.{task_type}")),
                ("claimed", "is.true".to_string()),
                ("claimed_at", format!("lt.{}", timestamp(cutoff))),
                ("limit", "1".to_string()),
            ])
            .header("Prefer", "count=exact");
        let response = self.send(req).await?;
        response
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range)
            .ok_or_else(|| StoreError::InvalidResponse("missing Content-Range count".into()))
    }

    async fn select_stale_claims(
        &self,
        task_type: &str,
        cutoff: DateTime<Utc>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let req = self
            .client
            .get(self.url(&self.config.items_table))
            .query(&[
                ("select", "*".to_string()),
                ("task_type", format!("eq.{task_type}")),
                ("claimed", "is.true".to_string()),
                ("claimed_at", format!("lt.{}", timestamp(cutoff))),
                ("order", "claimed_at.asc".to_string()),
                ("limit", limit.to_string()),
                ("offset", offset.to_string()),
            ]);
        self.fetch(req).await
    }

    async fn release_stale(
        &self,
        ids: &[WorkItemId],
        cutoff: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let released = self
            .patch_ids(
                vec![
                    ("id", in_list(ids)),
                    ("claimed", "is.true".to_string()),
                    ("claimed_at", format!("lt.{}", timestamp(cutoff))),
                ],
                json!({ "claimed": null, "claimed_at": null }),
            )
            .await?;
        Ok(released.len())
    }

    async fn apply_results(&self, updates: &[ItemUpdate]) -> Result<usize, StoreError> {
        // update のみ。table にない id は書かれず、件数にも入らない
        let mut written = 0;
        for (body, ids) in group_updates(updates) {
            for ids in ids.chunks(PATCH_ID_CHUNK) {
                written += self.patch_ids(vec![("id", in_list(ids))], body.clone()).await?.len();
            }
        }
        Ok(written)
    }
}

#[derive(Deserialize)]
struct CompletedRow {
    #[serde(default)]
    completed: Option<bool>,
}

#[async_trait]
impl BatchLedger for RestWorkStore {
    async fn create(&self, job: &BatchJob) -> Result<(), StoreError> {
        let req = self
            .client
            .post(self.url(&self.config.ledger_table))
            .header("Prefer", "return=minimal")
            .json(job);
        self.send(req).await.map(|_| ())
    }

    async fn list_submitted(&self, limit: usize) -> Result<Vec<BatchJob>, StoreError> {
        self.list_pending("is.true", limit).await
    }

    async fn list_unsubmitted(&self, limit: usize) -> Result<Vec<BatchJob>, StoreError> {
        // requested が null の行も未 submit として扱う
        self.list_pending("not.is.true", limit).await
    }

    async fn set_completed(&self, batch_id: &BatchId, completed: bool) -> Result<(), StoreError> {
        let table = self.url(&self.config.ledger_table);
        let id_filter = format!("eq.{batch_id}");

        let req = self
            .client
            .patch(&table)
            .query(&[
                ("batch_id", id_filter.as_str()),
                ("completed", "is.null"),
                ("select", "completed"),
            ])
            .header("Prefer", "return=representation")
            .json(&json!({ "completed": completed }));
        let updated: Vec<CompletedRow> = self.fetch(req).await?;
        if !updated.is_empty() {
            return Ok(());
        }

        // nothing matched: either already terminal or missing
        let req = self
            .client
            .get(&table)
            .query(&[("batch_id", id_filter.as_str()), ("select", "completed")]);
        let rows: Vec<CompletedRow> = self.fetch(req).await?;
        match rows.first().map(|r| r.completed) {
            Some(Some(current)) if current == completed => Ok(()),
            Some(Some(current)) => Err(StoreError::Conflict(format!(
                "{batch_id} is already completed={current}"
            ))),
            Some(None) => Err(StoreError::Conflict(format!(
                "{batch_id} stayed pending after conditional update"
            ))),
            None => Err(StoreError::Rejected {
                status: 404,
                message: format!("{batch_id} not found"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::exact("0-24/3573", Some(3573))]
    #[case::empty("*/0", Some(0))]
    #[case::unknown("0-24/*", None)]
    fn content_range_total(#[case] header: &str, #[case] expected: Option<usize>) {
        assert_eq!(parse_content_range(header), expected);
    }

    #[test]
    fn statement_timeout_is_detected_from_body() {
        let body = r#"{"code":"57014","message":"canceling statement due to statement timeout"}"#;
        assert!(matches!(
            classify_failure(500, body.to_string()),
            StoreError::StatementTimeout(_)
        ));
    }

    #[rstest]
    #[case::rate_limited(429, true)]
    #[case::unavailable(503, true)]
    #[case::bad_request(400, false)]
    fn failure_statuses(#[case] status: u16, #[case] transient: bool) {
        use crate::domain::Retryable;
        assert_eq!(classify_failure(status, String::new()).is_retryable(), transient);
    }

    #[test]
    fn in_list_quotes_ids() {
        let ids = [WorkItemId::new("1"), WorkItemId::new("a,b")];
        assert_eq!(in_list(&ids), r#"in.("1","a,b")"#);
    }

    #[test]
    fn timestamps_are_utc_with_micros() {
        use chrono::TimeZone;
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(timestamp(at), "2024-01-01T00:00:00.000000Z");
    }

    #[test]
    fn result_writes_group_identical_bodies() {
        let update = |id: &str, status: ResultOutcome, result: Option<serde_json::Value>| ItemUpdate {
            id: WorkItemId::new(id),
            result_status: status,
            result,
        };
        let groups = group_updates(&[
            update("1", ResultOutcome::EmptyResult, None),
            update("2", ResultOutcome::Success, Some(json!({"output": "a"}))),
            update("3", ResultOutcome::EmptyResult, None),
            update("4", ResultOutcome::Success, Some(json!({"output": "b"}))),
        ]);

        assert_eq!(groups.len(), 3);
        let (body, ids) = &groups[0];
        assert_eq!(ids, &vec![WorkItemId::new("1"), WorkItemId::new("3")]);
        assert_eq!(body["claimed"], serde_json::Value::Null);
        assert!(body.get("result").is_none());
        assert_eq!(groups[1].0["result"], json!({"output": "a"}));
        assert_eq!(groups[2].1, vec![WorkItemId::new("4")]);
    }
}
