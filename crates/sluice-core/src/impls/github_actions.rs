//! GithubActionsRunner - GitHub Actions 形式の workflow runner
//!
//! - dispatch: `POST {repo}/dispatches`（`repository_dispatch`、成功は 204）
//! - in-flight: `GET {repo}/actions/runs?status=in_progress`

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::json;

use crate::domain::{DispatchRequest, RemoteError, WorkflowRun};
use crate::ports::WorkflowRunner;

const USER_AGENT: &str = concat!("sluice/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct GithubActionsConfig {
    /// e.g. `https://api.github.com/repos/owner/repo`
    pub repo_url: String,
    pub token: String,
    pub timeout: Duration,
}

impl GithubActionsConfig {
    pub fn new(repo_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            repo_url: repo_url.into(),
            token: token.into(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Deserialize)]
struct RunsPage {
    #[serde(default)]
    workflow_runs: Vec<WorkflowRun>,
}

#[derive(Clone)]
pub struct GithubActionsRunner {
    config: GithubActionsConfig,
    client: Client,
}

impl GithubActionsRunner {
    pub fn new(config: GithubActionsConfig) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.repo_url.trim_end_matches('/'), path)
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        req.bearer_auth(&self.config.token)
            .header("Accept", "application/vnd.github+json")
    }
}

fn dispatch_body(request: &DispatchRequest) -> serde_json::Value {
    json!({
        "event_type": request.event_type,
        "client_payload": {
            "batch_id": request.batch_id,
            "task_type": request.task_type,
            "items": request.items,
            "timestamp": request.timestamp,
        },
    })
}

#[async_trait]
impl WorkflowRunner for GithubActionsRunner {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<(), RemoteError> {
        let response = self
            .authed(self.client.post(self.url("dispatches")))
            .json(&dispatch_body(request))
            .send()
            .await?;
        match response.status() {
            StatusCode::NO_CONTENT => Ok(()),
            status if status.is_success() => Err(RemoteError::InvalidResponse(format!(
                "dispatch answered {status}, expected 204"
            ))),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(RemoteError::from_status(status.as_u16(), body))
            }
        }
    }

    async fn list_in_progress_runs(&self) -> Result<Vec<WorkflowRun>, RemoteError> {
        let response = self
            .authed(self.client.get(self.url("actions/runs")))
            .query(&[("status", "in_progress"), ("per_page", "100")])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::from_status(status.as_u16(), body));
        }
        let text = response.text().await?;
        let page: RunsPage =
            serde_json::from_str(&text).map_err(|e| RemoteError::InvalidResponse(e.to_string()))?;
        Ok(page.workflow_runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BatchId, DispatchItem, WorkItem, WorkItemId};
    use chrono::TimeZone;
    use ulid::Ulid;

    #[test]
    fn dispatch_body_wraps_fields_in_client_payload() {
        let item = WorkItem::new(WorkItemId::new("42"), "translate");
        let request = DispatchRequest {
            event_type: "batch-translate".into(),
            batch_id: BatchId::from_ulid(Ulid::nil()),
            task_type: "translate".into(),
            items: vec![DispatchItem::from(&item)],
            timestamp: chrono::Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        };

        let body = dispatch_body(&request);
        assert_eq!(body["event_type"], "batch-translate");
        assert_eq!(body["client_payload"]["task_type"], "translate");
        assert_eq!(body["client_payload"]["items"][0]["custom_id"], "item-42");
    }

    #[test]
    fn runs_page_defaults_to_empty() {
        let page: RunsPage = serde_json::from_str(r#"{"total_count":0}"#).unwrap();
        assert!(page.workflow_runs.is_empty());
    }
}
