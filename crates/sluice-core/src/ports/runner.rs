//! WorkflowRunner port - downstream の workflow 実行環境
//!
//! dispatch（batch を起動）と、実行中 run の一覧（admission control 用）の 2 つだけ。

use async_trait::async_trait;

use crate::domain::{DispatchRequest, RemoteError, WorkflowRun};

#[async_trait]
pub trait WorkflowRunner: Send + Sync {
    /// `POST .../dispatches`; success is HTTP 204.
    async fn dispatch(&self, request: &DispatchRequest) -> Result<(), RemoteError>;

    /// `GET .../runs?status=in_progress`
    async fn list_in_progress_runs(&self) -> Result<Vec<WorkflowRun>, RemoteError>;
}
