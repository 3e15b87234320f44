//! Scripted remotes - テスト用の batch 推論 API / workflow runner
//!
//! レスポンスと失敗を事前に台本（script）として積んでおき、呼び出し履歴を記録する。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{DispatchRequest, RemoteBatch, RemoteError, WorkflowRun};
use crate::ports::{BatchInferenceApi, FixedClock, WorkflowRunner};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct InferenceState {
    batches: HashMap<String, RemoteBatch>,
    files: HashMap<String, String>,
    fail_batch_lookups: HashMap<String, u32>,
    fail_downloads: u32,
    polled: Vec<String>,
    downloads: Vec<String>,
}

/// Batch inference API driven by a script.
#[derive(Clone, Default)]
pub struct ScriptedInference {
    state: Arc<Mutex<InferenceState>>,
    latency: Option<(Arc<FixedClock>, Duration)>,
}

impl ScriptedInference {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every status lookup and download advances `clock` by `per_call`.
    pub fn with_latency(mut self, clock: Arc<FixedClock>, per_call: Duration) -> Self {
        self.latency = Some((clock, per_call));
        self
    }

    pub fn put_batch(&self, batch: RemoteBatch) {
        lock(&self.state).batches.insert(batch.id.clone(), batch);
    }

    pub fn put_file(&self, file_id: impl Into<String>, content: impl Into<String>) {
        lock(&self.state)
            .files
            .insert(file_id.into(), content.into());
    }

    /// The next `n` lookups of `remote_id` fail with a transport error.
    pub fn fail_batch_lookups(&self, remote_id: impl Into<String>, n: u32) {
        lock(&self.state)
            .fail_batch_lookups
            .insert(remote_id.into(), n);
    }

    pub fn fail_next_downloads(&self, n: u32) {
        lock(&self.state).fail_downloads = n;
    }

    pub fn polled(&self) -> Vec<String> {
        lock(&self.state).polled.clone()
    }

    pub fn downloads(&self) -> Vec<String> {
        lock(&self.state).downloads.clone()
    }
}

#[async_trait]
impl BatchInferenceApi for ScriptedInference {
    async fn get_batch(&self, remote_batch_id: &str) -> Result<RemoteBatch, RemoteError> {
        if let Some((clock, per_call)) = &self.latency {
            clock.advance(*per_call);
        }
        let mut state = lock(&self.state);
        state.polled.push(remote_batch_id.to_string());
        if let Some(n) = state.fail_batch_lookups.get_mut(remote_batch_id)
            && *n > 0
        {
            *n -= 1;
            return Err(RemoteError::Transport("connection reset".into()));
        }
        state
            .batches
            .get(remote_batch_id)
            .cloned()
            .ok_or_else(|| RemoteError::from_status(404, format!("no batch {remote_batch_id}")))
    }

    async fn download_file(&self, file_id: &str) -> Result<String, RemoteError> {
        if let Some((clock, per_call)) = &self.latency {
            clock.advance(*per_call);
        }
        let mut state = lock(&self.state);
        state.downloads.push(file_id.to_string());
        if state.fail_downloads > 0 {
            state.fail_downloads -= 1;
            return Err(RemoteError::from_status(503, "file service unavailable"));
        }
        state
            .files
            .get(file_id)
            .cloned()
            .ok_or_else(|| RemoteError::from_status(404, format!("no file {file_id}")))
    }
}

/// Scripted reply to one dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchReply {
    Accepted,
    /// 502 from the runner.
    Transient,
    /// 422 from the runner.
    Rejected,
}

#[derive(Default)]
struct RunnerState {
    runs: Vec<WorkflowRun>,
    list_failures: u32,
    list_calls: usize,
    replies: VecDeque<DispatchReply>,
    dispatch_attempts: usize,
    dispatched: Vec<DispatchRequest>,
}

/// Workflow runner driven by a script. Dispatches succeed unless scripted.
#[derive(Clone, Default)]
pub struct ScriptedRunner {
    state: Arc<Mutex<RunnerState>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_runs(&self, runs: Vec<WorkflowRun>) {
        lock(&self.state).runs = runs;
    }

    pub fn fail_next_listings(&self, n: u32) {
        lock(&self.state).list_failures = n;
    }

    pub fn script_dispatch(&self, replies: impl IntoIterator<Item = DispatchReply>) {
        lock(&self.state).replies.extend(replies);
    }

    pub fn list_calls(&self) -> usize {
        lock(&self.state).list_calls
    }

    pub fn dispatch_attempts(&self) -> usize {
        lock(&self.state).dispatch_attempts
    }

    pub fn dispatched(&self) -> Vec<DispatchRequest> {
        lock(&self.state).dispatched.clone()
    }
}

#[async_trait]
impl WorkflowRunner for ScriptedRunner {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<(), RemoteError> {
        let mut state = lock(&self.state);
        state.dispatch_attempts += 1;
        match state.replies.pop_front().unwrap_or(DispatchReply::Accepted) {
            DispatchReply::Accepted => {
                state.dispatched.push(request.clone());
                Ok(())
            }
            DispatchReply::Transient => Err(RemoteError::from_status(502, "bad gateway")),
            DispatchReply::Rejected => Err(RemoteError::from_status(422, "unprocessable")),
        }
    }

    async fn list_in_progress_runs(&self) -> Result<Vec<WorkflowRun>, RemoteError> {
        let mut state = lock(&self.state);
        state.list_calls += 1;
        if state.list_failures > 0 {
            state.list_failures -= 1;
            return Err(RemoteError::Transport("connection refused".into()));
        }
        Ok(state.runs.clone())
    }
}
