//! OpenAiBatchClient - OpenAI 形式の batch API クライアント
//!
//! - `GET {base}/batches/{id}` → [`RemoteBatch`]
//! - `GET {base}/files/{id}/content` → NDJSON 本文

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};

use crate::domain::{RemoteBatch, RemoteError};
use crate::ports::BatchInferenceApi;

#[derive(Debug, Clone)]
pub struct OpenAiBatchConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl OpenAiBatchConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Clone)]
pub struct OpenAiBatchClient {
    config: OpenAiBatchConfig,
    client: Client,
}

impl OpenAiBatchClient {
    pub fn new(config: OpenAiBatchConfig) -> Result<Self, RemoteError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn get(&self, path: &str) -> Result<Response, RemoteError> {
        let response = self
            .client
            .get(self.url(path))
            .bearer_auth(&self.config.api_key)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(RemoteError::from_status(status.as_u16(), body))
    }
}

#[async_trait]
impl BatchInferenceApi for OpenAiBatchClient {
    async fn get_batch(&self, remote_batch_id: &str) -> Result<RemoteBatch, RemoteError> {
        let response = self.get(&format!("batches/{remote_batch_id}")).await?;
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| RemoteError::InvalidResponse(e.to_string()))
    }

    async fn download_file(&self, file_id: &str) -> Result<String, RemoteError> {
        let response = self.get(&format!("files/{file_id}/content")).await?;
        Ok(response.text().await?)
    }
}
