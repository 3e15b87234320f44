//! BatchInferenceApi port - 外部の非同期 batch 推論 API
//!
//! 推論サービス自体は opaque な remote job として扱う。submit は downstream runner の仕事なので
//! ここには status 取得と artifact のダウンロードだけがある。

use async_trait::async_trait;

use crate::domain::{RemoteBatch, RemoteError};

#[async_trait]
pub trait BatchInferenceApi: Send + Sync {
    /// `GET /batches/{id}`
    async fn get_batch(&self, remote_batch_id: &str) -> Result<RemoteBatch, RemoteError>;

    /// `GET /files/{id}/content` (newline-delimited JSON)
    async fn download_file(&self, file_id: &str) -> Result<String, RemoteError>;
}
