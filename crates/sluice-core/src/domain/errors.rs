//! Errors - エラー型と分類
//!
//! 各 port は自分のエラー型（`StoreError`, `RemoteError`, `CacheError`）を返し、
//! crate 全体としては `SluiceError` に集約する。
//!
//! # 分類
//! - Transient: 一時的なエラー（network / timeout / 5xx / 429）。backoff 付きでリトライ
//! - Permanent: 恒久的なエラー（429 以外の 4xx、認証失敗）。リトライしない
//! - Parse: 1 行の parse 失敗。ログに出して skip する
//! - Consistency: destination write と status write の食い違い。cycle として fatal
//! - Configuration: 起動時の設定不備

use thiserror::Error;

/// ErrorKind は実行エラーの運用分類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Parse,
    Consistency,
    Configuration,
}

/// Errors reported by the work store and the batch ledger.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store cancelled the statement (too much work for one request).
    #[error("statement timeout: {0}")]
    StatementTimeout(String),

    /// Network failure, 5xx or 429.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Non-retryable rejection (4xx other than 429).
    #[error("store rejected request (status {status}): {message}")]
    Rejected { status: u16, message: String },

    /// A conditional write found the row in an incompatible state.
    #[error("conflicting write: {0}")]
    Conflict(String),

    #[error("invalid store response: {0}")]
    InvalidResponse(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::StatementTimeout(_) | StoreError::Unavailable(_) => ErrorKind::Transient,
            StoreError::Rejected { .. } | StoreError::InvalidResponse(_) => ErrorKind::Permanent,
            StoreError::Conflict(_) => ErrorKind::Consistency,
        }
    }
}

/// Errors reported by remote HTTP APIs (batch inference, workflow runner).
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("authentication failed: {0}")]
    Unauthorized(String),

    #[error("request rejected {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => RemoteError::Unauthorized(message),
            429 => RemoteError::RateLimited(message),
            500..=599 => RemoteError::Server { status, message },
            _ => RemoteError::Rejected { status, message },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RemoteError::Timeout(_)
            | RemoteError::Transport(_)
            | RemoteError::RateLimited(_)
            | RemoteError::Server { .. } => ErrorKind::Transient,
            RemoteError::Unauthorized(_)
            | RemoteError::Rejected { .. }
            | RemoteError::InvalidResponse(_) => ErrorKind::Permanent,
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RemoteError::Timeout(err.to_string())
        } else if err.is_decode() {
            RemoteError::InvalidResponse(err.to_string())
        } else if let Some(status) = err.status() {
            RemoteError::from_status(status.as_u16(), err.to_string())
        } else {
            RemoteError::Transport(err.to_string())
        }
    }
}

/// Errors reported by a [`crate::ports::Cache`] implementation.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

/// Crate-level error.
#[derive(Debug, Error)]
pub enum SluiceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("consistency error: {0}")]
    Consistency(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl SluiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SluiceError::Store(e) => e.kind(),
            SluiceError::Remote(e) => e.kind(),
            SluiceError::Cache(_) => ErrorKind::Transient,
            SluiceError::Parse(_) => ErrorKind::Parse,
            SluiceError::Consistency(_) => ErrorKind::Consistency,
            SluiceError::Configuration(_) => ErrorKind::Configuration,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

/// Errors that know whether another attempt can help.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl Retryable for RemoteError {
    fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl Retryable for SluiceError {
    fn is_retryable(&self) -> bool {
        SluiceError::is_retryable(self)
    }
}
