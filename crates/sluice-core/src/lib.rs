//! sluice-core
//!
//! Core building blocks for the sluice batch-inference orchestrator.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, work_item, batch_job, remote, outcome, errors）
//! - **ports**: 抽象化レイヤー（WorkClaimStore, BatchLedger, BatchInferenceApi, WorkflowRunner, Cache, Clock, IdGenerator）
//! - **app**: アプリケーションロジック（claimer, gate, submitter, poller, reconciler, recovery, orchestrator）
//! - **impls**: 実装（in-memory / scripted のテスト用と REST adapter）
//! - **config**: 調整値と接続先

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;

pub use app::{Orchestrator, OrchestratorBuilder};
pub use config::{ConfigError, Endpoints, SluiceConfig};
pub use domain::{ErrorKind, SluiceError};
