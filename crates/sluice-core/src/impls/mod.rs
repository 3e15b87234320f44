//! Impls - port の実装
//!
//! # 開発・テスト用
//! - **InMemoryWorkStore** / **InMemoryLedger**: fault injection 付きの in-memory store
//! - **ScriptedInference** / **ScriptedRunner**: 台本どおりに応答する remote
//! - **MemoryCache**: プロセス内 cache
//!
//! # 本番用
//! - **RestWorkStore**: PostgREST 形式の work store + batch ledger
//! - **OpenAiBatchClient**: batch 推論 API
//! - **GithubActionsRunner**: dispatch / in-progress run 一覧
//! - **FileCache**: invocation をまたぐ JSON ファイル cache

pub mod file_cache;
pub mod github_actions;
pub mod inmem_ledger;
pub mod inmem_store;
pub mod memory_cache;
pub mod openai_batch;
pub mod rest_store;
pub mod scripted;

// 主要な型を再エクスポート
pub use self::file_cache::FileCache;
pub use self::github_actions::{GithubActionsConfig, GithubActionsRunner};
pub use self::inmem_ledger::InMemoryLedger;
pub use self::inmem_store::InMemoryWorkStore;
pub use self::memory_cache::MemoryCache;
pub use self::openai_batch::{OpenAiBatchClient, OpenAiBatchConfig};
pub use self::rest_store::{RestStoreConfig, RestWorkStore};
pub use self::scripted::{DispatchReply, ScriptedInference, ScriptedRunner};
