//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（work store, batch 推論 API, workflow runner など）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - work store と ledger が唯一の共有 mutable resource
//! - orchestrator は cycle をまたぐ in-memory state を持たない（必要なら Cache に置く）

pub mod batch_ledger;
pub mod cache;
pub mod clock;
pub mod id_generator;
pub mod inference;
pub mod runner;
pub mod work_store;

// 主要な trait を再エクスポート
pub use self::batch_ledger::BatchLedger;
pub use self::cache::Cache;
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::inference::BatchInferenceApi;
pub use self::runner::WorkflowRunner;
pub use self::work_store::WorkClaimStore;
