//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせて batch lifecycle を実装します。
//!
//! # 主要コンポーネント
//! - **OrchestratorBuilder**: port の注入と起動時検証
//! - **Orchestrator**: claim+submit / poll+reconcile / recovery の 3 entry point
//! - **LeaseClaimer**: tier 順の選択 + statement timeout で縮む claim
//! - **ConcurrencyGate**: downstream の in-flight 数による admission control
//! - **BatchSubmitter**: dispatch（linear backoff）+ ledger 行の作成
//! - **BatchPoller**: budget 内での remote status 確認
//! - **ResultReconciler**: 結果の書き戻し（destination write → completed flag）
//! - **StuckLeaseRecovery**: 期限切れ claim の解放

pub mod artifact;
pub mod budget;
pub mod builder;
pub mod claimer;
pub mod gate;
pub mod orchestrator;
pub mod poller;
pub mod reconciler;
pub mod recovery;
pub mod report;
pub mod retry;
pub mod submitter;

// 主要な型を再エクスポート
pub use self::budget::InvocationBudget;
pub use self::builder::{BuildError, OrchestratorBuilder};
pub use self::claimer::{ClaimOutcome, ClaimRequest, LeaseClaimer};
pub use self::gate::{ConcurrencyGate, DegradationMode, GateDecision, RunMatcher};
pub use self::orchestrator::Orchestrator;
pub use self::poller::{BatchPoller, PollSummary};
pub use self::reconciler::{Reconciliation, ResultReconciler};
pub use self::recovery::{RecoveryHealth, RecoverySummary, StuckLeaseRecovery};
pub use self::report::{ClaimCycleReport, ErrorDetail, PollCycleReport, RecoveryReport, SkipReason};
pub use self::retry::{Backoff, RetryPolicy};
pub use self::submitter::{BatchSubmitter, Submission};
