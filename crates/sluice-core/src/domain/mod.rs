//! Domain model (IDs, work items, batch jobs, remote shapes, outcomes, errors).
//!
//! このモジュールは I/O を持たない。port / app から参照される型だけを置く。

pub mod batch_job;
pub mod errors;
pub mod ids;
pub mod outcome;
pub mod remote;
pub mod work_item;

pub use batch_job::{BatchJob, BatchJobState};
pub use errors::{CacheError, ErrorKind, RemoteError, Retryable, SluiceError, StoreError};
pub use ids::{BatchId, CycleId, WorkItemId};
pub use outcome::{ItemUpdate, ResultOutcome, ResultRecord};
pub use remote::{
    BatchPhase, DispatchItem, DispatchRequest, RemoteBatch, RemoteBatchStatus, RequestCounts,
    WorkflowRun,
};
pub use work_item::{ClaimTier, LeaseClaim, WorkItem};
