//! Per-pair attribution workers.
//!
//! Each (user, race) pair gets a dedicated worker task that processes its
//! requests serially, so ledger transitions for a pair are strictly ordered
//! without locking shared structures. Different pairs run concurrently.
//! Duplicate submissions across processes are handled by the ledger's
//! content-derived transaction ids, not by the workers.
//!
//! # Module Structure
//!
//! - [`dispatch`]: routes requests to workers, spawning them on demand
//! - [`worker`]: the per-pair pipeline and the [`ProgressSink`] seam
//! - [`message`]: messages exchanged with a worker task

pub mod dispatch;
pub mod message;
#[allow(clippy::module_inception)]
pub mod worker;

pub use dispatch::{
    DEFAULT_CHANNEL_CAPACITY, DEFAULT_SUBMIT_TIMEOUT, DispatchError, Dispatcher, SubmitOutcome,
    WorkerConfig,
};
pub use message::WorkerMessage;
pub use worker::{
    AttributionOutcome, AttributionPlan, AttributionRequest, NullSink, PairKey, PairWorker,
    ProgressSink, ProgressUpdate, SinkError,
};
