//! Messages sent to a per-pair worker.

use tokio::sync::oneshot;

use crate::ledger::LedgerError;

use super::worker::{AttributionOutcome, AttributionRequest};

/// Messages a pair worker receives over its `tokio::sync::mpsc` channel.
///
/// Messages are handled one at a time, in arrival order.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Attribute a step reading to the pair's race.
    ///
    /// The outcome is sent on `reply`. The submitter may have given up waiting;
    /// the ledger holds the outcome either way.
    Attribute {
        request: AttributionRequest,
        reply: oneshot::Sender<Result<AttributionOutcome, LedgerError>>,
    },

    /// Finish the current request and exit the event loop.
    Shutdown,
}
