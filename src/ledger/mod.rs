//! Transaction ledger for step attribution.
//!
//! Every step delta attributed to a race is recorded as a [`LedgerEntry`]
//! before it touches the race total, and moves through a small state machine:
//!
//! ```text
//!            ┌──fail──► failed ──retry──┐
//!            │    (retry_count + 1)     │
//! pending ◄──┴──────────────────────────┘
//!    │
//!    ├──apply────► applied      (terminal)
//!    └──rollback─► rolled_back  (terminal, also from failed)
//! ```
//!
//! Ids are derived from the event's content ([`id`]), so a redelivered event
//! collides with its first delivery instead of creating a second row. The
//! applied entries of each (race, user) pair replay to the recorded total
//! ([`replay`]); drift is corrected by appending `reconciled` entries, never by
//! editing history.
//!
//! [`LedgerEntry`]: crate::types::LedgerEntry

pub mod id;
#[allow(clippy::module_inception)]
pub mod ledger;
pub mod replay;
pub mod retry;
pub mod transitions;

pub use id::{DEFAULT_ID_BUCKET_SECS, event_id, reconciliation_id};
pub use ledger::{
    CreateOutcome, KIND_RECONCILIATION, LedgerConfig, LedgerError, NewTransaction,
    TransactionLedger,
};
pub use replay::AuditReport;
pub use retry::BackoffPolicy;
pub use transitions::{Action, TransitionError};
