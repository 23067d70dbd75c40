//! Core domain types.
//!
//! Identifiers, per-day records, lifetime summaries, and ledger entries. Types
//! are validated at the deserialization boundary so downstream code can rely on
//! their invariants.

pub mod ids;
pub mod ledger;
pub mod record;
pub mod summary;

pub use ids::{InvalidId, RaceId, TransactionId, UserId};
pub use ledger::{LedgerEntry, MAX_RETRIES, TransactionStatus};
pub use record::{DailyRecord, RecordError, Source};
pub use summary::SummaryRecord;
