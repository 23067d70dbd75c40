//! Persistence boundary.
//!
//! All state goes through the [`DocumentStore`] trait: `get`, `put`, an atomic
//! `insert_new` (the primitive behind ledger idempotency), and ordered prefix
//! queries. Two backends are provided:
//!
//! - [`MemoryStore`]: ordered in-memory map, for tests and ephemeral use
//! - [`JournalStore`]: append-only JSON Lines journal, replayed on open
//!
//! # Key Layout
//!
//! ```text
//! daily/<user>/<yyyy-mm-dd>
//! summary/<user>
//! ledger/entry/<txid>
//! ledger/by_pair/<race>/<user>/<timestamp>/<txid>
//! ```

pub mod journal;
pub mod keys;
pub mod store;

pub use journal::{JournalRecord, JournalStore, SyncPolicy};
pub use store::{
    CorruptDocument, DocumentStore, InsertOutcome, MemoryStore, StoreError, TypedError, get_json,
    put_json,
};
