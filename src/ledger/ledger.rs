//! Persisted transaction ledger.
//!
//! Wraps a [`DocumentStore`] with the ledger's state machine. Every mutating
//! call loads the entry, runs the pure transition from
//! [`transitions`](super::transitions), and writes the result back; a rejected
//! transition never reaches the store.
//!
//! Entries live under `ledger/entry/<txid>`. A secondary index under
//! `ledger/by_pair/<race>/<user>/<timestamp>/<txid>` serves replay and
//! reconciliation scans. The index is written after the entry, and a duplicate
//! create rewrites it, so an interrupted create heals on redelivery.
//!
//! Replay orders the applied chain by entry timestamp, which is the time of
//! creation. The chain therefore only replays cleanly if each pair's entries
//! settle in creation order: callers must settle a pair's
//! [`open_entries`](TransactionLedger::open_entries) before creating the next
//! one. The attribution workers do this for every request.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::persistence::store::{decode, get_json, put_json};
use crate::persistence::{
    CorruptDocument, DocumentStore, InsertOutcome, StoreError, TypedError, keys,
};
use crate::types::{LedgerEntry, RaceId, Source, TransactionId, TransactionStatus, UserId};
use crate::validation::ValidationReport;

use super::id::{DEFAULT_ID_BUCKET_SECS, event_id, reconciliation_id};
use super::replay::{self, AuditReport};
use super::retry::BackoffPolicy;
use super::transitions::{self, TransitionError};

/// Metadata key marking a corrective entry.
pub const METADATA_KIND: &str = "kind";
/// Metadata value of [`METADATA_KIND`] on reconciliation entries.
pub const KIND_RECONCILIATION: &str = "reconciliation";
/// Metadata key holding the reconciliation reason.
pub const METADATA_REASON: &str = "reason";

/// Errors from ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("transaction not found: {0}")]
    NotFound(TransactionId),

    #[error("apply blocked by validation: {}", messages.join("; "))]
    Blocked { messages: Vec<String> },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Corrupt(#[from] CorruptDocument),
}

impl From<TypedError> for LedgerError {
    fn from(e: TypedError) -> Self {
        match e {
            TypedError::Store(e) => LedgerError::Store(e),
            TypedError::Corrupt(e) => LedgerError::Corrupt(e),
        }
    }
}

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Tunables for [`TransactionLedger`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LedgerConfig {
    /// Width of the timestamp bucket folded into transaction ids.
    pub id_bucket: Duration,

    /// Delays between attribution attempts.
    pub backoff: BackoffPolicy,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            id_bucket: Duration::seconds(DEFAULT_ID_BUCKET_SECS),
            backoff: BackoffPolicy::DEFAULT,
        }
    }
}

/// A step delta to be recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransaction {
    pub user_id: UserId,
    pub race_id: RaceId,
    pub source: Source,
    /// Counter value at the start of the sync.
    pub previous_steps: u64,
    /// Counter value at the end of the sync.
    pub new_steps: u64,
    pub steps_delta: i64,
    /// Race total before this delta. Captured once and never altered.
    pub server_steps_before: i64,
    /// When the physical event happened. Only feeds the id bucket; the entry's
    /// own timestamp is the time it is recorded, so replay order is apply order.
    pub occurred_at: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
}

/// Result of [`TransactionLedger::create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(LedgerEntry),
    /// The event was already recorded; this is the stored entry, untouched.
    Duplicate(LedgerEntry),
}

impl CreateOutcome {
    /// The entry now stored under the event's id.
    pub fn entry(&self) -> &LedgerEntry {
        match self {
            CreateOutcome::Created(e) | CreateOutcome::Duplicate(e) => e,
        }
    }

    pub fn into_entry(self) -> LedgerEntry {
        match self {
            CreateOutcome::Created(e) | CreateOutcome::Duplicate(e) => e,
        }
    }

    /// True if the event had already been recorded.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, CreateOutcome::Duplicate(_))
    }
}

/// The step-attribution ledger of every (user, race) pair.
///
/// Cloning is cheap and clones share the store and the timestamp clock.
#[derive(Clone)]
pub struct TransactionLedger {
    /// Backing documents: entries and the per-pair index.
    store: Arc<dyn DocumentStore>,

    config: LedgerConfig,

    /// Last timestamp handed out; entry timestamps strictly increase per ledger.
    last_stamp: Arc<Mutex<DateTime<Utc>>>,
}

impl TransactionLedger {
    /// Creates a ledger over `store`. Existing entries in the store are kept.
    pub fn new(store: Arc<dyn DocumentStore>, config: LedgerConfig) -> Self {
        TransactionLedger {
            store,
            config,
            last_stamp: Arc::new(Mutex::new(DateTime::<Utc>::MIN_UTC)),
        }
    }

    /// Current time, nudged forward if the clock stalled or stepped back.
    fn stamp(&self) -> DateTime<Utc> {
        let mut last = self
            .last_stamp
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now().max(*last + Duration::nanoseconds(1));
        *last = now;
        now
    }

    /// Returns the ledger configuration.
    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// The id `create` would assign to this event.
    pub fn transaction_id_for(&self, tx: &NewTransaction) -> TransactionId {
        event_id(
            &tx.user_id,
            &tx.race_id,
            tx.source,
            tx.previous_steps,
            tx.new_steps,
            tx.occurred_at,
            self.config.id_bucket,
        )
    }

    /// Records a new pending entry, or returns the existing one for a redelivered event.
    pub fn create(&self, tx: NewTransaction) -> Result<CreateOutcome> {
        let transaction_id = self.transaction_id_for(&tx);
        let now = self.stamp();
        let entry = LedgerEntry {
            transaction_id,
            timestamp: now,
            race_id: tx.race_id,
            user_id: tx.user_id,
            steps_delta: tx.steps_delta,
            source: tx.source,
            server_steps_before: tx.server_steps_before,
            metadata: tx.metadata,
            status: TransactionStatus::Pending,
            server_steps_after: None,
            error_message: None,
            retry_count: 0,
            last_updated: now,
            audit_notes: Vec::new(),
        };

        match self.insert(&entry)? {
            None => {
                debug!(
                    transaction_id = %entry.transaction_id.short(),
                    user = %entry.user_id,
                    race = %entry.race_id,
                    steps_delta = entry.steps_delta,
                    source = %entry.source,
                    "Created ledger entry"
                );
                Ok(CreateOutcome::Created(entry))
            }
            Some(existing) => {
                info!(
                    transaction_id = %existing.transaction_id.short(),
                    user = %existing.user_id,
                    race = %existing.race_id,
                    status = %existing.status,
                    "Duplicate event, keeping existing ledger entry"
                );
                Ok(CreateOutcome::Duplicate(existing))
            }
        }
    }

    /// Inserts `entry` if its id is free and indexes whichever entry ends up stored.
    ///
    /// Returns the previously stored entry on collision.
    fn insert(&self, entry: &LedgerEntry) -> Result<Option<LedgerEntry>> {
        let key = keys::ledger_entry(&entry.transaction_id);
        let value = serde_json::to_value(entry).map_err(StoreError::from)?;
        match self.store.insert_new(&key, value)? {
            InsertOutcome::Inserted => {
                self.index(entry)?;
                Ok(None)
            }
            InsertOutcome::AlreadyExists(existing) => {
                let existing: LedgerEntry = decode(&key, existing)?;
                self.index(&existing)?;
                Ok(Some(existing))
            }
        }
    }

    fn index(&self, entry: &LedgerEntry) -> Result<()> {
        let key = keys::ledger_index(
            &entry.race_id,
            &entry.user_id,
            entry.timestamp,
            &entry.transaction_id,
        );
        self.store
            .put(&key, Value::String(entry.transaction_id.to_string()))?;
        Ok(())
    }

    /// Reads an entry by id.
    pub fn get(&self, id: &TransactionId) -> Result<Option<LedgerEntry>> {
        Ok(get_json(self.store.as_ref(), &keys::ledger_entry(id))?)
    }

    fn load(&self, id: &TransactionId) -> Result<LedgerEntry> {
        self.get(id)?
            .ok_or_else(|| LedgerError::NotFound(id.clone()))
    }

    fn transition(
        &self,
        id: &TransactionId,
        step: impl FnOnce(&LedgerEntry) -> std::result::Result<LedgerEntry, TransitionError>,
    ) -> Result<LedgerEntry> {
        let current = self.load(id)?;
        let next = step(&current)?;
        put_json(self.store.as_ref(), &keys::ledger_entry(id), &next)?;
        Ok(next)
    }

    /// `pending → applied`.
    pub fn apply(&self, id: &TransactionId, server_steps_after: i64) -> Result<LedgerEntry> {
        let entry = self.transition(id, |e| {
            transitions::apply(e, server_steps_after, Utc::now())
        })?;
        debug!(
            transaction_id = %id.short(),
            server_steps_before = entry.server_steps_before,
            server_steps_after,
            "Applied ledger entry"
        );
        Ok(entry)
    }

    /// Applies unless the report carries errors.
    ///
    /// Errors reject the apply with [`LedgerError::Blocked`] and leave the entry
    /// untouched. Warnings are kept on the entry as audit notes.
    pub fn apply_validated(
        &self,
        id: &TransactionId,
        server_steps_after: i64,
        report: &ValidationReport,
    ) -> Result<LedgerEntry> {
        if report.has_errors() {
            let messages = report.error_messages();
            warn!(
                transaction_id = %id.short(),
                errors = ?messages,
                "Validation errors block apply"
            );
            return Err(LedgerError::Blocked { messages });
        }

        let warnings = report.warning_messages();
        let entry = self.transition(id, |e| {
            let mut next = transitions::apply(e, server_steps_after, Utc::now())?;
            next.audit_notes.extend(
                warnings
                    .iter()
                    .map(|w| format!("validator warning: {w}")),
            );
            Ok(next)
        })?;
        debug!(
            transaction_id = %id.short(),
            server_steps_after,
            warnings = warnings.len(),
            "Applied ledger entry"
        );
        Ok(entry)
    }

    /// `pending → failed`. Logs at error level when this exhausts the retries.
    pub fn fail(&self, id: &TransactionId, error_message: &str) -> Result<LedgerEntry> {
        let entry = self.transition(id, |e| transitions::fail(e, error_message, Utc::now()))?;
        if entry.is_finalized() {
            error!(
                transaction_id = %id.short(),
                user = %entry.user_id,
                race = %entry.race_id,
                steps_delta = entry.steps_delta,
                retry_count = entry.retry_count,
                error = error_message,
                "Retries exhausted, entry needs reconciliation"
            );
        } else {
            warn!(
                transaction_id = %id.short(),
                retry_count = entry.retry_count,
                error = error_message,
                "Ledger entry failed"
            );
        }
        Ok(entry)
    }

    /// `failed → pending`.
    pub fn retry(&self, id: &TransactionId) -> Result<LedgerEntry> {
        let entry = self.transition(id, |e| transitions::retry(e, Utc::now()))?;
        debug!(
            transaction_id = %id.short(),
            retry_count = entry.retry_count,
            "Retrying ledger entry"
        );
        Ok(entry)
    }

    /// Any non-finalized status `→ rolled_back`.
    pub fn rollback(&self, id: &TransactionId, reason: &str) -> Result<LedgerEntry> {
        let entry = self.transition(id, |e| transitions::rollback(e, reason, Utc::now()))?;
        warn!(
            transaction_id = %id.short(),
            user = %entry.user_id,
            race = %entry.race_id,
            steps_delta = entry.steps_delta,
            reason,
            "Rolled back ledger entry"
        );
        Ok(entry)
    }

    /// Every entry of the pair, in `(timestamp, transaction_id)` order.
    pub fn entries_for(&self, user: &UserId, race: &RaceId) -> Result<Vec<LedgerEntry>> {
        let mut entries = Vec::new();
        for (key, value) in self
            .store
            .query_prefix(&keys::ledger_index_prefix(race, user))?
        {
            let id: TransactionId = decode(&key, value)?;
            match self.get(&id)? {
                Some(entry) => entries.push(entry),
                None => warn!(index_key = %key, "Ledger index points at a missing entry"),
            }
        }
        entries.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.transaction_id.cmp(&b.transaction_id))
        });
        entries.dedup_by(|a, b| a.transaction_id == b.transaction_id);
        Ok(entries)
    }

    /// Replays the pair's applied chain.
    pub fn audit(&self, user: &UserId, race: &RaceId) -> Result<AuditReport> {
        Ok(replay::audit(&self.entries_for(user, race)?))
    }

    /// The latest applied `server_steps_after` of the pair.
    pub fn applied_total(&self, user: &UserId, race: &RaceId) -> Result<Option<i64>> {
        Ok(replay::applied_total(&self.entries_for(user, race)?))
    }

    /// The pair's total including reconciliation corrections.
    pub fn race_total(&self, user: &UserId, race: &RaceId) -> Result<Option<i64>> {
        Ok(replay::race_total(&self.entries_for(user, race)?))
    }

    /// Entries that have not settled yet: pending, or failed with retries left.
    ///
    /// These are left behind by a crash, a caller timeout or a shutdown during
    /// backoff. They come back in creation order.
    pub fn open_entries(&self, user: &UserId, race: &RaceId) -> Result<Vec<LedgerEntry>> {
        Ok(self
            .entries_for(user, race)?
            .into_iter()
            .filter(|e| e.status == TransactionStatus::Pending || e.should_retry())
            .collect())
    }

    /// Entries finalized as failed, awaiting reconciliation.
    pub fn exhausted_for(&self, user: &UserId, race: &RaceId) -> Result<Vec<LedgerEntry>> {
        Ok(self
            .entries_for(user, race)?
            .into_iter()
            .filter(|e| e.status == TransactionStatus::Failed && e.is_finalized())
            .collect())
    }

    /// Appends a correction bringing the pair's total to `authoritative_total`.
    ///
    /// Returns `None` when there is no drift. Existing entries are never touched.
    pub fn reconcile(
        &self,
        user: &UserId,
        race: &RaceId,
        authoritative_total: i64,
        reason: &str,
    ) -> Result<Option<LedgerEntry>> {
        let entries = self.entries_for(user, race)?;
        let current = replay::race_total(&entries).unwrap_or(0);
        let drift = authoritative_total.saturating_sub(current);
        if drift == 0 {
            debug!(user = %user, race = %race, total = current, "No drift to reconcile");
            return Ok(None);
        }

        let sequence = entries
            .iter()
            .filter(|e| e.status == TransactionStatus::Reconciled)
            .count();
        let now = self.stamp();
        let entry = LedgerEntry {
            transaction_id: reconciliation_id(user, race, sequence, current, authoritative_total),
            timestamp: now,
            race_id: race.clone(),
            user_id: user.clone(),
            steps_delta: drift,
            source: Source::Manual,
            server_steps_before: current,
            metadata: BTreeMap::from([
                (METADATA_KIND.to_string(), KIND_RECONCILIATION.to_string()),
                (METADATA_REASON.to_string(), reason.to_string()),
            ]),
            status: TransactionStatus::Reconciled,
            server_steps_after: Some(authoritative_total),
            error_message: None,
            retry_count: 0,
            last_updated: now,
            audit_notes: Vec::new(),
        };

        match self.insert(&entry)? {
            None => {
                info!(
                    transaction_id = %entry.transaction_id.short(),
                    user = %user,
                    race = %race,
                    from = current,
                    to = authoritative_total,
                    drift,
                    reason,
                    "Emitted reconciliation entry"
                );
                Ok(Some(entry))
            }
            Some(existing) => {
                info!(
                    transaction_id = %existing.transaction_id.short(),
                    "Reconciliation already recorded"
                );
                Ok(Some(existing))
            }
        }
    }
}
