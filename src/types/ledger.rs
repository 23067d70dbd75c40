//! Ledger entry and transaction status types.
//!
//! A ledger entry has an immutable identity (what delta, for whom, from where,
//! against which server total) and a mutable outcome (status and the fields the
//! status transitions fill in).

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{RaceId, TransactionId, UserId};
use super::record::Source;

/// Number of failures after which a failed entry may no longer be retried.
pub const MAX_RETRIES: u32 = 3;

/// Lifecycle status of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Created, not yet attributed.
    Pending,
    /// Attributed to the race. Terminal.
    Applied,
    /// Attribution attempt failed; retriable while `retry_count < MAX_RETRIES`.
    Failed,
    /// Withdrawn (race cancelled, delta proven invalid). Terminal.
    RolledBack,
    /// Corrective entry emitted by reconciliation.
    Reconciled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Applied => "applied",
            TransactionStatus::Failed => "failed",
            TransactionStatus::RolledBack => "rolled_back",
            TransactionStatus::Reconciled => "reconciled",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step delta attributed (or being attributed) to a race.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    // ─── Identity (fixed at creation) ───
    pub transaction_id: TransactionId,
    pub timestamp: DateTime<Utc>,
    pub race_id: RaceId,
    pub user_id: UserId,
    pub steps_delta: i64,
    pub source: Source,
    /// Server-side race total when the entry was created. Never altered.
    pub server_steps_before: i64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    // ─── Outcome ───
    pub status: TransactionStatus,
    #[serde(default)]
    pub server_steps_after: Option<i64>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    pub last_updated: DateTime<Utc>,

    /// Advisory notes (validator warnings, rollback reasons). May grow after
    /// finalization; nothing reads them for bookkeeping.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audit_notes: Vec<String>,
}

impl LedgerEntry {
    /// True iff the entry failed and still has retries left.
    pub fn should_retry(&self) -> bool {
        self.status == TransactionStatus::Failed && self.retry_count < MAX_RETRIES
    }

    /// True iff no further transition is permitted.
    pub fn is_finalized(&self) -> bool {
        match self.status {
            TransactionStatus::Applied | TransactionStatus::RolledBack => true,
            TransactionStatus::Failed => self.retry_count >= MAX_RETRIES,
            TransactionStatus::Pending | TransactionStatus::Reconciled => false,
        }
    }
}
