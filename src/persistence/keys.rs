//! Store key layout.
//!
//! - `daily/<user>/<yyyy-mm-dd>`: one [`DailyRecord`](crate::types::DailyRecord)
//! - `summary/<user>`: one [`SummaryRecord`](crate::types::SummaryRecord)
//! - `ledger/entry/<txid>`: one [`LedgerEntry`](crate::types::LedgerEntry)
//! - `ledger/by_pair/<race>/<user>/<timestamp>/<txid>`: secondary index, value is the txid
//!
//! Dates and timestamps are formatted so that lexicographic key order is
//! chronological order.

use chrono::{DateTime, NaiveDate, Utc};

use crate::types::{RaceId, TransactionId, UserId};

pub fn daily(user: &UserId, date: NaiveDate) -> String {
    format!("daily/{}/{}", user, date.format("%Y-%m-%d"))
}

pub fn daily_prefix(user: &UserId) -> String {
    format!("daily/{}/", user)
}

pub fn summary(user: &UserId) -> String {
    format!("summary/{}", user)
}

pub fn ledger_entry(id: &TransactionId) -> String {
    format!("ledger/entry/{}", id)
}

/// Index key for replay and reconciliation scans of one (race, user) pair.
pub fn ledger_index(
    race: &RaceId,
    user: &UserId,
    timestamp: DateTime<Utc>,
    id: &TransactionId,
) -> String {
    format!(
        "{}{}/{}",
        ledger_index_prefix(race, user),
        timestamp.format("%Y%m%dT%H%M%S%.9fZ"),
        id
    )
}

pub fn ledger_index_prefix(race: &RaceId, user: &UserId) -> String {
    format!("ledger/by_pair/{}/{}/", race, user)
}
