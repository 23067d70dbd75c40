//! Content-derived transaction ids.
//!
//! Clients on flaky connections resend the same reading. The id is a SHA-256
//! over the fields that identify the physical event, with the timestamp
//! coarsened to a bucket, so a resend lands on the same id and the ledger's
//! create-if-absent turns it into a no-op. The counter readings on both ends
//! of the sync are part of the fingerprint: two syncs in one bucket that add
//! the same number of steps are still different events.
//!
//! # Fingerprint Format
//!
//! Fields are joined with the ASCII unit separator (`0x1f`), which cannot occur
//! in validated ids:
//!
//! - event: `event \x1f <user> \x1f <race> \x1f <source> \x1f <bucket> \x1f <previous_steps> \x1f <new_steps>`
//! - reconciliation: `reconcile \x1f <user> \x1f <race> \x1f <sequence> \x1f <from_total> \x1f <to_total>`
//!
//! `sequence` is the number of corrections already recorded for the pair, so the
//! same correction issued twice concurrently collides while a later, identical
//! correction after further drift does not.

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};

use crate::types::{RaceId, Source, TransactionId, UserId};

/// Default width of the timestamp bucket.
pub const DEFAULT_ID_BUCKET_SECS: i64 = 60;

const SEPARATOR: &str = "\x1f";

fn hash_fields(fields: &[&str]) -> TransactionId {
    let mut hasher = Sha256::new();
    hasher.update(fields.join(SEPARATOR).as_bytes());
    TransactionId::new(hex::encode(hasher.finalize()))
}

/// The bucket a timestamp falls into. Widths under one second count as one second.
pub fn time_bucket(occurred_at: DateTime<Utc>, width: Duration) -> i64 {
    let secs = width.num_seconds().max(1);
    occurred_at.timestamp().div_euclid(secs)
}

/// Derives the id of the sync that moved the counter from `previous_steps` to `new_steps`.
pub fn event_id(
    user: &UserId,
    race: &RaceId,
    source: Source,
    previous_steps: u64,
    new_steps: u64,
    occurred_at: DateTime<Utc>,
    bucket_width: Duration,
) -> TransactionId {
    let bucket = time_bucket(occurred_at, bucket_width).to_string();
    let previous = previous_steps.to_string();
    let new = new_steps.to_string();
    hash_fields(&[
        "event",
        user.as_str(),
        race.as_str(),
        source.as_str(),
        &bucket,
        &previous,
        &new,
    ])
}

/// Derives the id of the `sequence`-th reconciliation, correcting `from_total` to `to_total`.
pub fn reconciliation_id(
    user: &UserId,
    race: &RaceId,
    sequence: usize,
    from_total: i64,
    to_total: i64,
) -> TransactionId {
    let sequence = sequence.to_string();
    let from = from_total.to_string();
    let to = to_total.to_string();
    hash_fields(&[
        "reconcile",
        user.as_str(),
        race.as_str(),
        &sequence,
        &from,
        &to,
    ])
}
