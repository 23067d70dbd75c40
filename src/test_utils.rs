//! Shared test fixtures and arbitrary generators for property-based testing.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use proptest::prelude::*;

use crate::types::{
    DailyRecord, LedgerEntry, MAX_RETRIES, RaceId, Source, TransactionId, TransactionStatus,
    UserId,
};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A transaction id unique within the test process.
pub fn next_transaction_id() -> TransactionId {
    TransactionId::new(format!("tx-{:016x}", NEXT_ID.fetch_add(1, Ordering::Relaxed)))
}

pub fn arb_user_id() -> impl Strategy<Value = UserId> {
    "[a-z][a-z0-9_-]{0,15}".prop_map(|s| UserId::new(s).unwrap())
}

pub fn arb_race_id() -> impl Strategy<Value = RaceId> {
    "[a-z][a-z0-9-]{0,15}".prop_map(|s| RaceId::new(s).unwrap())
}

pub fn arb_source() -> impl Strategy<Value = Source> {
    prop_oneof![
        Just(Source::Pedometer),
        Just(Source::Health),
        Just(Source::Manual),
        Just(Source::Hybrid),
    ]
}

pub fn arb_date() -> impl Strategy<Value = NaiveDate> {
    (0i64..3650).prop_map(|days| {
        NaiveDate::from_ymd_opt(2020, 1, 1).unwrap() + Duration::days(days)
    })
}

/// Whole-second timestamps between 2020 and 2030.
pub fn arb_timestamp() -> impl Strategy<Value = DateTime<Utc>> {
    (1_577_836_800i64..1_893_456_000).prop_map(|secs| DateTime::from_timestamp(secs, 0).unwrap())
}

pub fn arb_hourly() -> impl Strategy<Value = BTreeMap<u8, u64>> {
    prop::collection::btree_map(0u8..24, 0u64..20_000, 0..24)
}

fn arb_daily_record_for(user: UserId, date: NaiveDate) -> impl Strategy<Value = DailyRecord> {
    (
        0u64..100_000,
        0.0f64..100.0,
        0u32..6_000,
        0u32..1_440,
        arb_source(),
        arb_hourly(),
        any::<bool>(),
        arb_timestamp(),
        proptest::option::of(arb_timestamp()),
        any::<bool>(),
    )
        .prop_map(
            move |(
                steps,
                distance_km,
                calories,
                active_minutes,
                source,
                hourly,
                is_synced,
                created_at,
                synced_at,
                is_final,
            )| DailyRecord {
                user_id: user.clone(),
                date,
                steps,
                distance_km,
                calories,
                active_minutes,
                source,
                hourly,
                is_synced,
                created_at,
                synced_at,
                is_final,
            },
        )
}

pub fn arb_daily_record() -> impl Strategy<Value = DailyRecord> {
    (arb_user_id(), arb_date()).prop_flat_map(|(user, date)| arb_daily_record_for(user, date))
}

/// Two records for the same user and date.
pub fn arb_daily_record_pair() -> impl Strategy<Value = (DailyRecord, DailyRecord)> {
    (arb_user_id(), arb_date()).prop_flat_map(|(user, date)| {
        (
            arb_daily_record_for(user.clone(), date),
            arb_daily_record_for(user, date),
        )
    })
}

/// A pending entry for pair (`u1`, `r1`) with a fresh id.
pub fn pending_entry_at(steps_delta: i64, server_steps_before: i64, at: DateTime<Utc>) -> LedgerEntry {
    LedgerEntry {
        transaction_id: next_transaction_id(),
        timestamp: at,
        race_id: RaceId::new("r1").unwrap(),
        user_id: UserId::new("u1").unwrap(),
        steps_delta,
        source: Source::Pedometer,
        server_steps_before,
        metadata: BTreeMap::new(),
        status: TransactionStatus::Pending,
        server_steps_after: None,
        error_message: None,
        retry_count: 0,
        last_updated: at,
        audit_notes: Vec::new(),
    }
}

pub fn pending_entry(steps_delta: i64, server_steps_before: i64) -> LedgerEntry {
    pending_entry_at(steps_delta, server_steps_before, Utc::now())
}

pub fn arb_status() -> impl Strategy<Value = TransactionStatus> {
    prop_oneof![
        Just(TransactionStatus::Pending),
        Just(TransactionStatus::Applied),
        Just(TransactionStatus::Failed),
        Just(TransactionStatus::RolledBack),
        Just(TransactionStatus::Reconciled),
    ]
}

/// Entries in any status, with fields consistent with that status.
pub fn arb_ledger_entry() -> impl Strategy<Value = LedgerEntry> {
    (
        -50_000i64..50_000,
        0i64..1_000_000,
        arb_status(),
        0u32..=MAX_RETRIES,
        arb_timestamp(),
        arb_source(),
        prop::collection::btree_map("[a-z]{1,8}", "[a-z0-9 ]{0,16}", 0..3),
    )
        .prop_map(
            |(delta, before, status, retry_count, timestamp, source, metadata)| {
                let settled = matches!(
                    status,
                    TransactionStatus::Applied | TransactionStatus::Reconciled
                );
                let mut entry = pending_entry_at(delta, before, timestamp);
                entry.source = source;
                entry.metadata = metadata;
                entry.status = status;
                entry.server_steps_after = settled.then(|| before + delta);
                entry.retry_count = match status {
                    TransactionStatus::Pending => retry_count.min(MAX_RETRIES - 1),
                    _ => retry_count,
                };
                entry
            },
        )
}

/// A consistent chain of applied entries for one pair, one second apart.
pub fn arb_applied_chain() -> impl Strategy<Value = Vec<LedgerEntry>> {
    (
        0i64..1_000_000,
        prop::collection::vec(-5_000i64..5_000, 1..20),
        arb_timestamp(),
    )
        .prop_map(|(base, deltas, start)| {
            let mut total = base;
            deltas
                .into_iter()
                .enumerate()
                .map(|(i, delta)| {
                    let mut entry =
                        pending_entry_at(delta, total, start + Duration::seconds(i as i64));
                    total += delta;
                    entry.status = TransactionStatus::Applied;
                    entry.server_steps_after = Some(total);
                    entry
                })
                .collect()
        })
}
