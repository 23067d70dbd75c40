//! Replaying the applied chain of a (race, user) pair.
//!
//! Applied entries, sorted by `(timestamp, transaction_id)`, form a chain: the
//! first entry's `server_steps_before` is the base, and adding each
//! `steps_delta` in order must reproduce the latest `server_steps_after`.
//! Reconciled entries sit outside the chain; they correct the race total
//! without rewriting history.

use crate::types::{LedgerEntry, TransactionId, TransactionStatus};

/// Outcome of replaying one pair's applied entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditReport {
    /// Number of applied entries replayed.
    pub applied: usize,
    /// `server_steps_before` of the earliest applied entry.
    pub base: Option<i64>,
    /// Base plus every applied delta.
    pub replayed_total: Option<i64>,
    /// `server_steps_after` of the latest applied entry.
    pub recorded_total: Option<i64>,
    /// First applied entry whose recorded `server_steps_after` disagrees with
    /// the running sum at that point.
    pub first_divergence: Option<TransactionId>,
}

impl AuditReport {
    /// True iff replay reproduces the recorded total. An empty chain is consistent.
    pub fn is_consistent(&self) -> bool {
        self.replayed_total == self.recorded_total
    }
}

fn chronological<'a>(
    entries: impl IntoIterator<Item = &'a LedgerEntry>,
    status: TransactionStatus,
) -> Vec<&'a LedgerEntry> {
    let mut chain: Vec<&LedgerEntry> = entries
        .into_iter()
        .filter(|e| e.status == status)
        .collect();
    chain.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.transaction_id.cmp(&b.transaction_id))
    });
    chain
}

/// Applied entries in replay order.
pub fn applied_chain(entries: &[LedgerEntry]) -> Vec<&LedgerEntry> {
    chronological(entries, TransactionStatus::Applied)
}

/// Replays the applied chain.
pub fn audit(entries: &[LedgerEntry]) -> AuditReport {
    let chain = applied_chain(entries);
    let Some(first) = chain.first() else {
        return AuditReport {
            applied: 0,
            base: None,
            replayed_total: None,
            recorded_total: None,
            first_divergence: None,
        };
    };

    let base = first.server_steps_before;
    let mut running = base;
    let mut first_divergence = None;
    for entry in &chain {
        running = running.saturating_add(entry.steps_delta);
        if first_divergence.is_none() && entry.server_steps_after != Some(running) {
            first_divergence = Some(entry.transaction_id.clone());
        }
    }

    AuditReport {
        applied: chain.len(),
        base: Some(base),
        replayed_total: Some(running),
        recorded_total: chain.last().and_then(|e| e.server_steps_after),
        first_divergence,
    }
}

/// The latest applied `server_steps_after`, if anything was applied.
pub fn applied_total(entries: &[LedgerEntry]) -> Option<i64> {
    applied_chain(entries)
        .last()
        .and_then(|e| e.server_steps_after)
}

/// The race total including reconciliation corrections.
///
/// Starts from the applied total (or, with nothing applied, from the first
/// correction's `server_steps_before`) and adds every reconciled delta.
pub fn race_total(entries: &[LedgerEntry]) -> Option<i64> {
    let corrections = chronological(entries, TransactionStatus::Reconciled);
    let start = match applied_total(entries) {
        Some(total) => total,
        None => corrections.first()?.server_steps_before,
    };
    Some(
        corrections
            .iter()
            .fold(start, |acc, e| acc.saturating_add(e.steps_delta)),
    )
}
