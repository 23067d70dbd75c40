//! Status transitions for the ledger state machine.
//!
//! Pure functions that take an entry and return the next entry, or an error if
//! the transition is not allowed. The input is never modified, so a rejected
//! transition has no side effects.
//!
//! ```text
//! pending ──apply──► applied            (terminal)
//! pending ──fail───► failed (retry_count + 1)
//! failed ──retry───► pending            (only while retry_count < MAX_RETRIES)
//! any non-finalized ──rollback──► rolled_back (terminal)
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{LedgerEntry, TransactionId, TransactionStatus};

/// A transition that can be requested on an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Apply,
    Fail,
    Retry,
    Rollback,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Apply => "apply",
            Action::Fail => "fail",
            Action::Retry => "retry",
            Action::Rollback => "roll back",
        })
    }
}

/// A transition attempted from an incompatible or finalized state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("cannot {action} transaction {transaction_id} from status {from}")]
    Illegal {
        transaction_id: TransactionId,
        from: TransactionStatus,
        action: Action,
    },

    #[error("cannot {action} transaction {transaction_id}: finalized as {status}")]
    Finalized {
        transaction_id: TransactionId,
        status: TransactionStatus,
        action: Action,
    },
}

fn reject(entry: &LedgerEntry, action: Action) -> TransitionError {
    if entry.is_finalized() {
        TransitionError::Finalized {
            transaction_id: entry.transaction_id.clone(),
            status: entry.status,
            action,
        }
    } else {
        TransitionError::Illegal {
            transaction_id: entry.transaction_id.clone(),
            from: entry.status,
            action,
        }
    }
}

/// `pending → applied`, recording the server total after attribution.
pub fn apply(
    entry: &LedgerEntry,
    server_steps_after: i64,
    now: DateTime<Utc>,
) -> Result<LedgerEntry, TransitionError> {
    if entry.status != TransactionStatus::Pending {
        return Err(reject(entry, Action::Apply));
    }
    let mut next = entry.clone();
    next.status = TransactionStatus::Applied;
    next.server_steps_after = Some(server_steps_after);
    next.error_message = None;
    next.last_updated = now;
    Ok(next)
}

/// `pending → failed`, counting the attempt.
pub fn fail(
    entry: &LedgerEntry,
    error_message: impl Into<String>,
    now: DateTime<Utc>,
) -> Result<LedgerEntry, TransitionError> {
    if entry.status != TransactionStatus::Pending {
        return Err(reject(entry, Action::Fail));
    }
    let mut next = entry.clone();
    next.status = TransactionStatus::Failed;
    next.retry_count += 1;
    next.error_message = Some(error_message.into());
    next.last_updated = now;
    Ok(next)
}

/// `failed → pending`, while retries remain.
pub fn retry(entry: &LedgerEntry, now: DateTime<Utc>) -> Result<LedgerEntry, TransitionError> {
    if !entry.should_retry() {
        return Err(reject(entry, Action::Retry));
    }
    let mut next = entry.clone();
    next.status = TransactionStatus::Pending;
    next.last_updated = now;
    Ok(next)
}

/// Any non-finalized status `→ rolled_back`.
pub fn rollback(
    entry: &LedgerEntry,
    reason: impl Into<String>,
    now: DateTime<Utc>,
) -> Result<LedgerEntry, TransitionError> {
    if entry.is_finalized() {
        return Err(reject(entry, Action::Rollback));
    }
    let reason = reason.into();
    let mut next = entry.clone();
    next.status = TransactionStatus::RolledBack;
    next.audit_notes.push(format!("rolled back: {reason}"));
    next.error_message = Some(reason);
    next.last_updated = now;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{arb_ledger_entry, pending_entry};
    use crate::types::MAX_RETRIES;
    use proptest::prelude::*;

    #[test]
    fn apply_from_pending() {
        let e = pending_entry(100, 1000);
        let applied = apply(&e, 1100, Utc::now()).unwrap();
        assert_eq!(applied.status, TransactionStatus::Applied);
        assert_eq!(applied.server_steps_after, Some(1100));
        assert_eq!(applied.server_steps_before, 1000);
        assert!(applied.is_finalized());
    }

    #[test]
    fn apply_twice_is_rejected_as_finalized() {
        let e = pending_entry(100, 1000);
        let applied = apply(&e, 1100, Utc::now()).unwrap();
        assert!(matches!(
            apply(&applied, 1200, Utc::now()),
            Err(TransitionError::Finalized {
                status: TransactionStatus::Applied,
                ..
            })
        ));
    }

    #[test]
    fn fail_counts_and_retry_returns_to_pending() {
        let e = pending_entry(5, 0);
        let failed = fail(&e, "timeout", Utc::now()).unwrap();
        assert_eq!(failed.status, TransactionStatus::Failed);
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.error_message.as_deref(), Some("timeout"));
        assert!(failed.should_retry());

        let pending = retry(&failed, Utc::now()).unwrap();
        assert_eq!(pending.status, TransactionStatus::Pending);
        assert_eq!(pending.retry_count, 1);
    }

    #[test]
    fn apply_from_failed_is_illegal() {
        let failed = fail(&pending_entry(5, 0), "x", Utc::now()).unwrap();
        assert_eq!(
            apply(&failed, 5, Utc::now()),
            Err(TransitionError::Illegal {
                transaction_id: failed.transaction_id.clone(),
                from: TransactionStatus::Failed,
                action: Action::Apply,
            })
        );
    }

    #[test]
    fn three_failures_finalize() {
        let mut e = pending_entry(5, 0);
        for attempt in 1..=MAX_RETRIES {
            e = fail(&e, "boom", Utc::now()).unwrap();
            assert_eq!(e.retry_count, attempt);
            if attempt < MAX_RETRIES {
                e = retry(&e, Utc::now()).unwrap();
            }
        }
        assert_eq!(e.retry_count, 3);
        assert!(!e.should_retry());
        assert!(e.is_finalized());
        assert!(matches!(
            retry(&e, Utc::now()),
            Err(TransitionError::Finalized { .. })
        ));
        assert!(matches!(
            rollback(&e, "cancelled", Utc::now()),
            Err(TransitionError::Finalized { .. })
        ));
    }

    #[test]
    fn rollback_from_pending_and_failed() {
        let e = pending_entry(5, 0);
        let rolled = rollback(&e, "race cancelled", Utc::now()).unwrap();
        assert_eq!(rolled.status, TransactionStatus::RolledBack);
        assert!(rolled.is_finalized());
        assert_eq!(rolled.audit_notes, vec!["rolled back: race cancelled"]);

        let failed = fail(&e, "x", Utc::now()).unwrap();
        assert!(rollback(&failed, "invalid", Utc::now()).is_ok());
    }

    #[test]
    fn retry_from_pending_is_illegal() {
        let e = pending_entry(5, 0);
        assert!(matches!(
            retry(&e, Utc::now()),
            Err(TransitionError::Illegal {
                action: Action::Retry,
                ..
            })
        ));
    }

    proptest! {
        #[test]
        fn transitions_never_touch_identity(entry in arb_ledger_entry()) {
            let now = Utc::now();
            let results = [
                apply(&entry, 42, now),
                fail(&entry, "e", now),
                retry(&entry, now),
                rollback(&entry, "r", now),
            ];
            for next in results.into_iter().flatten() {
                prop_assert_eq!(&next.transaction_id, &entry.transaction_id);
                prop_assert_eq!(next.timestamp, entry.timestamp);
                prop_assert_eq!(next.steps_delta, entry.steps_delta);
                prop_assert_eq!(next.server_steps_before, entry.server_steps_before);
                prop_assert_eq!(&next.metadata, &entry.metadata);
            }
        }

        #[test]
        fn finalized_entries_admit_no_transition(entry in arb_ledger_entry()) {
            prop_assume!(entry.is_finalized());
            let now = Utc::now();
            prop_assert!(apply(&entry, 1, now).is_err());
            prop_assert!(fail(&entry, "e", now).is_err());
            prop_assert!(retry(&entry, now).is_err());
            prop_assert!(rollback(&entry, "r", now).is_err());
        }

        #[test]
        fn retry_count_never_exceeds_limit(entry in arb_ledger_entry()) {
            prop_assume!(entry.retry_count <= MAX_RETRIES);
            if let Ok(next) = fail(&entry, "e", Utc::now()) {
                prop_assert!(next.retry_count <= MAX_RETRIES || entry.retry_count == MAX_RETRIES);
            }
        }
    }
}
