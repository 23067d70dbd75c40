//! Max-merge of two records for the same (user, date).
//!
//! Pedometer and health-store samples are each partial views of the same day
//! with different gaps. Taking the per-field maximum approximates the true
//! count without double-counting the overlap, and is unaffected by one source
//! briefly reporting zero.

use chrono::NaiveDate;
use thiserror::Error;

use crate::types::{DailyRecord, Source, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    #[error("cannot merge records for different dates: {left} and {right}")]
    DateMismatch { left: NaiveDate, right: NaiveDate },

    #[error("cannot merge records for different users: {left} and {right}")]
    UserMismatch { left: UserId, right: UserId },
}

/// Merges two records for the same user and date.
///
/// Every numeric field and every hour of the breakdown takes the maximum of
/// the two inputs. The source stays as-is when both agree and becomes
/// [`Source::Hybrid`] otherwise. The result is synced only if both inputs are.
///
/// `merge(a, b) == merge(b, a)` and `merge(a, a) == a`.
pub fn merge(a: &DailyRecord, b: &DailyRecord) -> Result<DailyRecord, MergeError> {
    if a.date != b.date {
        return Err(MergeError::DateMismatch {
            left: a.date,
            right: b.date,
        });
    }
    if a.user_id != b.user_id {
        return Err(MergeError::UserMismatch {
            left: a.user_id.clone(),
            right: b.user_id.clone(),
        });
    }

    let mut hourly = a.hourly.clone();
    for (&hour, &steps) in &b.hourly {
        hourly
            .entry(hour)
            .and_modify(|s| *s = (*s).max(steps))
            .or_insert(steps);
    }

    Ok(DailyRecord {
        user_id: a.user_id.clone(),
        date: a.date,
        steps: a.steps.max(b.steps),
        distance_km: a.distance_km.max(b.distance_km),
        calories: a.calories.max(b.calories),
        active_minutes: a.active_minutes.max(b.active_minutes),
        source: if a.source == b.source {
            a.source
        } else {
            Source::Hybrid
        },
        hourly,
        is_synced: a.is_synced && b.is_synced,
        created_at: a.created_at.min(b.created_at),
        synced_at: a.synced_at.max(b.synced_at),
        is_final: a.is_final || b.is_final,
    })
}
