//! Lifetime rollup record.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::ids::UserId;

/// Lifetime totals for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub user_id: UserId,
    pub total_days: u32,
    pub total_steps: u64,
    pub total_distance_km: f64,
    pub total_calories: u64,
    pub total_active_minutes: u64,
    pub first_tracking_date: Option<NaiveDate>,
    pub last_updated: DateTime<Utc>,

    /// Dates already committed. Only maintained under the idempotent commit policy.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub committed_dates: BTreeSet<NaiveDate>,
}

impl SummaryRecord {
    /// An empty summary for a user with no tracked days.
    pub fn empty(user_id: UserId, now: DateTime<Utc>) -> Self {
        SummaryRecord {
            user_id,
            total_days: 0,
            total_steps: 0,
            total_distance_km: 0.0,
            total_calories: 0,
            total_active_minutes: 0,
            first_tracking_date: None,
            last_updated: now,
            committed_dates: BTreeSet::new(),
        }
    }
}
