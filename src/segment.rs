//! Customer activity segmentation by recency of approved purchases.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Active,
    AtRisk,
    Inactive,
}

/// Inclusive upper bounds on whole days since the last approved purchase,
/// checked in order. Anything older is `Inactive`.
pub const ACTIVITY_THRESHOLDS: [(i64, ActivityStatus); 2] =
    [(3, ActivityStatus::Active), (7, ActivityStatus::AtRisk)];

/// Whole days elapsed between `then` and `now`, floored.
pub fn days_since(then: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - then).num_days()
}

/// Classifies a customer from the timestamp of their last approved purchase.
pub fn classify(last_purchase: Option<DateTime<Utc>>, now: DateTime<Utc>) -> ActivityStatus {
    let Some(last) = last_purchase else {
        return ActivityStatus::Inactive;
    };
    let days = days_since(last, now);

    ACTIVITY_THRESHOLDS
        .iter()
        .find(|(max_days, _)| days <= *max_days)
        .map(|(_, status)| *status)
        .unwrap_or(ActivityStatus::Inactive)
}
