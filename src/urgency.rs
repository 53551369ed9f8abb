use crate::models::UrgencyTier;
use chrono::{DateTime, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Urgency {
    pub tier: UrgencyTier,
    pub day_offset: i64,
    pub label: String,
}

impl Urgency {
    pub fn within_lookahead(&self, lookahead_days: u32) -> bool {
        match self.tier {
            UrgencyTier::Overdue | UrgencyTier::DueToday => true,
            UrgencyTier::Upcoming => self.day_offset <= i64::from(lookahead_days),
        }
    }
}

pub fn classify(due: DateTime<Utc>, reference: DateTime<Utc>) -> Urgency {
    classify_in(due, reference, &utc())
}

// Both instants become calendar dates in `offset` before subtracting.
pub fn classify_in(due: DateTime<Utc>, reference: DateTime<Utc>, offset: &FixedOffset) -> Urgency {
    let due_date = due.with_timezone(offset).date_naive();
    let reference_date = reference.with_timezone(offset).date_naive();
    let day_offset = due_date.signed_duration_since(reference_date).num_days();

    let (tier, label) = match day_offset {
        n if n < 0 => (UrgencyTier::Overdue, format!("{} days overdue", -n)),
        0 => (UrgencyTier::DueToday, "Due today".to_string()),
        1 => (UrgencyTier::Upcoming, "Tomorrow".to_string()),
        n => (UrgencyTier::Upcoming, format!("In {} days", n)),
    };

    Urgency {
        tier,
        day_offset,
        label,
    }
}

pub fn compare_keys(left: (UrgencyTier, i64), right: (UrgencyTier, i64)) -> Ordering {
    right
        .0
        .precedence()
        .cmp(&left.0.precedence())
        .then_with(|| left.1.cmp(&right.1))
}

pub fn sort_by_urgency<T, F>(items: &mut [T], key: F)
where
    F: Fn(&T) -> (UrgencyTier, i64),
{
    items.sort_by(|a, b| compare_keys(key(a), key(b)));
}

pub fn utc() -> FixedOffset {
    Utc.fix()
}
