//! Pending notification work items

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One pending delivery of a transfer's latest state to a subscription
///
/// Keyed by `(subscription_id, transfer_id)`: repeated mutations of the same
/// transfer collapse onto one row. Deleted once delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub transfer_id: Uuid,
    pub retry_count: i32,
    /// `None` means deliverable right away
    pub retry_at: Option<DateTime<Utc>>,
}

impl Notification {
    pub fn new(subscription_id: Uuid, transfer_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscription_id,
            transfer_id,
            retry_count: 0,
            retry_at: None,
        }
    }

    #[inline]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.retry_at.is_none_or(|at| at <= now)
    }
}
