//! Expiry Scheduler
//!
//! Owns the process-wide [`TimeQueue`]. Constructed once and shared by
//! handle between the transfer coordinator (which watches and unwatches
//! transfers) and the [`ExpiryWorker`](super::ExpiryWorker).

use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use super::queue::{InsertListener, TimeQueue};
use crate::error::Result;
use crate::store::LedgerStore;

/// Largest delay a single wakeup is scheduled for; longer deadlines are
/// reached by waking at the cap and re-evaluating.
pub const DEFAULT_MAX_TIMEOUT: Duration = Duration::from_millis(i32::MAX as u64);

#[derive(Default)]
pub struct ExpiryScheduler {
    queue: Mutex<TimeQueue>,
}

impl ExpiryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self) -> MutexGuard<'_, TimeQueue> {
        // Queue operations never panic midway, so a poisoned guard is consistent
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a transfer's deadline
    pub fn watch(&self, id: Uuid, expires_at: DateTime<Utc>) {
        self.queue().insert(expires_at, id);
    }

    pub fn unwatch(&self, id: Uuid) -> bool {
        self.queue().remove(id)
    }

    pub fn is_watching(&self, id: Uuid) -> bool {
        self.queue().contains(id)
    }

    pub fn deadline(&self, id: Uuid) -> Option<DateTime<Utc>> {
        self.queue().due_at(id)
    }

    pub fn earliest_due_at(&self) -> Option<DateTime<Utc>> {
        self.queue().earliest_due_at()
    }

    pub fn len(&self) -> usize {
        self.queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue().is_empty()
    }

    /// Remove and return everything due by `now`, earliest first
    pub fn pop_due(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        self.queue().pop_all_due_by(now)
    }

    /// Delay until the next wakeup: `min(earliest - now, max_timeout)`,
    /// zero if something is already due, `None` if the queue is empty.
    pub fn next_wakeup_delay(&self, now: DateTime<Utc>, max_timeout: Duration) -> Option<Duration> {
        let earliest = self.earliest_due_at()?;
        let until = (earliest - now).to_std().unwrap_or(Duration::ZERO);
        Some(until.min(max_timeout))
    }

    pub fn set_insert_listener(&self, listener: InsertListener) {
        self.queue().set_insert_listener(listener);
    }

    pub fn clear_insert_listener(&self) {
        self.queue().clear_insert_listener();
    }

    pub fn has_insert_listener(&self) -> bool {
        self.queue().has_insert_listener()
    }

    /// Repopulate the queue from storage after a restart
    pub async fn rebuild(&self, store: &dyn LedgerStore) -> Result<usize> {
        let expiring = {
            let mut tx = store.begin().await?;
            tx.expiring_transfers().await?
        };

        let mut queue = self.queue();
        queue.clear();
        for (id, expires_at) in &expiring {
            queue.insert(*expires_at, *id);
        }
        drop(queue);

        info!(count = expiring.len(), "Expiry queue rebuilt");
        Ok(expiring.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::transfer::{Credit, Debit, TransferState, TransferSubmission};
    use chrono::Duration as ChronoDuration;
    use rust_decimal::Decimal;

    #[test]
    fn test_next_wakeup_delay_is_capped() {
        let scheduler = ExpiryScheduler::new();
        let now = Utc::now();
        assert_eq!(scheduler.next_wakeup_delay(now, Duration::from_secs(1)), None);

        scheduler.watch(Uuid::new_v4(), now + ChronoDuration::hours(1));
        assert_eq!(
            scheduler.next_wakeup_delay(now, Duration::from_secs(1)),
            Some(Duration::from_secs(1))
        );
        assert_eq!(
            scheduler.next_wakeup_delay(now, Duration::from_secs(7200)),
            Some(Duration::from_secs(3600))
        );

        scheduler.watch(Uuid::new_v4(), now - ChronoDuration::seconds(5));
        assert_eq!(
            scheduler.next_wakeup_delay(now, Duration::from_secs(1)),
            Some(Duration::ZERO)
        );
    }

    #[tokio::test]
    async fn test_rebuild_skips_finalized() {
        let store = MemoryStore::new();
        let expires_at = Utc::now() + ChronoDuration::minutes(5);

        let open = TransferSubmission::new(
            Uuid::new_v4(),
            vec![Debit::new("alice", Decimal::ONE)],
            vec![Credit::new("bob", Decimal::ONE)],
        )
        .with_expiry(expires_at)
        .into_transfer("http://ledger.example");
        let mut done = open.clone();
        done.id = Uuid::new_v4();
        done.state = TransferState::Executed;
        let mut no_deadline = open.clone();
        no_deadline.id = Uuid::new_v4();
        no_deadline.expires_at = None;

        let mut tx = store.begin().await.unwrap();
        for t in [&open, &done, &no_deadline] {
            tx.upsert_transfer(t).await.unwrap();
        }
        tx.commit().await.unwrap();

        let scheduler = ExpiryScheduler::new();
        scheduler.watch(Uuid::new_v4(), expires_at);
        assert_eq!(scheduler.rebuild(&store).await.unwrap(), 1);
        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.deadline(open.id), Some(expires_at));
    }
}
