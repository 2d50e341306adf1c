//! In-process store
//!
//! A transaction takes the store's mutex for its whole lifetime and works on
//! a private copy of the tables; `commit` swaps the copy in. Transactions are
//! therefore fully serialized, which makes the store convenient for tests of
//! the concurrency properties of the core.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{LedgerStore, LedgerTx};
use crate::account::{Account, Entry};
use crate::error::Result;
use crate::notify::Notification;
use crate::subscription::Subscription;
use crate::transfer::{FulfillmentRecord, Transfer, TransferState};

#[derive(Debug, Clone, Default)]
struct Tables {
    accounts: BTreeMap<String, Account>,
    entries: Vec<Entry>,
    transfers: HashMap<Uuid, Transfer>,
    fulfillments: HashMap<Uuid, FulfillmentRecord>,
    subscriptions: HashMap<Uuid, Subscription>,
    notifications: HashMap<Uuid, Notification>,
}

/// Serializable in-memory [`LedgerStore`]
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        let guard = self.tables.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTx { guard, working }))
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<Tables>,
    working: Tables,
}

#[async_trait]
impl LedgerTx for MemoryTx {
    async fn get_account(&mut self, name: &str) -> Result<Option<Account>> {
        Ok(self.working.accounts.get(name).cloned())
    }

    async fn lock_account(&mut self, name: &str) -> Result<Option<Account>> {
        // The whole store is already exclusively ours
        self.get_account(name).await
    }

    async fn upsert_account(&mut self, account: &Account) -> Result<bool> {
        Ok(self
            .working
            .accounts
            .insert(account.name.clone(), account.clone())
            .is_some())
    }

    async fn ensure_account(&mut self, account: &Account) -> Result<bool> {
        if self.working.accounts.contains_key(&account.name) {
            return Ok(false);
        }
        self.working
            .accounts
            .insert(account.name.clone(), account.clone());
        Ok(true)
    }

    async fn set_balance(&mut self, name: &str, balance: Decimal) -> Result<()> {
        if let Some(account) = self.working.accounts.get_mut(name) {
            account.balance = balance;
        }
        Ok(())
    }

    async fn insert_entry(&mut self, entry: &Entry) -> Result<()> {
        self.working.entries.push(entry.clone());
        Ok(())
    }

    async fn entries_for_account(&mut self, name: &str) -> Result<Vec<Entry>> {
        Ok(self
            .working
            .entries
            .iter()
            .filter(|e| e.account == name)
            .cloned()
            .collect())
    }

    async fn total_balance(&mut self) -> Result<Decimal> {
        Ok(self.working.accounts.values().map(|a| a.balance).sum())
    }

    async fn get_transfer(&mut self, id: Uuid) -> Result<Option<Transfer>> {
        Ok(self.working.transfers.get(&id).cloned())
    }

    async fn lock_transfer(&mut self, id: Uuid) -> Result<Option<Transfer>> {
        self.get_transfer(id).await
    }

    async fn upsert_transfer(&mut self, transfer: &Transfer) -> Result<bool> {
        Ok(self
            .working
            .transfers
            .insert(transfer.id, transfer.clone())
            .is_some())
    }

    async fn expiring_transfers(&mut self) -> Result<Vec<(Uuid, DateTime<Utc>)>> {
        Ok(self
            .working
            .transfers
            .values()
            .filter(|t| {
                matches!(t.state, TransferState::Proposed | TransferState::Prepared)
            })
            .filter_map(|t| t.expires_at.map(|at| (t.id, at)))
            .collect())
    }

    async fn get_fulfillment(&mut self, transfer_id: Uuid) -> Result<Option<FulfillmentRecord>> {
        Ok(self.working.fulfillments.get(&transfer_id).cloned())
    }

    async fn insert_fulfillment(&mut self, record: &FulfillmentRecord) -> Result<bool> {
        if self.working.fulfillments.contains_key(&record.transfer_id) {
            return Ok(false);
        }
        self.working
            .fulfillments
            .insert(record.transfer_id, record.clone());
        Ok(true)
    }

    async fn get_subscription(&mut self, id: Uuid) -> Result<Option<Subscription>> {
        Ok(self.working.subscriptions.get(&id).cloned())
    }

    async fn upsert_subscription(&mut self, subscription: &Subscription) -> Result<bool> {
        Ok(self
            .working
            .subscriptions
            .insert(subscription.id, subscription.clone())
            .is_some())
    }

    async fn subscriptions_for_subjects(
        &mut self,
        subjects: &[String],
    ) -> Result<Vec<Subscription>> {
        let mut found: Vec<Subscription> = self
            .working
            .subscriptions
            .values()
            .filter(|s| !s.is_deleted && subjects.contains(&s.subject))
            .cloned()
            .collect();
        found.sort_by_key(|s| s.id);
        Ok(found)
    }

    async fn upsert_notification(&mut self, notification: &Notification) -> Result<bool> {
        let existing = self.working.notifications.values_mut().find(|n| {
            n.subscription_id == notification.subscription_id
                && n.transfer_id == notification.transfer_id
        });

        match existing {
            Some(row) => {
                row.retry_count = 0;
                row.retry_at = None;
                Ok(true)
            }
            None => {
                self.working
                    .notifications
                    .insert(notification.id, notification.clone());
                Ok(false)
            }
        }
    }

    async fn due_notifications(
        &mut self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Notification>> {
        let mut due: Vec<Notification> = self
            .working
            .notifications
            .values()
            .filter(|n| n.is_due(now))
            .cloned()
            .collect();
        // None (immediately due) sorts before any timestamp
        due.sort_by_key(|n| (n.retry_at, n.id));
        due.truncate(limit);
        Ok(due)
    }

    async fn reschedule_notification(
        &mut self,
        id: Uuid,
        retry_count: i32,
        retry_at: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(row) = self.working.notifications.get_mut(&id) {
            row.retry_count = retry_count;
            row.retry_at = Some(retry_at);
        }
        Ok(())
    }

    async fn delete_notification(&mut self, id: Uuid) -> Result<()> {
        self.working.notifications.remove(&id);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTx { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }
}
