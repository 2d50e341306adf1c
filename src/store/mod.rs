//! Storage layer
//!
//! The core only ever talks to storage through a [`LedgerTx`]: one
//! transaction per logical operation (submit, fulfill, expire, deliver).
//! A transaction that is dropped without [`LedgerTx::commit`] rolls back,
//! so an early `?` return inside an operation leaves no partial effects.
//!
//! Two implementations:
//! - [`PgStore`]: PostgreSQL via sqlx, row locks on accounts and transfers
//! - [`MemoryStore`]: in-process, serializable, used by tests and local runs

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::account::{Account, Entry};
use crate::error::Result;
use crate::notify::Notification;
use crate::subscription::Subscription;
use crate::transfer::{FulfillmentRecord, Transfer};

/// An open storage transaction
#[async_trait]
pub trait LedgerTx: Send {
    // === Accounts ===

    async fn get_account(&mut self, name: &str) -> Result<Option<Account>>;

    /// Read an account and hold its row until commit.
    ///
    /// Balance checks must go through this so that concurrent debits against
    /// the same account never both pass against a stale balance.
    async fn lock_account(&mut self, name: &str) -> Result<Option<Account>>;

    /// Insert or replace an account. Returns whether it already existed.
    async fn upsert_account(&mut self, account: &Account) -> Result<bool>;

    /// Insert an account unless one with the same name exists; an existing
    /// row is left untouched. Returns whether it was inserted.
    async fn ensure_account(&mut self, account: &Account) -> Result<bool>;

    async fn set_balance(&mut self, name: &str, balance: Decimal) -> Result<()>;

    async fn insert_entry(&mut self, entry: &Entry) -> Result<()>;

    async fn entries_for_account(&mut self, name: &str) -> Result<Vec<Entry>>;

    /// Sum of every account balance, hold account included
    async fn total_balance(&mut self) -> Result<Decimal>;

    // === Transfers ===

    async fn get_transfer(&mut self, id: Uuid) -> Result<Option<Transfer>>;

    /// Read a transfer and hold its row until commit
    async fn lock_transfer(&mut self, id: Uuid) -> Result<Option<Transfer>>;

    /// Insert or replace a transfer. Returns whether it already existed.
    async fn upsert_transfer(&mut self, transfer: &Transfer) -> Result<bool>;

    /// `(id, expires_at)` of every non-finalized transfer with a deadline
    async fn expiring_transfers(&mut self) -> Result<Vec<(Uuid, DateTime<Utc>)>>;

    async fn get_fulfillment(&mut self, transfer_id: Uuid) -> Result<Option<FulfillmentRecord>>;

    /// Store a fulfillment unless the transfer already has one.
    /// Returns whether it was inserted.
    async fn insert_fulfillment(&mut self, record: &FulfillmentRecord) -> Result<bool>;

    // === Subscriptions ===

    /// Includes tombstoned subscriptions
    async fn get_subscription(&mut self, id: Uuid) -> Result<Option<Subscription>>;

    async fn upsert_subscription(&mut self, subscription: &Subscription) -> Result<bool>;

    /// Live subscriptions whose subject is one of `subjects`
    async fn subscriptions_for_subjects(&mut self, subjects: &[String])
    -> Result<Vec<Subscription>>;

    // === Notifications ===

    /// Insert-or-update keyed by `(subscription_id, transfer_id)`.
    ///
    /// An existing row keeps its id and becomes due immediately.
    /// Returns whether a row for the pair already existed.
    async fn upsert_notification(&mut self, notification: &Notification) -> Result<bool>;

    /// Due notifications, oldest retry first
    async fn due_notifications(
        &mut self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Notification>>;

    async fn reschedule_notification(
        &mut self,
        id: Uuid,
        retry_count: i32,
        retry_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn delete_notification(&mut self, id: Uuid) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Transaction factory
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>>;
}
