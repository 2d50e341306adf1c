//! Escrow Ledger - conditional transfers with escrow
//!
//! Accounts move funds through transfers that are proposed, escrowed in a
//! hold account once every debit is authorized, and then executed or
//! rejected by a cryptographic condition fulfillment or by expiry.
//!
//! # Modules
//!
//! - [`condition`] - Crypto-condition verifier (preimage, ed25519, threshold)
//! - [`escrow`] - Balance/hold engine
//! - [`transfer`] - Transfer state machine
//! - [`expiry`] - Deadline queue and timer worker
//! - [`notify`] - Durable subscriber notifications
//! - [`push`] - Best-effort live event feed
//! - [`account`] / [`subscription`] - Admin and subscription management
//! - [`store`] - Transactional storage (PostgreSQL, in-memory)

// Domain
pub mod account;
pub mod condition;
pub mod error;
pub mod escrow;
pub mod subscription;
pub mod transfer;

// Background services
pub mod expiry;
pub mod notify;
pub mod push;

// Infrastructure
pub mod config;
pub mod logging;
pub mod store;

// Convenient re-exports at crate root
pub use account::{Account, AccountService, Actor, Entry};
pub use condition::{Condition, ConditionType, Fulfillment, verify};
pub use error::{FieldChange, LedgerError, Result};
pub use escrow::EscrowLedger;
pub use expiry::{ExpiryScheduler, ExpiryWorker};
pub use notify::{HttpTransport, NotificationDispatcher, NotifierTransport};
pub use push::{PushQueue, PushRelay, TransferEvent};
pub use store::{LedgerStore, LedgerTx, MemoryStore, PgStore};
pub use subscription::{Subscription, SubscriptionService};
pub use transfer::{
    Credit, Debit, RejectionReason, Transfer, TransferCoordinator, TransferState,
    TransferSubmission,
};
