//! Ledger accounts
//!
//! Account model, name canonicalization and admin operations. Balances are
//! only ever moved by the escrow engine; see [`crate::escrow`].

pub mod models;
pub mod service;
pub mod validation;

// Re-export commonly used types
pub use models::{Account, Actor, Entry};
pub use service::AccountService;
pub use validation::{AccountName, ValidationError, canonical};
