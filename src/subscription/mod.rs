//! Subscriptions
//!
//! Standing interest of an account in events about a subject account (or
//! every account), delivered by the notification dispatcher.

pub mod models;
pub mod service;

pub use models::{ANY_SUBJECT, Subscription, TRANSFER_UPDATE, event_matches};
pub use service::SubscriptionService;
