//! Notification Dispatcher
//!
//! Durable delivery of transfer updates to subscribers:
//! - [`outbox`]: transactional enqueue, one row per (subscription, transfer)
//! - [`dispatcher`]: background loop that POSTs rows and retries failures
//! - [`transport`]: the injected POST-JSON capability

pub mod dispatcher;
pub mod models;
pub mod outbox;
pub mod transport;

pub use dispatcher::{
    DeliveryOutcome, DispatchStats, DispatcherConfig, NotificationDispatcher, build_payload,
};
pub use models::Notification;
pub use outbox::enqueue_notifications;
pub use transport::{HttpTransport, NotifierTransport, TransportError};
