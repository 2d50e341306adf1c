//! Expiry Scheduler
//!
//! - [`queue`]: in-memory min-queue of transfer deadlines
//! - [`scheduler`]: shared owner of the queue, rebuilt from storage at startup
//! - [`worker`]: timer task that expires due transfers

pub mod queue;
pub mod scheduler;
pub mod worker;

pub use queue::{InsertListener, TimeQueue};
pub use scheduler::{DEFAULT_MAX_TIMEOUT, ExpiryScheduler};
pub use worker::{ExpiryConfig, ExpiryWorker};
