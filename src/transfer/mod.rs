//! Transfer State Machine
//!
//! Conditional transfers between ledger accounts, escrowed in a system-owned
//! hold account until their outcome is decided.
//!
//! # State Machine
//!
//! ```text
//! PROPOSED → PREPARED → EXECUTED
//!     ↓          ↓
//!  REJECTED ← ───┘
//! ```
//!
//! # Safety Invariants
//!
//! 1. **One transaction per operation**: balances, state and notifications
//!    commit together or not at all
//! 2. **Monotonic state**: finalized transfers never change again
//! 3. **Exactly one condition**: a fulfillment executes or cancels, never both
//! 4. **Idempotent replay**: resubmitting an applied change returns the stored
//!    result without re-applying escrow

pub mod coordinator;
pub mod diff;
pub mod state;
pub mod types;


// Re-exports for convenience
pub use coordinator::TransferCoordinator;
pub use diff::json_diff;
pub use state::{RejectionReason, TransferState};
pub use types::{
    ConditionRole, Credit, Debit, FulfillOutcome, FulfillmentRecord, SubmitOutcome, Timeline,
    Transfer, TransferSubmission,
};
