//! Condition Verifier
//!
//! Stateless predicate over the crypto-condition algebra: does a presented
//! fulfillment satisfy a condition? Supported types:
//!
//! - `preimage-sha-256`: SHA-256 hash lock
//! - `ed25519-sha-256`: signature by a committed public key
//! - `threshold-sha-256`: m-of-n composite (n-of-n is an AND)

pub mod fulfillment;
pub mod types;

pub use fulfillment::{Fulfillment, threshold_condition, verify};
pub use types::{Condition, ConditionError, ConditionType, MAX_COST};
