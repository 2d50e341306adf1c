//! Transfer FSM State Definitions
//!
//! State IDs are stored in PostgreSQL as SMALLINT.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Transfer FSM States
///
/// ```text
/// PROPOSED → PREPARED → EXECUTED
///     ↓          ↓
///  REJECTED   REJECTED
/// ```
///
/// Terminal states: EXECUTED (30), REJECTED (-10)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i16)]
pub enum TransferState {
    /// Created; waiting for every debit to be authorized. No funds held.
    Proposed = 0,

    /// Debits escrowed in the hold account; waiting for a fulfillment
    Prepared = 10,

    /// Terminal: credits applied from the hold account
    Executed = 30,

    /// Terminal: cancelled or expired; any escrow returned
    Rejected = -10,
}

impl TransferState {
    /// Check if this is a terminal state (no more transitions possible)
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Executed | TransferState::Rejected)
    }

    /// Check if funds are currently held in escrow
    #[inline]
    pub fn holds_funds(&self) -> bool {
        matches!(self, TransferState::Prepared)
    }

    /// Is `next` a declared transition out of this state?
    pub fn can_transition_to(&self, next: TransferState) -> bool {
        matches!(
            (self, next),
            (TransferState::Proposed, TransferState::Prepared)
                | (TransferState::Proposed, TransferState::Rejected)
                | (TransferState::Prepared, TransferState::Executed)
                | (TransferState::Prepared, TransferState::Rejected)
        )
    }

    /// Get the numeric state ID for PostgreSQL storage
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    /// Convert from PostgreSQL state ID
    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(TransferState::Proposed),
            10 => Some(TransferState::Prepared),
            30 => Some(TransferState::Executed),
            -10 => Some(TransferState::Rejected),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferState::Proposed => "proposed",
            TransferState::Prepared => "prepared",
            TransferState::Executed => "executed",
            TransferState::Rejected => "rejected",
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransferState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "proposed" => Ok(TransferState::Proposed),
            "prepared" => Ok(TransferState::Prepared),
            "executed" => Ok(TransferState::Executed),
            "rejected" => Ok(TransferState::Rejected),
            other => Err(format!("unknown transfer state: {}", other)),
        }
    }
}

impl TryFrom<i16> for TransferState {
    type Error = ();

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        TransferState::from_id(value).ok_or(())
    }
}

/// Why a transfer ended up rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RejectionReason {
    Expired,
    Cancelled,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::Expired => "expired",
            RejectionReason::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RejectionReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "expired" => Ok(RejectionReason::Expired),
            "cancelled" => Ok(RejectionReason::Cancelled),
            other => Err(format!("unknown rejection reason: {}", other)),
        }
    }
}
