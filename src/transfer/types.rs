//! Transfer Core Types

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use super::state::{RejectionReason, TransferState};
use crate::account::validation::canonical;
use crate::condition::{Condition, Fulfillment};

/// Funds leaving an account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Debit {
    pub account: String,
    pub amount: Decimal,
    #[serde(default)]
    pub authorized: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<serde_json::Value>,
}

impl Debit {
    pub fn new(account: &str, amount: Decimal) -> Self {
        Self {
            account: canonical(account),
            amount,
            authorized: false,
            memo: None,
        }
    }

    pub fn authorized(mut self) -> Self {
        self.authorized = true;
        self
    }
}

/// Funds arriving in an account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credit {
    pub account: String,
    pub amount: Decimal,
    #[serde(default)]
    pub rejected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<serde_json::Value>,
}

impl Credit {
    pub fn new(account: &str, amount: Decimal) -> Self {
        Self {
            account: canonical(account),
            amount,
            rejected: false,
            rejection_message: None,
            memo: None,
        }
    }
}

/// State-entry timestamps
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prepared_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_at: Option<DateTime<Utc>>,
}

impl Timeline {
    pub fn stamp(&mut self, state: TransferState, at: DateTime<Utc>) {
        let slot = match state {
            TransferState::Proposed => &mut self.proposed_at,
            TransferState::Prepared => &mut self.prepared_at,
            TransferState::Executed => &mut self.executed_at,
            TransferState::Rejected => &mut self.rejected_at,
        };
        *slot = Some(at);
    }
}

/// Persisted transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: Uuid,
    pub ledger: String,
    pub debits: Vec<Debit>,
    pub credits: Vec<Credit>,
    pub state: TransferState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<RejectionReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_condition: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancellation_condition: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timeline: Timeline,
}

impl Transfer {
    /// Every account named by a debit or credit, deduplicated
    pub fn accounts(&self) -> BTreeSet<String> {
        self.debits
            .iter()
            .map(|d| d.account.clone())
            .chain(self.credits.iter().map(|c| c.account.clone()))
            .collect()
    }

    #[inline]
    pub fn is_fully_authorized(&self) -> bool {
        self.debits.iter().all(|d| d.authorized)
    }

    #[inline]
    pub fn all_credits_rejected(&self) -> bool {
        !self.credits.is_empty() && self.credits.iter().all(|c| c.rejected)
    }

    #[inline]
    pub fn is_finalized(&self) -> bool {
        self.state.is_terminal()
    }

    /// Move to `next` and stamp the timeline
    ///
    /// Callers check [`TransferState::can_transition_to`] first.
    pub(crate) fn enter(&mut self, next: TransferState, at: DateTime<Utc>) {
        debug_assert!(self.state.can_transition_to(next) || self.state == next);
        self.state = next;
        self.timeline.stamp(next, at);
    }
}

/// A transfer as submitted by a client (create or update)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferSubmission {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger: Option<String>,
    pub debits: Vec<Debit>,
    pub credits: Vec<Credit>,
    /// Clients may echo the state back; it must match the stored state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<TransferState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_condition: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancellation_condition: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl TransferSubmission {
    pub fn new(id: Uuid, debits: Vec<Debit>, credits: Vec<Credit>) -> Self {
        Self {
            id,
            ledger: None,
            debits,
            credits,
            state: None,
            execution_condition: None,
            cancellation_condition: None,
            expires_at: None,
        }
    }

    pub fn with_execution_condition(mut self, condition: Condition) -> Self {
        self.execution_condition = Some(condition);
        self
    }

    pub fn with_cancellation_condition(mut self, condition: Condition) -> Self {
        self.cancellation_condition = Some(condition);
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Lowercase every account reference and strip trailing zeros from
    /// amounts, so `"10.00"` and `"10"` compare equal on resubmission
    pub fn canonicalize(&mut self) {
        for debit in &mut self.debits {
            debit.account = canonical(&debit.account);
            debit.amount = debit.amount.normalize();
        }
        for credit in &mut self.credits {
            credit.account = canonical(&credit.account);
            credit.amount = credit.amount.normalize();
        }
    }

    /// Build the stored form of a brand new transfer
    pub(crate) fn into_transfer(self, ledger: &str) -> Transfer {
        Transfer {
            id: self.id,
            ledger: self.ledger.unwrap_or_else(|| ledger.to_string()),
            debits: self.debits,
            credits: self.credits,
            state: TransferState::Proposed,
            rejection_reason: None,
            execution_condition: self.execution_condition,
            cancellation_condition: self.cancellation_condition,
            expires_at: self.expires_at,
            timeline: Timeline::default(),
        }
    }
}

/// Result of `submit`: the persisted transfer and whether it already existed
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitOutcome {
    pub transfer: Transfer,
    pub existed: bool,
}

/// Which of the two conditions a fulfillment satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionRole {
    Execution,
    Cancellation,
}

impl ConditionRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionRole::Execution => "execution",
            ConditionRole::Cancellation => "cancellation",
        }
    }
}

impl fmt::Display for ConditionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stored fulfillment (at most one per transfer)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FulfillmentRecord {
    pub transfer_id: Uuid,
    pub role: ConditionRole,
    pub fulfillment: Fulfillment,
    pub created_at: DateTime<Utc>,
}

/// Result of `fulfill`
#[derive(Debug, Clone, PartialEq)]
pub struct FulfillOutcome {
    pub transfer: Transfer,
    pub fulfillment: FulfillmentRecord,
    /// True when this exact fulfillment had already been applied
    pub existed: bool,
}
