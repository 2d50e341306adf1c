//! Data models for ledger accounts

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ledger account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Canonical lowercase name (primary identity)
    pub name: String,
    pub balance: Decimal,
    /// Lowest balance a debit may leave behind. `None` is negative infinity.
    pub minimum_allowed_balance: Option<Decimal>,
    #[serde(default)]
    pub is_disabled: bool,
    #[serde(default)]
    pub is_admin: bool,
    /// Base64 Ed25519 public key, used by the request layer for authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connector: Option<String>,
}

impl Account {
    /// New enabled account with a zero balance and a zero floor
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            balance: Decimal::ZERO,
            minimum_allowed_balance: Some(Decimal::ZERO),
            is_disabled: false,
            is_admin: false,
            public_key: None,
            connector: None,
        }
    }

    /// The system escrow account: no floor, never disabled
    pub fn hold(name: impl Into<String>) -> Self {
        Self {
            minimum_allowed_balance: None,
            ..Self::new(name)
        }
    }

    pub fn with_balance(mut self, balance: Decimal) -> Self {
        self.balance = balance;
        self
    }

    pub fn with_floor(mut self, floor: Option<Decimal>) -> Self {
        self.minimum_allowed_balance = floor;
        self
    }

    /// Would a balance of `new_balance` respect this account's floor?
    #[inline]
    pub fn floor_allows(&self, new_balance: Decimal) -> bool {
        match self.minimum_allowed_balance {
            Some(floor) => new_balance >= floor,
            None => true,
        }
    }
}

/// The already-authenticated caller of a core operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub name: String,
    pub is_admin: bool,
}

impl Actor {
    pub fn user(name: impl Into<String>) -> Self {
        Self {
            name: super::validation::canonical(&name.into()),
            is_admin: false,
        }
    }

    pub fn admin(name: impl Into<String>) -> Self {
        Self {
            name: super::validation::canonical(&name.into()),
            is_admin: true,
        }
    }

    pub fn from_account(account: &Account) -> Self {
        Self {
            name: account.name.clone(),
            is_admin: account.is_admin,
        }
    }

    /// May this caller act on behalf of `account`?
    #[inline]
    pub fn can_act_for(&self, account: &str) -> bool {
        self.is_admin || self.name == account
    }
}

/// Audit record of one balance change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: Uuid,
    /// `None` for administrative seeding
    pub transfer_id: Option<Uuid>,
    pub account: String,
    pub delta: Decimal,
    pub balance_after: Decimal,
    pub created_at: DateTime<Utc>,
}

impl Entry {
    pub fn new(
        transfer_id: Option<Uuid>,
        account: impl Into<String>,
        delta: Decimal,
        balance_after: Decimal,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            transfer_id,
            account: account.into(),
            delta,
            balance_after,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn test_floor_allows() {
        let account = Account::new("alice").with_balance(dec("100"));
        assert!(account.floor_allows(dec("0")));
        assert!(!account.floor_allows(dec("-0.01")));

        let credit_line = Account::new("bob").with_floor(Some(dec("-50")));
        assert!(credit_line.floor_allows(dec("-50")));
        assert!(!credit_line.floor_allows(dec("-50.0001")));

        let hold = Account::hold("hold");
        assert!(hold.floor_allows(dec("-1000000000")));
    }

    #[test]
    fn test_actor_permissions() {
        let alice = Actor::user("Alice");
        assert_eq!(alice.name, "alice");
        assert!(alice.can_act_for("alice"));
        assert!(!alice.can_act_for("bob"));
        assert!(Actor::admin("admin").can_act_for("bob"));
    }

    #[test]
    fn test_serde_decimal_as_string() {
        let account = Account::new("alice").with_balance(dec("10.50"));
        let json = serde_json::to_value(&account).unwrap();
        assert_eq!(json["balance"], "10.50");
        assert_eq!(json["minimum_allowed_balance"], "0");
        assert!(json.get("connector").is_none());
    }
}
