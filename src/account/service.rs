//! Account administration
//!
//! Accounts are created and updated by admins only. Creation is the one
//! place a balance is written outside a transfer; it is recorded as an
//! audit entry without a transfer id.

use std::sync::Arc;
use tracing::{debug, info};

use super::models::{Account, Actor, Entry};
use super::validation::AccountName;
use crate::error::{LedgerError, Result};
use crate::store::LedgerStore;

pub struct AccountService {
    store: Arc<dyn LedgerStore>,
    hold_account: String,
}

impl AccountService {
    pub fn new(store: Arc<dyn LedgerStore>, hold_account: impl Into<String>) -> Self {
        Self {
            store,
            hold_account: hold_account.into(),
        }
    }

    /// Create or update an account.
    ///
    /// Returns the stored account and whether it already existed. The balance
    /// of an existing account is never changed here.
    pub async fn put_account(&self, account: Account, actor: &Actor) -> Result<(Account, bool)> {
        if !actor.is_admin {
            return Err(LedgerError::Unauthorized(format!(
                "{} may not manage accounts",
                actor.name
            )));
        }

        let name = AccountName::new(&account.name)
            .map_err(|e| LedgerError::UnprocessableEntity(e.to_string()))?
            .into_inner();
        if name == self.hold_account {
            return Err(LedgerError::UnprocessableEntity(format!(
                "Account {} is reserved",
                name
            )));
        }
        let account = Account { name, ..account };

        let mut tx = self.store.begin().await?;
        let existing = tx.lock_account(&account.name).await?;
        let existed = existing.is_some();

        let stored = match existing {
            Some(existing) => {
                if existing.balance != account.balance {
                    debug!(account = %account.name, "Ignoring balance on account update");
                }
                let updated = Account {
                    balance: existing.balance,
                    ..account
                };
                tx.upsert_account(&updated).await?;
                updated
            }
            None => {
                if !account.floor_allows(account.balance) {
                    return Err(LedgerError::UnprocessableEntity(format!(
                        "Initial balance of {} is below its minimum allowed balance",
                        account.name
                    )));
                }
                tx.upsert_account(&account).await?;
                if !account.balance.is_zero() {
                    tx.insert_entry(&Entry::new(
                        None,
                        &account.name,
                        account.balance,
                        account.balance,
                    ))
                    .await?;
                }
                account
            }
        };
        tx.commit().await?;

        info!(account = %stored.name, admin = %actor.name, existed, "Account saved");
        Ok((stored, existed))
    }

    pub async fn get_account(&self, name: &str) -> Result<Account> {
        let name = AccountName::new(name)
            .map_err(|e| LedgerError::NotFound(e.to_string()))?;
        let mut tx = self.store.begin().await?;
        tx.get_account(name.as_str())
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("Account {} not found", name)))
    }

    /// Audit trail of one account, oldest first
    pub async fn get_entries(&self, name: &str) -> Result<Vec<Entry>> {
        let account = self.get_account(name).await?;
        let mut tx = self.store.begin().await?;
        tx.entries_for_account(&account.name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use rust_decimal::Decimal;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn service() -> AccountService {
        AccountService::new(Arc::new(MemoryStore::new()), "hold")
    }

    #[tokio::test]
    async fn test_create_seeds_balance_with_entry() {
        let service = service();
        let admin = Actor::admin("admin");

        let (account, existed) = service
            .put_account(Account::new("Alice").with_balance(dec("100")), &admin)
            .await
            .unwrap();
        assert!(!existed);
        assert_eq!(account.name, "alice");

        let entries = service.get_entries("ALICE").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].delta, dec("100"));
        assert!(entries[0].transfer_id.is_none());
    }

    #[tokio::test]
    async fn test_update_keeps_balance() {
        let service = service();
        let admin = Actor::admin("admin");
        service
            .put_account(Account::new("alice").with_balance(dec("100")), &admin)
            .await
            .unwrap();

        let update = Account {
            is_disabled: true,
            ..Account::new("alice").with_balance(dec("999"))
        };
        let (account, existed) = service.put_account(update, &admin).await.unwrap();
        assert!(existed);
        assert!(account.is_disabled);
        assert_eq!(account.balance, dec("100"));
        assert_eq!(service.get_entries("alice").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_admin_only() {
        let service = service();
        let err = service
            .put_account(Account::new("alice"), &Actor::user("alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_rejects_bad_accounts() {
        let service = service();
        let admin = Actor::admin("admin");

        for account in [
            Account::new("bad name!"),
            Account::new("hold"),
            Account::new("alice").with_balance(dec("-5")),
        ] {
            let err = service.put_account(account, &admin).await.unwrap_err();
            assert!(matches!(err, LedgerError::UnprocessableEntity(_)));
        }

        let (credit_line, _) = service
            .put_account(
                Account::new("credit_line")
                    .with_balance(dec("-5"))
                    .with_floor(Some(dec("-10"))),
                &admin,
            )
            .await
            .unwrap();
        assert_eq!(credit_line.balance, dec("-5"));
    }

    #[tokio::test]
    async fn test_get_missing_account() {
        let err = service().get_account("nobody").await.unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)));
    }
}
