//! Escrow Ledger
//!
//! Balance/hold engine. Every operation runs inside a caller-supplied
//! transaction and either applies to all accounts it touches or (on error)
//! to none of them, because the caller drops the transaction.
//!
//! # Conservation
//!
//! Funds only ever move between user accounts and the hold account, so
//! `sum(user balances) + hold.balance` is constant across all operations.

use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::account::{Account, Entry};
use crate::error::{LedgerError, Result};
use crate::store::LedgerTx;
use crate::transfer::Transfer;

/// Per-account sum of a transfer's debit or credit amounts
#[derive(Debug, Clone, PartialEq)]
pub struct AccountTotal {
    /// Snapshot of the account as locked by [`EscrowLedger::compute_totals`]
    pub account: Account,
    pub total: Decimal,
}

/// Balance/hold engine bound to one hold account
#[derive(Debug, Clone)]
pub struct EscrowLedger {
    hold_account: String,
}

impl EscrowLedger {
    pub fn new(hold_account: impl Into<String>) -> Self {
        Self {
            hold_account: hold_account.into(),
        }
    }

    pub fn hold_account(&self) -> &str {
        &self.hold_account
    }

    /// Group `(account, amount)` pairs by account, sum exactly and lock each
    /// referenced account.
    ///
    /// Accounts are locked in name order so that two transactions touching the
    /// same accounts always acquire row locks in the same order.
    pub async fn compute_totals<'a, I>(
        &self,
        tx: &mut dyn LedgerTx,
        entries: I,
    ) -> Result<Vec<AccountTotal>>
    where
        I: IntoIterator<Item = (&'a str, Decimal)>,
    {
        let mut sums: BTreeMap<&str, Decimal> = BTreeMap::new();
        for (account, amount) in entries {
            let sum = sums.entry(account).or_insert(Decimal::ZERO);
            *sum = sum
                .checked_add(amount)
                .ok_or_else(|| LedgerError::UnprocessableEntity("Amount overflow".to_string()))?;
        }

        let mut totals = Vec::with_capacity(sums.len());
        for (name, total) in sums {
            if name == self.hold_account {
                return Err(LedgerError::UnprocessableEntity(format!(
                    "Account {} cannot be used in transfers",
                    name
                )));
            }
            let account = tx.lock_account(name).await?.ok_or_else(|| {
                LedgerError::UnprocessableEntity(format!("Account {} does not exist", name))
            })?;
            totals.push(AccountTotal { account, total });
        }
        Ok(totals)
    }

    pub async fn debit_totals(
        &self,
        tx: &mut dyn LedgerTx,
        transfer: &Transfer,
    ) -> Result<Vec<AccountTotal>> {
        self.compute_totals(
            tx,
            transfer
                .debits
                .iter()
                .map(|d| (d.account.as_str(), d.amount)),
        )
        .await
    }

    pub async fn credit_totals(
        &self,
        tx: &mut dyn LedgerTx,
        transfer: &Transfer,
    ) -> Result<Vec<AccountTotal>> {
        self.compute_totals(
            tx,
            transfer
                .credits
                .iter()
                .map(|c| (c.account.as_str(), c.amount)),
        )
        .await
    }

    /// Move each debit total from its account into the hold account
    ///
    /// # Errors
    /// - `InsufficientFunds` if any account would drop below its floor
    /// - `UnprocessableEntity` if any debited account is disabled
    pub async fn apply_debits(
        &self,
        tx: &mut dyn LedgerTx,
        transfer_id: Uuid,
        totals: &[AccountTotal],
    ) -> Result<()> {
        // Check everything before writing anything
        for AccountTotal { account, total } in totals {
            if account.is_disabled {
                return Err(LedgerError::UnprocessableEntity(format!(
                    "Account {} is disabled",
                    account.name
                )));
            }
            if !account.floor_allows(account.balance - *total) {
                return Err(LedgerError::InsufficientFunds {
                    account: account.name.clone(),
                });
            }
        }

        let mut held = Decimal::ZERO;
        for AccountTotal { account, total } in totals {
            self.adjust(tx, transfer_id, &account.name, account.balance, -*total)
                .await?;
            held += *total;
        }
        self.adjust_hold(tx, transfer_id, held).await?;

        debug!(transfer_id = %transfer_id, amount = %held, "Debits escrowed");
        Ok(())
    }

    /// Pay each credit total out of the hold account
    ///
    /// Disabled accounts still receive credits of in-flight transfers.
    pub async fn apply_credits(
        &self,
        tx: &mut dyn LedgerTx,
        transfer_id: Uuid,
        totals: &[AccountTotal],
    ) -> Result<()> {
        let mut released = Decimal::ZERO;
        for AccountTotal { account, total } in totals {
            self.adjust(tx, transfer_id, &account.name, account.balance, *total)
                .await?;
            released += *total;
        }
        self.adjust_hold(tx, transfer_id, -released).await?;

        debug!(transfer_id = %transfer_id, amount = %released, "Credits released from hold");
        Ok(())
    }

    /// Return held funds to the accounts they were debited from
    pub async fn revert_debits(
        &self,
        tx: &mut dyn LedgerTx,
        transfer_id: Uuid,
        totals: &[AccountTotal],
    ) -> Result<()> {
        let mut returned = Decimal::ZERO;
        for AccountTotal { account, total } in totals {
            self.adjust(tx, transfer_id, &account.name, account.balance, *total)
                .await?;
            returned += *total;
        }
        self.adjust_hold(tx, transfer_id, -returned).await?;

        debug!(transfer_id = %transfer_id, amount = %returned, "Escrow returned to debitors");
        Ok(())
    }

    /// Lock the hold account, creating it on first use.
    ///
    /// Creation never overwrites a row a concurrent transaction inserted
    /// first; the lock then waits for it and reads its committed balance.
    pub async fn lock_hold(&self, tx: &mut dyn LedgerTx) -> Result<Account> {
        if let Some(hold) = tx.lock_account(&self.hold_account).await? {
            return Ok(hold);
        }
        if tx
            .ensure_account(&Account::hold(self.hold_account.clone()))
            .await?
        {
            info!(account = %self.hold_account, "Hold account created");
        }
        tx.lock_account(&self.hold_account).await?.ok_or_else(|| {
            LedgerError::Internal(format!("Hold account {} missing", self.hold_account))
        })
    }

    async fn adjust_hold(
        &self,
        tx: &mut dyn LedgerTx,
        transfer_id: Uuid,
        delta: Decimal,
    ) -> Result<()> {
        let hold = self.lock_hold(tx).await?;
        self.adjust(tx, transfer_id, &hold.name, hold.balance, delta)
            .await
    }

    async fn adjust(
        &self,
        tx: &mut dyn LedgerTx,
        transfer_id: Uuid,
        account: &str,
        balance: Decimal,
        delta: Decimal,
    ) -> Result<()> {
        let balance_after = balance
            .checked_add(delta)
            .ok_or_else(|| LedgerError::UnprocessableEntity("Balance overflow".to_string()))?;
        tx.set_balance(account, balance_after).await?;
        tx.insert_entry(&Entry::new(Some(transfer_id), account, delta, balance_after))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LedgerStore, MemoryStore};
    use crate::transfer::{Credit, Debit, TransferSubmission};

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    async fn seeded_store() -> MemoryStore {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.upsert_account(&Account::new("alice").with_balance(dec("100")))
            .await
            .unwrap();
        tx.upsert_account(&Account::new("bob").with_balance(dec("20")))
            .await
            .unwrap();
        tx.upsert_account(
            &Account::new("credit_line")
                .with_balance(dec("0"))
                .with_floor(Some(dec("-50"))),
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
        store
    }

    async fn balance(store: &MemoryStore, name: &str) -> Decimal {
        let mut tx = store.begin().await.unwrap();
        tx.get_account(name).await.unwrap().unwrap().balance
    }

    async fn total(store: &MemoryStore) -> Decimal {
        let mut tx = store.begin().await.unwrap();
        tx.total_balance().await.unwrap()
    }

    #[tokio::test]
    async fn test_compute_totals_groups_and_sums_exactly() {
        let store = seeded_store().await;
        let escrow = EscrowLedger::new("hold");
        let mut tx = store.begin().await.unwrap();

        let totals = escrow
            .compute_totals(
                tx.as_mut(),
                [
                    ("bob", dec("0.1")),
                    ("alice", dec("0.1")),
                    ("alice", dec("0.2")),
                ],
            )
            .await
            .unwrap();

        assert_eq!(totals.len(), 2);
        assert_eq!(totals[0].account.name, "alice");
        assert_eq!(totals[0].total, dec("0.3"));
        assert_eq!(totals[1].account.name, "bob");
    }

    #[tokio::test]
    async fn test_compute_totals_missing_account() {
        let store = seeded_store().await;
        let escrow = EscrowLedger::new("hold");
        let mut tx = store.begin().await.unwrap();

        let err = escrow
            .compute_totals(tx.as_mut(), [("mallory", dec("1"))])
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::UnprocessableEntity(_)));
    }

    #[tokio::test]
    async fn test_debit_then_credit_conserves_total() {
        let store = seeded_store().await;
        let escrow = EscrowLedger::new("hold");
        let before = total(&store).await;

        let transfer = TransferSubmission::new(
            Uuid::new_v4(),
            vec![Debit::new("alice", dec("50"))],
            vec![Credit::new("bob", dec("50"))],
        )
        .into_transfer("local");

        let mut tx = store.begin().await.unwrap();
        let debits = escrow.debit_totals(tx.as_mut(), &transfer).await.unwrap();
        escrow
            .apply_debits(tx.as_mut(), transfer.id, &debits)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(balance(&store, "alice").await, dec("50"));
        assert_eq!(balance(&store, "hold").await, dec("50"));
        assert_eq!(total(&store).await, before);

        let mut tx = store.begin().await.unwrap();
        let credits = escrow.credit_totals(tx.as_mut(), &transfer).await.unwrap();
        escrow
            .apply_credits(tx.as_mut(), transfer.id, &credits)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(balance(&store, "bob").await, dec("70"));
        assert_eq!(balance(&store, "hold").await, dec("0"));
        assert_eq!(total(&store).await, before);

        let mut tx = store.begin().await.unwrap();
        let entries = tx.entries_for_account("alice").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].delta, dec("-50"));
        assert_eq!(entries[0].transfer_id, Some(transfer.id));
    }

    #[tokio::test]
    async fn test_revert_returns_escrow() {
        let store = seeded_store().await;
        let escrow = EscrowLedger::new("hold");

        let mut tx = store.begin().await.unwrap();
        let totals = escrow
            .compute_totals(tx.as_mut(), [("alice", dec("30"))])
            .await
            .unwrap();
        escrow
            .apply_debits(tx.as_mut(), Uuid::nil(), &totals)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let totals = escrow
            .compute_totals(tx.as_mut(), [("alice", dec("30"))])
            .await
            .unwrap();
        escrow
            .revert_debits(tx.as_mut(), Uuid::nil(), &totals)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(balance(&store, "alice").await, dec("100"));
        assert_eq!(balance(&store, "hold").await, dec("0"));
    }

    #[tokio::test]
    async fn test_floor_violation_names_account_and_changes_nothing() {
        let store = seeded_store().await;
        let escrow = EscrowLedger::new("hold");

        let mut tx = store.begin().await.unwrap();
        let totals = escrow
            .compute_totals(tx.as_mut(), [("bob", dec("5")), ("alice", dec("101"))])
            .await
            .unwrap();
        let err = escrow
            .apply_debits(tx.as_mut(), Uuid::nil(), &totals)
            .await
            .unwrap_err();
        drop(tx);

        match err {
            LedgerError::InsufficientFunds { account } => assert_eq!(account, "alice"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(balance(&store, "alice").await, dec("100"));
        assert_eq!(balance(&store, "bob").await, dec("20"));
    }

    #[tokio::test]
    async fn test_negative_floor_allows_credit_line() {
        let store = seeded_store().await;
        let escrow = EscrowLedger::new("hold");

        let mut tx = store.begin().await.unwrap();
        let ok = escrow
            .compute_totals(tx.as_mut(), [("credit_line", dec("50"))])
            .await
            .unwrap();
        escrow.apply_debits(tx.as_mut(), Uuid::nil(), &ok).await.unwrap();

        let too_much = escrow
            .compute_totals(tx.as_mut(), [("credit_line", dec("0.01"))])
            .await
            .unwrap();
        assert!(matches!(
            escrow
                .apply_debits(tx.as_mut(), Uuid::nil(), &too_much)
                .await,
            Err(LedgerError::InsufficientFunds { .. })
        ));
    }

    #[tokio::test]
    async fn test_disabled_account_cannot_be_debited() {
        let store = seeded_store().await;
        let escrow = EscrowLedger::new("hold");

        let mut tx = store.begin().await.unwrap();
        let mut bob = tx.get_account("bob").await.unwrap().unwrap();
        bob.is_disabled = true;
        tx.upsert_account(&bob).await.unwrap();

        let totals = escrow
            .compute_totals(tx.as_mut(), [("bob", dec("1"))])
            .await
            .unwrap();
        assert!(matches!(
            escrow.apply_debits(tx.as_mut(), Uuid::nil(), &totals).await,
            Err(LedgerError::UnprocessableEntity(_))
        ));
        // credits to a disabled account still land
        escrow
            .apply_credits(tx.as_mut(), Uuid::nil(), &totals)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_hold_account_not_usable_in_transfers() {
        let store = seeded_store().await;
        let escrow = EscrowLedger::new("hold");
        let mut tx = store.begin().await.unwrap();
        escrow.lock_hold(tx.as_mut()).await.unwrap();

        assert!(matches!(
            escrow.compute_totals(tx.as_mut(), [("hold", dec("1"))]).await,
            Err(LedgerError::UnprocessableEntity(_))
        ));
    }

    #[tokio::test]
    async fn test_lock_hold_reads_existing_balance() {
        let store = seeded_store().await;
        let escrow = EscrowLedger::new("hold");

        let mut tx = store.begin().await.unwrap();
        let created = escrow.lock_hold(tx.as_mut()).await.unwrap();
        assert_eq!(created.balance, Decimal::ZERO);
        assert_eq!(created.minimum_allowed_balance, None);
        tx.set_balance("hold", dec("50")).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let hold = escrow.lock_hold(tx.as_mut()).await.unwrap();
        assert_eq!(hold.balance, dec("50"));
    }
}
