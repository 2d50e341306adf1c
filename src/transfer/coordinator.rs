//! Transfer Coordinator
//!
//! Drives the transfer state machine. Each public operation runs in exactly
//! one storage transaction covering balance changes, the state transition
//! and the notification enqueue; any error drops the transaction.
//!
//! ```text
//! proposed ──(all debits authorized)──▶ prepared ──(execution fulfilled)──▶ executed
//!     │                                   │
//!     └──(cancelled / expired)──▶ rejected ◀┘
//! ```
//!
//! Transfers without an execution condition go from `proposed` to `executed`
//! inside one transaction; escrow is still applied and released.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::diff::json_diff;
use super::state::{RejectionReason, TransferState};
use super::types::{
    ConditionRole, FulfillOutcome, FulfillmentRecord, SubmitOutcome, Transfer, TransferSubmission,
};
use crate::account::{AccountName, Actor, canonical};
use crate::condition::{Fulfillment, verify};
use crate::error::{FieldChange, LedgerError, Result};
use crate::escrow::EscrowLedger;
use crate::expiry::ExpiryScheduler;
use crate::notify::enqueue_notifications;
use crate::push::{PushQueue, TransferEvent};
use crate::store::{LedgerStore, LedgerTx};

/// Outcome of merging a resubmission into the stored transfer
enum Merge {
    Unchanged(Transfer),
    Changed(Transfer),
}

/// Transfer Coordinator - owns the state machine
pub struct TransferCoordinator {
    store: Arc<dyn LedgerStore>,
    escrow: EscrowLedger,
    ledger_uri: String,
    expiry: Arc<ExpiryScheduler>,
    push: Option<Arc<PushQueue>>,
    dispatch_wakeup: Option<Arc<Notify>>,
}

impl TransferCoordinator {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        escrow: EscrowLedger,
        ledger_uri: impl Into<String>,
        expiry: Arc<ExpiryScheduler>,
    ) -> Self {
        Self {
            store,
            escrow,
            ledger_uri: ledger_uri.into(),
            expiry,
            push: None,
            dispatch_wakeup: None,
        }
    }

    /// Publish every committed mutation to a live push queue
    pub fn with_push(mut self, push: Arc<PushQueue>) -> Self {
        self.push = Some(push);
        self
    }

    /// Wake the notification dispatcher after every commit
    pub fn with_dispatch_wakeup(mut self, wakeup: Arc<Notify>) -> Self {
        self.dispatch_wakeup = Some(wakeup);
        self
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn escrow(&self) -> &EscrowLedger {
        &self.escrow
    }

    pub fn ledger_uri(&self) -> &str {
        &self.ledger_uri
    }

    pub fn expiry(&self) -> &Arc<ExpiryScheduler> {
        &self.expiry
    }

    // ========================================================================
    // Submit
    // ========================================================================

    /// Create a transfer or update an existing one.
    ///
    /// On update only `debits[i].authorized` may change, and only from
    /// `false` to `true` by the debited account or an admin.
    pub async fn submit(
        &self,
        mut submission: TransferSubmission,
        actor: Option<&Actor>,
    ) -> Result<SubmitOutcome> {
        submission.canonicalize();
        validate_submission(&submission)?;

        let id = submission.id;
        if let Some(outcome) = self.try_submit(submission.clone(), actor).await? {
            return Ok(outcome);
        }
        // Lost a creation race; the retry sees the winner's row and merges against it
        debug!(transfer_id = %id, "Transfer created concurrently, retrying");
        self.try_submit(submission, actor).await?.ok_or_else(|| {
            LedgerError::AlreadyExists(format!("Transfer {} was created concurrently", id))
        })
    }

    /// One submit attempt in one transaction. `None` means another
    /// transaction created the same transfer after this one looked for it;
    /// nothing was committed.
    async fn try_submit(
        &self,
        submission: TransferSubmission,
        actor: Option<&Actor>,
    ) -> Result<Option<SubmitOutcome>> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;

        let (mut transfer, existed) = match tx.lock_transfer(submission.id).await? {
            None => (
                self.admit_new(tx.as_mut(), submission, actor, now).await?,
                false,
            ),
            Some(stored) => match merge(stored, submission, actor)? {
                Merge::Unchanged(stored) => {
                    debug!(transfer_id = %stored.id, "Resubmission without changes");
                    return Ok(Some(SubmitOutcome {
                        transfer: stored,
                        existed: true,
                    }));
                }
                Merge::Changed(updated) => {
                    if updated.expires_at.is_some_and(|at| at <= now) {
                        return Err(LedgerError::UnprocessableEntity(format!(
                            "Transfer {} has already expired",
                            updated.id
                        )));
                    }
                    (updated, true)
                }
            },
        };

        self.advance(tx.as_mut(), &mut transfer, now).await?;

        let replaced = tx.upsert_transfer(&transfer).await?;
        if replaced && !existed {
            return Ok(None);
        }
        enqueue_notifications(tx.as_mut(), &transfer).await?;
        tx.commit().await?;

        info!(
            transfer_id = %transfer.id,
            state = %transfer.state,
            existed,
            "Transfer submitted"
        );
        self.after_commit(&transfer);
        Ok(Some(SubmitOutcome { transfer, existed }))
    }

    async fn admit_new(
        &self,
        tx: &mut dyn LedgerTx,
        submission: TransferSubmission,
        actor: Option<&Actor>,
        now: DateTime<Utc>,
    ) -> Result<Transfer> {
        if let Some(ledger) = &submission.ledger
            && ledger != &self.ledger_uri
        {
            return Err(LedgerError::UnprocessableEntity(format!(
                "Transfer belongs to ledger {}, not {}",
                ledger, self.ledger_uri
            )));
        }

        if let Some(state) = submission.state
            && state != TransferState::Proposed
        {
            return Err(LedgerError::InvalidModification {
                message: format!("New transfers start proposed, not {}", state),
                diff: vec![FieldChange {
                    path: "state".to_string(),
                    before: Value::from(TransferState::Proposed.as_str()),
                    after: Value::from(state.as_str()),
                }],
            });
        }

        if submission.expires_at.is_some_and(|at| at <= now) {
            return Err(LedgerError::UnprocessableEntity(
                "Transfer expiry must be in the future".to_string(),
            ));
        }

        if submission.credits.iter().any(|c| c.rejected) {
            return Err(LedgerError::UnprocessableEntity(
                "Credits cannot be submitted as rejected".to_string(),
            ));
        }

        let accounts = submission
            .debits
            .iter()
            .map(|d| d.account.as_str())
            .chain(submission.credits.iter().map(|c| c.account.as_str()));
        for name in accounts {
            if name == self.escrow.hold_account() {
                return Err(LedgerError::UnprocessableEntity(format!(
                    "Account {} cannot be used in transfers",
                    name
                )));
            }
            let account = tx.get_account(name).await?.ok_or_else(|| {
                LedgerError::UnprocessableEntity(format!("Account {} does not exist", name))
            })?;
            if account.is_disabled {
                return Err(LedgerError::UnprocessableEntity(format!(
                    "Account {} is disabled",
                    name
                )));
            }
        }

        for debit in submission.debits.iter().filter(|d| d.authorized) {
            authorize_debit(actor, &debit.account)?;
        }

        let mut transfer = submission.into_transfer(&self.ledger_uri);
        transfer.timeline.stamp(TransferState::Proposed, now);
        Ok(transfer)
    }

    /// Escrow debits once fully authorized; execute right away when there is
    /// no execution condition
    async fn advance(
        &self,
        tx: &mut dyn LedgerTx,
        transfer: &mut Transfer,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if transfer.state != TransferState::Proposed || !transfer.is_fully_authorized() {
            return Ok(());
        }

        let debits = self.escrow.debit_totals(tx, transfer).await?;
        self.escrow.apply_debits(tx, transfer.id, &debits).await?;
        transfer.enter(TransferState::Prepared, now);
        debug!(transfer_id = %transfer.id, "Transfer prepared");

        if transfer.execution_condition.is_none() {
            // Credit totals re-read balances already touched by the debits
            let credits = self.escrow.credit_totals(tx, transfer).await?;
            self.escrow.apply_credits(tx, transfer.id, &credits).await?;
            transfer.enter(TransferState::Executed, now);
        }
        Ok(())
    }

    // ========================================================================
    // Fulfill
    // ========================================================================

    /// Execute or cancel a transfer with a condition fulfillment.
    ///
    /// Exactly one of the two conditions must verify. Replaying the stored
    /// fulfillment returns the stored result with `existed = true`.
    pub async fn fulfill(&self, id: Uuid, fulfillment: Fulfillment) -> Result<FulfillOutcome> {
        let mut tx = self.store.begin().await?;
        let mut transfer = tx
            .lock_transfer(id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("Transfer {} not found", id)))?;

        if let Some(record) = tx.get_fulfillment(id).await?
            && record.fulfillment == fulfillment
        {
            debug!(transfer_id = %id, "Fulfillment replayed");
            return Ok(FulfillOutcome {
                transfer,
                fulfillment: record,
                existed: true,
            });
        }

        let executes = transfer
            .execution_condition
            .as_ref()
            .is_some_and(|c| verify(c, &fulfillment));
        let cancels = transfer
            .cancellation_condition
            .as_ref()
            .is_some_and(|c| verify(c, &fulfillment));

        let role = match (executes, cancels) {
            (true, false) => ConditionRole::Execution,
            (false, true) => ConditionRole::Cancellation,
            (false, false) => {
                return Err(LedgerError::UnmetCondition(
                    "Fulfillment does not match any condition".to_string(),
                ));
            }
            (true, true) => {
                return Err(LedgerError::UnmetCondition(
                    "Fulfillment matches both conditions".to_string(),
                ));
            }
        };

        let now = Utc::now();
        match role {
            ConditionRole::Execution => {
                if transfer.state != TransferState::Prepared {
                    return Err(state_conflict(&transfer, TransferState::Executed));
                }
                if transfer.expires_at.is_some_and(|at| at <= now) {
                    return Err(LedgerError::UnprocessableEntity(format!(
                        "Transfer {} has already expired",
                        id
                    )));
                }
                let credits = self.escrow.credit_totals(tx.as_mut(), &transfer).await?;
                self.escrow
                    .apply_credits(tx.as_mut(), id, &credits)
                    .await?;
                transfer.enter(TransferState::Executed, now);
            }
            ConditionRole::Cancellation => {
                if transfer.is_finalized() {
                    return Err(state_conflict(&transfer, TransferState::Rejected));
                }
                self.cancel(tx.as_mut(), &mut transfer, RejectionReason::Cancelled, now)
                    .await?;
            }
        }

        let record = FulfillmentRecord {
            transfer_id: id,
            role,
            fulfillment,
            created_at: now,
        };
        if !tx.insert_fulfillment(&record).await? {
            return Err(LedgerError::invalid_modification(format!(
                "Transfer {} already has a fulfillment",
                id
            )));
        }
        tx.upsert_transfer(&transfer).await?;
        enqueue_notifications(tx.as_mut(), &transfer).await?;
        tx.commit().await?;

        info!(
            transfer_id = %id,
            condition = %role,
            state = %transfer.state,
            "Transfer fulfilled"
        );
        self.after_commit(&transfer);
        Ok(FulfillOutcome {
            transfer,
            fulfillment: record,
            existed: false,
        })
    }

    // ========================================================================
    // Cancellation paths
    // ========================================================================

    /// Reject a transfer whose deadline has passed.
    ///
    /// Returns `None` when there is nothing to do: the transfer is gone,
    /// already finalized, or not due yet (it is then watched again).
    pub async fn expire(&self, id: Uuid) -> Result<Option<Transfer>> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;

        let Some(mut transfer) = tx.lock_transfer(id).await? else {
            warn!(transfer_id = %id, "Expiry fired for unknown transfer");
            return Ok(None);
        };
        if transfer.is_finalized() {
            debug!(transfer_id = %id, state = %transfer.state, "Expiry fired for finalized transfer");
            return Ok(None);
        }
        let Some(expires_at) = transfer.expires_at else {
            return Ok(None);
        };
        if expires_at > now {
            drop(tx);
            self.expiry.watch(id, expires_at);
            return Ok(None);
        }

        self.cancel(tx.as_mut(), &mut transfer, RejectionReason::Expired, now)
            .await?;
        tx.upsert_transfer(&transfer).await?;
        enqueue_notifications(tx.as_mut(), &transfer).await?;
        tx.commit().await?;

        info!(transfer_id = %id, "Transfer expired");
        self.after_commit(&transfer);
        Ok(Some(transfer))
    }

    /// The credited account (or an admin) declines its credit.
    ///
    /// Once every credit is rejected the transfer is cancelled.
    pub async fn reject_credit(
        &self,
        id: Uuid,
        account: &str,
        message: Option<String>,
        actor: &Actor,
    ) -> Result<Transfer> {
        let account = canonical(account);
        if !actor.can_act_for(&account) {
            return Err(LedgerError::Unauthorized(format!(
                "{} may not reject credits to {}",
                actor.name, account
            )));
        }

        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        let mut transfer = tx
            .lock_transfer(id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("Transfer {} not found", id)))?;

        if !transfer.credits.iter().any(|c| c.account == account) {
            return Err(LedgerError::UnprocessableEntity(format!(
                "Transfer {} has no credit to {}",
                id, account
            )));
        }
        if transfer
            .credits
            .iter()
            .filter(|c| c.account == account)
            .all(|c| c.rejected)
        {
            return Ok(transfer);
        }
        if transfer.is_finalized() {
            return Err(LedgerError::invalid_modification(format!(
                "Transfer {} is already {}",
                id, transfer.state
            )));
        }

        for credit in transfer.credits.iter_mut().filter(|c| c.account == account) {
            credit.rejected = true;
            credit.rejection_message = message.clone();
        }
        if transfer.all_credits_rejected() {
            self.cancel(tx.as_mut(), &mut transfer, RejectionReason::Cancelled, now)
                .await?;
        }

        tx.upsert_transfer(&transfer).await?;
        enqueue_notifications(tx.as_mut(), &transfer).await?;
        tx.commit().await?;

        info!(
            transfer_id = %id,
            account = %account,
            state = %transfer.state,
            "Credit rejected"
        );
        self.after_commit(&transfer);
        Ok(transfer)
    }

    /// Move to `rejected`, returning escrowed funds if the transfer was prepared
    async fn cancel(
        &self,
        tx: &mut dyn LedgerTx,
        transfer: &mut Transfer,
        reason: RejectionReason,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if transfer.state.holds_funds() {
            let debits = self.escrow.debit_totals(tx, transfer).await?;
            self.escrow.revert_debits(tx, transfer.id, &debits).await?;
        }
        transfer.rejection_reason = Some(reason);
        transfer.enter(TransferState::Rejected, now);
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn get_transfer(&self, id: Uuid) -> Result<Transfer> {
        let mut tx = self.store.begin().await?;
        tx.get_transfer(id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("Transfer {} not found", id)))
    }

    pub async fn get_fulfillment(&self, id: Uuid) -> Result<FulfillmentRecord> {
        let mut tx = self.store.begin().await?;
        if tx.get_transfer(id).await?.is_none() {
            return Err(LedgerError::NotFound(format!("Transfer {} not found", id)));
        }
        tx.get_fulfillment(id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("Transfer {} has no fulfillment", id)))
    }

    // ========================================================================
    // Post-commit signals
    // ========================================================================

    fn after_commit(&self, transfer: &Transfer) {
        if transfer.is_finalized() {
            self.expiry.unwatch(transfer.id);
        } else if let Some(at) = transfer.expires_at
            && self.expiry.deadline(transfer.id) != Some(at)
        {
            self.expiry.watch(transfer.id, at);
        }

        if let Some(push) = &self.push {
            push.publish(TransferEvent::update(transfer));
        }
        if let Some(wakeup) = &self.dispatch_wakeup {
            wakeup.notify_one();
        }
    }
}

/// Shape checks that need no storage access
fn validate_submission(submission: &TransferSubmission) -> Result<()> {
    if submission.debits.is_empty() || submission.credits.is_empty() {
        return Err(LedgerError::UnprocessableEntity(
            "Transfer needs at least one debit and one credit".to_string(),
        ));
    }

    let names = submission
        .debits
        .iter()
        .map(|d| d.account.as_str())
        .chain(submission.credits.iter().map(|c| c.account.as_str()));
    for name in names {
        AccountName::new(name).map_err(|e| LedgerError::UnprocessableEntity(e.to_string()))?;
    }

    let amounts = submission
        .debits
        .iter()
        .map(|d| d.amount)
        .chain(submission.credits.iter().map(|c| c.amount));
    for amount in amounts {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::UnprocessableEntity(format!(
                "Amount must be positive, got {}",
                amount
            )));
        }
    }

    let debited = checked_sum(submission.debits.iter().map(|d| d.amount))?;
    let credited = checked_sum(submission.credits.iter().map(|c| c.amount))?;
    if debited != credited {
        return Err(LedgerError::UnprocessableEntity(format!(
            "Debits ({}) and credits ({}) do not balance",
            debited, credited
        )));
    }
    Ok(())
}

fn checked_sum(mut amounts: impl Iterator<Item = Decimal>) -> Result<Decimal> {
    amounts.try_fold(Decimal::ZERO, |acc, amount| {
        acc.checked_add(amount)
            .ok_or_else(|| LedgerError::UnprocessableEntity("Amount overflow".to_string()))
    })
}

fn authorize_debit(actor: Option<&Actor>, account: &str) -> Result<()> {
    match actor {
        None => Err(LedgerError::Unauthorized(format!(
            "Authorizing the debit from {} requires authentication",
            account
        ))),
        Some(actor) if !actor.can_act_for(account) => Err(LedgerError::Unauthorized(format!(
            "{} may not authorize debits from {}",
            actor.name, account
        ))),
        Some(_) => Ok(()),
    }
}

fn state_conflict(transfer: &Transfer, wanted: TransferState) -> LedgerError {
    LedgerError::InvalidModification {
        message: format!(
            "Transfer {} is {} and cannot become {}",
            transfer.id, transfer.state, wanted
        ),
        diff: vec![FieldChange {
            path: "state".to_string(),
            before: Value::from(transfer.state.as_str()),
            after: Value::from(wanted.as_str()),
        }],
    }
}

/// Apply a resubmission to the stored transfer, allowing only debit
/// authorizations to flip on
fn merge(stored: Transfer, submission: TransferSubmission, actor: Option<&Actor>) -> Result<Merge> {
    let mut candidate = stored.clone();
    candidate.ledger = submission.ledger.unwrap_or_else(|| stored.ledger.clone());
    candidate.state = submission.state.unwrap_or(stored.state);
    candidate.debits = submission.debits;
    candidate.credits = submission.credits;
    candidate.execution_condition = submission.execution_condition;
    candidate.cancellation_condition = submission.cancellation_condition;
    candidate.expires_at = submission.expires_at;

    // Rejections are recorded through reject_credit; omitting them is not a change
    for (credit, old) in candidate.credits.iter_mut().zip(&stored.credits) {
        if !credit.rejected && old.rejected {
            credit.rejected = true;
            credit.rejection_message = old.rejection_message.clone();
        }
    }

    let changes = json_diff(&serde_json::to_value(&stored)?, &serde_json::to_value(&candidate)?);
    if changes.is_empty() {
        return Ok(Merge::Unchanged(stored));
    }

    let (authorizations, disallowed): (Vec<FieldChange>, Vec<FieldChange>) =
        changes.into_iter().partition(is_authorization);
    if !disallowed.is_empty() {
        return Err(LedgerError::InvalidModification {
            message: format!("Transfer {} may only gain debit authorizations", stored.id),
            diff: disallowed,
        });
    }
    if stored.is_finalized() {
        return Err(LedgerError::InvalidModification {
            message: format!("Transfer {} is already {}", stored.id, stored.state),
            diff: authorizations,
        });
    }

    for (debit, old) in candidate.debits.iter().zip(&stored.debits) {
        if debit.authorized && !old.authorized {
            authorize_debit(actor, &debit.account)?;
        }
    }
    Ok(Merge::Changed(candidate))
}

/// `debits[i].authorized` going from false to true
fn is_authorization(change: &FieldChange) -> bool {
    is_debit_authorized_path(&change.path)
        && change.before == Value::Bool(false)
        && change.after == Value::Bool(true)
}

/// Exactly `debits[<index>].authorized`, nothing nested
fn is_debit_authorized_path(path: &str) -> bool {
    path.strip_prefix("debits[")
        .and_then(|rest| rest.strip_suffix("].authorized"))
        .is_some_and(|index| !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()))
}
