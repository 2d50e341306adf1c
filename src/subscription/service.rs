//! Subscription management
//!
//! Deleted subscriptions are tombstoned so their id can never be reused.

use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::models::{ANY_SUBJECT, Subscription};
use crate::account::{Actor, canonical};
use crate::error::{LedgerError, Result};
use crate::store::LedgerStore;

pub struct SubscriptionService {
    store: Arc<dyn LedgerStore>,
}

impl SubscriptionService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Create or replace a subscription.
    ///
    /// Non-admins may only subscribe themselves to their own account.
    /// Returns the stored subscription and whether it already existed.
    pub async fn put_subscription(
        &self,
        subscription: Subscription,
        actor: &Actor,
    ) -> Result<(Subscription, bool)> {
        let subscription = Subscription {
            owner: canonical(&subscription.owner),
            subject: canonical(&subscription.subject),
            is_deleted: false,
            ..subscription
        };

        if !actor.can_act_for(&subscription.owner) {
            return Err(LedgerError::Unauthorized(format!(
                "{} may not create subscriptions for {}",
                actor.name, subscription.owner
            )));
        }
        if !actor.is_admin && subscription.subject != subscription.owner {
            let subject = if subscription.subject == ANY_SUBJECT {
                "all accounts"
            } else {
                subscription.subject.as_str()
            };
            return Err(LedgerError::Unauthorized(format!(
                "{} may not subscribe to {}",
                actor.name, subject
            )));
        }
        if subscription.event.is_empty() {
            return Err(LedgerError::UnprocessableEntity(
                "Subscription event must not be empty".to_string(),
            ));
        }
        if !(subscription.target.starts_with("http://")
            || subscription.target.starts_with("https://"))
        {
            return Err(LedgerError::UnprocessableEntity(format!(
                "Subscription target must be an http(s) URL, got {}",
                subscription.target
            )));
        }

        let mut tx = self.store.begin().await?;
        if let Some(existing) = tx.get_subscription(subscription.id).await? {
            if existing.is_deleted {
                return Err(LedgerError::AlreadyExists(format!(
                    "Subscription {} was deleted",
                    subscription.id
                )));
            }
            if !actor.can_act_for(&existing.owner) {
                return Err(LedgerError::Unauthorized(format!(
                    "Subscription {} belongs to {}",
                    existing.id, existing.owner
                )));
            }
        }
        let existed = tx.upsert_subscription(&subscription).await?;
        tx.commit().await?;

        info!(
            subscription_id = %subscription.id,
            owner = %subscription.owner,
            subject = %subscription.subject,
            existed,
            "Subscription saved"
        );
        Ok((subscription, existed))
    }

    pub async fn get_subscription(&self, id: Uuid, actor: &Actor) -> Result<Subscription> {
        let mut tx = self.store.begin().await?;
        let subscription = live(tx.get_subscription(id).await?, id)?;
        if !actor.can_act_for(&subscription.owner) {
            return Err(LedgerError::Unauthorized(format!(
                "Subscription {} belongs to {}",
                id, subscription.owner
            )));
        }
        Ok(subscription)
    }

    /// Tombstone a subscription; pending notifications for it are discarded
    /// by the dispatcher
    pub async fn delete_subscription(&self, id: Uuid, actor: &Actor) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let mut subscription = live(tx.get_subscription(id).await?, id)?;
        if !actor.can_act_for(&subscription.owner) {
            return Err(LedgerError::Unauthorized(format!(
                "Subscription {} belongs to {}",
                id, subscription.owner
            )));
        }

        subscription.is_deleted = true;
        tx.upsert_subscription(&subscription).await?;
        tx.commit().await?;

        info!(subscription_id = %id, "Subscription deleted");
        Ok(())
    }
}

fn live(subscription: Option<Subscription>, id: Uuid) -> Result<Subscription> {
    subscription
        .filter(|s| !s.is_deleted)
        .ok_or_else(|| LedgerError::NotFound(format!("Subscription {} not found", id)))
}
