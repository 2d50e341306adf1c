//! Transactional notification outbox
//!
//! Called inside the same transaction as the transfer mutation so that a
//! committed mutation always has its pending notifications committed too.

use tracing::debug;

use super::Notification;
use crate::error::Result;
use crate::store::LedgerTx;
use crate::subscription::{ANY_SUBJECT, TRANSFER_UPDATE};
use crate::transfer::Transfer;

/// Upsert one pending notification per matching subscription.
///
/// Returns the number of subscriptions matched.
pub async fn enqueue_notifications(tx: &mut dyn LedgerTx, transfer: &Transfer) -> Result<usize> {
    let mut subjects: Vec<String> = transfer.accounts().into_iter().collect();
    subjects.push(ANY_SUBJECT.to_string());

    let subscriptions = tx.subscriptions_for_subjects(&subjects).await?;

    let mut matched = 0;
    for subscription in subscriptions
        .iter()
        .filter(|s| s.matches_event(TRANSFER_UPDATE))
    {
        let collapsed = tx
            .upsert_notification(&Notification::new(subscription.id, transfer.id))
            .await?;
        debug!(
            transfer_id = %transfer.id,
            subscription_id = %subscription.id,
            collapsed,
            "Notification enqueued"
        );
        matched += 1;
    }
    Ok(matched)
}
