//! Notification Dispatcher
//!
//! Background loop draining the notification outbox. Wakes on a fixed
//! interval or immediately when a committed mutation signals the waker.
//!
//! Each row is handled on its own: a failing or slow subscriber only ever
//! costs that row a retry, never the rest of the batch.

use chrono::Utc;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tracing::{debug, error, info, warn};

use super::transport::{NotifierTransport, TransportError};
use super::Notification;
use crate::error::{LedgerError, Result};
use crate::store::LedgerStore;
use crate::subscription::{Subscription, TRANSFER_UPDATE};
use crate::transfer::{ConditionRole, FulfillmentRecord, Transfer};

/// Dispatcher tuning
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Interval between outbox scans when nothing wakes the loop
    pub poll_interval: Duration,
    /// Upper bound on a single delivery
    pub delivery_timeout: Duration,
    /// Max rows handled per scan
    pub batch_size: usize,
    /// Failed attempts after which a row is dropped
    pub max_retries: i32,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            delivery_timeout: Duration::from_secs(10),
            batch_size: 100,
            max_retries: 10,
            retry_base: Duration::from_secs(1),
            retry_max: Duration::from_secs(300),
        }
    }
}

impl DispatcherConfig {
    /// `min(retry_base * 2^retry_count, retry_max)`
    pub fn retry_delay(&self, retry_count: i32) -> Duration {
        let exp = retry_count.clamp(0, 31) as u32;
        self.retry_base
            .checked_mul(1u32 << exp)
            .map_or(self.retry_max, |d| d.min(self.retry_max))
    }
}

/// What happened to one outbox row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// 2xx; row deleted
    Delivered,
    /// 2xx, but the transfer changed meanwhile; row kept for the newer state
    Superseded,
    /// Failure; row rescheduled
    Retrying,
    /// Failure past `max_retries`; row deleted
    Dropped,
    /// Subscription or transfer gone; row deleted without sending
    Discarded,
}

/// Counters for one outbox scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub delivered: usize,
    pub superseded: usize,
    pub retrying: usize,
    pub dropped: usize,
    pub discarded: usize,
    /// Rows whose handling failed on storage
    pub errors: usize,
    /// Rows returned by the scan
    pub scanned: usize,
}

impl DispatchStats {
    /// Rows that left the due set during this scan
    pub fn settled(&self) -> usize {
        self.delivered + self.retrying + self.dropped + self.discarded
    }

    fn record(&mut self, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Delivered => self.delivered += 1,
            DeliveryOutcome::Superseded => self.superseded += 1,
            DeliveryOutcome::Retrying => self.retrying += 1,
            DeliveryOutcome::Dropped => self.dropped += 1,
            DeliveryOutcome::Discarded => self.discarded += 1,
        }
    }
}

pub struct NotificationDispatcher {
    store: Arc<dyn LedgerStore>,
    transport: Arc<dyn NotifierTransport>,
    config: DispatcherConfig,
    wakeup: Arc<Notify>,
}

impl NotificationDispatcher {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        transport: Arc<dyn NotifierTransport>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            transport,
            config,
            wakeup: Arc::new(Notify::new()),
        }
    }

    /// Handle that wakes the loop early; given to the transfer coordinator
    pub fn waker(&self) -> Arc<Notify> {
        self.wakeup.clone()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Run until `shutdown` flips to `true`
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Notification dispatcher started"
        );

        while !*shutdown.borrow() {
            match self.deliver_pending().await {
                Ok(stats) if stats != DispatchStats::default() => {
                    debug!(?stats, "Outbox scan complete");
                    // A full batch that made progress means a backlog; scan again
                    if stats.scanned >= self.config.batch_size && stats.settled() > 0 {
                        continue;
                    }
                }
                Ok(_) => {}
                Err(e) => error!("Outbox scan failed: {}", e),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = self.wakeup.notified() => {}
                _ = shutdown.changed() => {}
            }
        }

        info!("Notification dispatcher stopped");
    }

    /// Deliver every due row once
    pub async fn deliver_pending(&self) -> Result<DispatchStats> {
        let due = {
            let mut tx = self.store.begin().await?;
            tx.due_notifications(Utc::now(), self.config.batch_size)
                .await?
        };

        let mut stats = DispatchStats {
            scanned: due.len(),
            ..Default::default()
        };
        for notification in due {
            match self.deliver_one(&notification).await {
                Ok(outcome) => stats.record(outcome),
                Err(e) => {
                    error!(
                        notification_id = %notification.id,
                        transfer_id = %notification.transfer_id,
                        "Failed to process notification: {}",
                        e
                    );
                    stats.errors += 1;
                }
            }
        }
        Ok(stats)
    }

    async fn deliver_one(&self, notification: &Notification) -> Result<DeliveryOutcome> {
        // Snapshot what to send, then release the transaction before the POST
        let (subscription, transfer, fulfillment) = {
            let mut tx = self.store.begin().await?;
            let subscription = tx
                .get_subscription(notification.subscription_id)
                .await?
                .filter(|s| !s.is_deleted);
            let transfer = tx.get_transfer(notification.transfer_id).await?;

            match (subscription, transfer) {
                (Some(subscription), Some(transfer)) => {
                    let fulfillment = tx.get_fulfillment(transfer.id).await?;
                    (subscription, transfer, fulfillment)
                }
                _ => {
                    tx.delete_notification(notification.id).await?;
                    tx.commit().await?;
                    debug!(notification_id = %notification.id, "Discarded orphaned notification");
                    return Ok(DeliveryOutcome::Discarded);
                }
            }
        };

        let body = build_payload(&subscription, &transfer, fulfillment.as_ref())?;
        let result = tokio::time::timeout(
            self.config.delivery_timeout,
            self.transport.post_json(&subscription.target, &body),
        )
        .await
        .unwrap_or(Err(TransportError::Timeout));

        let mut tx = self.store.begin().await?;
        let outcome = match result {
            Ok(status) if (200..300).contains(&status) => {
                let current = tx.get_transfer(transfer.id).await?;
                if current.as_ref() == Some(&transfer) {
                    tx.delete_notification(notification.id).await?;
                    DeliveryOutcome::Delivered
                } else {
                    DeliveryOutcome::Superseded
                }
            }
            failure => {
                let reason = match failure {
                    Ok(status) => format!("HTTP {}", status),
                    Err(e) => e.to_string(),
                };
                let attempts = notification.retry_count + 1;
                if attempts > self.config.max_retries {
                    warn!(
                        subscription_id = %subscription.id,
                        transfer_id = %transfer.id,
                        target = %subscription.target,
                        attempts,
                        "Giving up on notification: {}",
                        reason
                    );
                    tx.delete_notification(notification.id).await?;
                    DeliveryOutcome::Dropped
                } else {
                    let delay = self.config.retry_delay(notification.retry_count);
                    let retry_at = Utc::now()
                        + chrono::Duration::from_std(delay)
                            .map_err(|e| LedgerError::Internal(e.to_string()))?;
                    warn!(
                        subscription_id = %subscription.id,
                        transfer_id = %transfer.id,
                        target = %subscription.target,
                        attempts,
                        retry_at = %retry_at,
                        "Notification delivery failed: {}",
                        reason
                    );
                    tx.reschedule_notification(notification.id, attempts, retry_at)
                        .await?;
                    DeliveryOutcome::Retrying
                }
            }
        };
        tx.commit().await?;
        Ok(outcome)
    }
}

/// External representation of one notification
pub fn build_payload(
    subscription: &Subscription,
    transfer: &Transfer,
    fulfillment: Option<&FulfillmentRecord>,
) -> Result<Value> {
    let mut related = Map::new();
    if let Some(record) = fulfillment {
        let key = match record.role {
            ConditionRole::Execution => "execution_condition_fulfillment",
            ConditionRole::Cancellation => "cancellation_condition_fulfillment",
        };
        related.insert(key.to_string(), serde_json::to_value(&record.fulfillment)?);
    }

    let mut payload = json!({
        "id": subscription.id,
        "event": TRANSFER_UPDATE,
        "resource": serde_json::to_value(transfer)?,
    });
    if !related.is_empty() {
        payload["related_resources"] = Value::Object(related);
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::enqueue_notifications;
    use crate::notify::transport::mock::MockTransport;
    use crate::store::MemoryStore;
    use crate::transfer::{Credit, Debit, TransferSubmission};
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn transfer() -> Transfer {
        TransferSubmission::new(
            Uuid::new_v4(),
            vec![Debit::new("alice", Decimal::TEN)],
            vec![Credit::new("bob", Decimal::TEN)],
        )
        .into_transfer("http://ledger.example")
    }

    /// Store one transfer with subscriptions for alice and bob
    async fn seeded(store: &MemoryStore) -> Transfer {
        let transfer = transfer();
        let mut tx = store.begin().await.unwrap();
        tx.upsert_transfer(&transfer).await.unwrap();
        tx.upsert_subscription(&Subscription::new("alice", "*", "alice", "http://alice"))
            .await
            .unwrap();
        tx.upsert_subscription(&Subscription::new("bob", "transfer.*", "bob", "http://bob"))
            .await
            .unwrap();
        enqueue_notifications(tx.as_mut(), &transfer).await.unwrap();
        tx.commit().await.unwrap();
        transfer
    }

    fn dispatcher(store: &MemoryStore, transport: Arc<MockTransport>) -> NotificationDispatcher {
        NotificationDispatcher::new(
            Arc::new(store.clone()),
            transport,
            DispatcherConfig {
                delivery_timeout: Duration::from_millis(100),
                max_retries: 2,
                ..Default::default()
            },
        )
    }

    async fn pending(store: &MemoryStore) -> Vec<Notification> {
        let mut tx = store.begin().await.unwrap();
        let far_future = Utc::now() + chrono::Duration::days(365);
        tx.due_notifications(far_future, 100).await.unwrap()
    }

    #[test]
    fn test_retry_delay_is_capped() {
        let config = DispatcherConfig {
            retry_base: Duration::from_millis(100),
            retry_max: Duration::from_secs(1),
            ..Default::default()
        };
        assert_eq!(config.retry_delay(0), Duration::from_millis(100));
        assert_eq!(config.retry_delay(2), Duration::from_millis(400));
        assert_eq!(config.retry_delay(4), Duration::from_secs(1));
        assert_eq!(config.retry_delay(1000), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_successful_delivery_deletes_rows() {
        let store = MemoryStore::new();
        let transfer = seeded(&store).await;
        let transport = Arc::new(MockTransport::new());

        let stats = dispatcher(&store, transport.clone())
            .deliver_pending()
            .await
            .unwrap();

        assert_eq!(stats.delivered, 2);
        assert!(pending(&store).await.is_empty());
        let body = &transport.calls_to("http://alice")[0];
        assert_eq!(body["event"], "transfer.update");
        assert_eq!(body["resource"]["id"], json!(transfer.id));
    }

    #[tokio::test]
    async fn test_failing_subscriber_does_not_block_others() {
        let store = MemoryStore::new();
        seeded(&store).await;
        let transport = Arc::new(MockTransport::new());
        transport.set_unreachable("http://alice");

        let stats = dispatcher(&store, transport.clone())
            .deliver_pending()
            .await
            .unwrap();

        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.retrying, 1);
        let left = pending(&store).await;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].retry_count, 1);
        assert!(left[0].retry_at.is_some());
    }

    #[tokio::test]
    async fn test_non_2xx_is_retried_then_dropped() {
        let store = MemoryStore::new();
        seeded(&store).await;
        let transport = Arc::new(MockTransport::new());
        transport.set_status("http://bob", 500);
        let dispatcher = dispatcher(&store, transport.clone());

        for _ in 0..3 {
            // Pull every backed-off row forward so each pass retries it
            let mut tx = store.begin().await.unwrap();
            let far_future = Utc::now() + chrono::Duration::days(365);
            for n in tx.due_notifications(far_future, 100).await.unwrap() {
                tx.reschedule_notification(n.id, n.retry_count, Utc::now())
                    .await
                    .unwrap();
            }
            tx.commit().await.unwrap();

            dispatcher.deliver_pending().await.unwrap();
        }

        assert_eq!(transport.calls_to("http://bob").len(), 3);
        assert!(pending(&store).await.is_empty());
    }

    #[tokio::test]
    async fn test_slow_subscriber_times_out() {
        let store = MemoryStore::new();
        seeded(&store).await;
        let transport = Arc::new(MockTransport::new());
        transport.set_delay(Duration::from_millis(500));

        let stats = dispatcher(&store, transport).deliver_pending().await.unwrap();
        assert_eq!(stats.retrying, 2);
    }

    #[tokio::test]
    async fn test_deleted_subscription_is_discarded() {
        let store = MemoryStore::new();
        seeded(&store).await;

        let mut tx = store.begin().await.unwrap();
        let subs = tx
            .subscriptions_for_subjects(&["alice".to_string()])
            .await
            .unwrap();
        let mut alice = subs[0].clone();
        alice.is_deleted = true;
        tx.upsert_subscription(&alice).await.unwrap();
        tx.commit().await.unwrap();

        let transport = Arc::new(MockTransport::new());
        let stats = dispatcher(&store, transport.clone())
            .deliver_pending()
            .await
            .unwrap();
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.delivered, 1);
        assert!(transport.calls_to("http://alice").is_empty());
    }

    #[tokio::test]
    async fn test_payload_includes_fulfillment() {
        use crate::condition::Fulfillment;

        let sub = Subscription::new("alice", "*", "alice", "http://alice");
        let transfer = transfer();
        let record = FulfillmentRecord {
            transfer_id: transfer.id,
            role: ConditionRole::Execution,
            fulfillment: Fulfillment::preimage(b"secret".to_vec()),
            created_at: Utc::now(),
        };

        let payload = build_payload(&sub, &transfer, Some(&record)).unwrap();
        assert!(payload["related_resources"]["execution_condition_fulfillment"].is_object());

        let payload = build_payload(&sub, &transfer, None).unwrap();
        assert!(payload.get("related_resources").is_none());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = MemoryStore::new();
        seeded(&store).await;
        let transport = Arc::new(MockTransport::new());
        let dispatcher = Arc::new(dispatcher(&store, transport.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.run(shutdown_rx).await }
        });
        dispatcher.waker().notify_one();
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(transport.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_full_batch_drains_without_waiting_for_poll() {
        let store = MemoryStore::new();
        for _ in 0..3 {
            seeded(&store).await;
        }
        let backlog = pending(&store).await.len();
        assert!(backlog > 2);
        let transport = Arc::new(MockTransport::new());
        let dispatcher = Arc::new(NotificationDispatcher::new(
            Arc::new(store.clone()),
            transport.clone(),
            DispatcherConfig {
                poll_interval: Duration::from_secs(60),
                batch_size: 2,
                ..Default::default()
            },
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.run(shutdown_rx).await }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(transport.calls().len(), backlog);
        assert!(pending(&store).await.is_empty());
    }
}
