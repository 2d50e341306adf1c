//! Timer Worker
//!
//! Single background task that expires due transfers. It keeps at most one
//! pending wakeup: every loop iteration builds a fresh sleep and the previous
//! one is dropped with the `select!` that owned it.
//!
//! Loop body, run on start and after every wakeup or queue insert:
//! 1. expire everything already due
//! 2. sleep until `min(earliest deadline - now, max_timeout)`, an insert, or stop

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::scheduler::{DEFAULT_MAX_TIMEOUT, ExpiryScheduler};
use crate::transfer::TransferCoordinator;

/// Back-off before retrying an expiry that failed on storage
const STORAGE_RETRY_DELAY_MS: i64 = 1000;

/// Worker configuration
#[derive(Debug, Clone)]
pub struct ExpiryConfig {
    /// Cap on a single sleep
    pub max_timeout: Duration,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            max_timeout: DEFAULT_MAX_TIMEOUT,
        }
    }
}

struct Running {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

pub struct ExpiryWorker {
    coordinator: Arc<TransferCoordinator>,
    scheduler: Arc<ExpiryScheduler>,
    config: ExpiryConfig,
    running: Option<Running>,
}

impl ExpiryWorker {
    pub fn new(
        coordinator: Arc<TransferCoordinator>,
        scheduler: Arc<ExpiryScheduler>,
        config: ExpiryConfig,
    ) -> Self {
        Self {
            coordinator,
            scheduler,
            config,
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Register the insert listener and spawn the timer task.
    ///
    /// Starting an already running worker is a no-op.
    pub fn start(&mut self) {
        if self.running.is_some() {
            return;
        }

        let inserted = Arc::new(Notify::new());
        let signal = inserted.clone();
        self.scheduler
            .set_insert_listener(Box::new(move |_, _| signal.notify_one()));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(timer_loop(
            self.coordinator.clone(),
            self.scheduler.clone(),
            self.config.max_timeout,
            inserted,
            shutdown_rx,
        ));

        self.running = Some(Running { handle, shutdown });
        info!(
            max_timeout_ms = self.config.max_timeout.as_millis() as u64,
            "Expiry worker started"
        );
    }

    /// Deregister the listener and cancel the pending wakeup
    pub async fn stop(&mut self) {
        let Some(Running { handle, shutdown }) = self.running.take() else {
            return;
        };

        self.scheduler.clear_insert_listener();
        let _ = shutdown.send(true);
        if let Err(e) = handle.await {
            error!("Expiry worker task failed: {}", e);
        }
        info!("Expiry worker stopped");
    }

    /// Expire every transfer due now; returns how many were rejected
    pub async fn process_expired(&self) -> usize {
        expire_due(&self.coordinator, &self.scheduler).await
    }
}

impl Drop for ExpiryWorker {
    fn drop(&mut self) {
        if let Some(Running { handle, .. }) = self.running.take() {
            self.scheduler.clear_insert_listener();
            handle.abort();
        }
    }
}

async fn timer_loop(
    coordinator: Arc<TransferCoordinator>,
    scheduler: Arc<ExpiryScheduler>,
    max_timeout: Duration,
    inserted: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    while !*shutdown.borrow() {
        expire_due(&coordinator, &scheduler).await;

        let delay = scheduler.next_wakeup_delay(Utc::now(), max_timeout);
        let wakeup = async {
            match delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = wakeup => {}
            _ = inserted.notified() => {}
            _ = shutdown.changed() => {}
        }
    }
}

async fn expire_due(coordinator: &TransferCoordinator, scheduler: &ExpiryScheduler) -> usize {
    let now = Utc::now();
    let due = scheduler.pop_due(now);
    if due.is_empty() {
        return 0;
    }
    debug!(count = due.len(), "Processing due transfers");

    let mut expired = 0;
    for id in due {
        match coordinator.expire(id).await {
            Ok(Some(_)) => expired += 1,
            Ok(None) => {}
            Err(e) if e.is_storage_failure() => {
                warn!(transfer_id = %id, "Expiry failed on storage, retrying: {}", e);
                scheduler.watch(id, now + chrono::Duration::milliseconds(STORAGE_RETRY_DELAY_MS));
            }
            Err(e) => {
                error!(transfer_id = %id, "Failed to expire transfer: {}", e);
            }
        }
    }
    expired
}
