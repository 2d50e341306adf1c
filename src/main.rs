//! Escrow Ledger service
//!
//! Wires storage, the transfer coordinator and the two background loops:
//!
//! ```text
//! ┌──────────┐    ┌─────────────┐    ┌──────────────┐
//! │  Config  │───▶│ Coordinator │───▶│  PostgreSQL  │
//! └──────────┘    └─────────────┘    └──────────────┘
//!                   │        │              ▲
//!            watch/unwatch  wake            │
//!                   ▼        ▼              │
//!            ┌──────────┐  ┌────────────┐   │
//!            │  Expiry  │  │ Dispatcher │───┘
//!            └──────────┘  └────────────┘
//! ```

use anyhow::Context;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use escrow_ledger::config::AppConfig;
use escrow_ledger::escrow::EscrowLedger;
use escrow_ledger::expiry::{ExpiryScheduler, ExpiryWorker};
use escrow_ledger::notify::{HttpTransport, NotificationDispatcher};
use escrow_ledger::push::{PushQueue, PushRelay};
use escrow_ledger::store::{LedgerStore, MemoryStore, PgStore};
use escrow_ledger::transfer::TransferCoordinator;

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

async fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn LedgerStore>> {
    match &config.postgres_url {
        Some(url) => {
            let store = PgStore::connect(url)
                .await
                .context("Failed to connect to PostgreSQL")?;
            if config.ledger.init_schema {
                store.init_schema().await.context("Failed to create schema")?;
            }
            store.health_check().await.context("PostgreSQL health check failed")?;
            info!("✅ PostgreSQL connected");
            Ok(Arc::new(store))
        }
        None => {
            warn!("No postgres_url configured, using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env)?;
    let _log_guard = escrow_ledger::logging::init_logging(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        git_hash = env!("GIT_HASH"),
        "Starting escrow ledger in {} mode",
        env
    );

    let store = open_store(&config).await?;

    let scheduler = Arc::new(ExpiryScheduler::new());
    scheduler
        .rebuild(store.as_ref())
        .await
        .context("Failed to rebuild expiry queue")?;

    let transport = Arc::new(
        HttpTransport::new(std::time::Duration::from_millis(
            config.notifications.delivery_timeout_ms,
        ))
        .context("Failed to create notifier transport")?,
    );
    let dispatcher = Arc::new(NotificationDispatcher::new(
        store.clone(),
        transport,
        config.notifications.to_dispatcher_config(),
    ));

    let push = Arc::new(PushQueue::new(config.push.queue_size));
    let relay = Arc::new(PushRelay::new(push.clone(), config.push.poll_interval()));
    let coordinator = Arc::new(
        TransferCoordinator::new(
            store.clone(),
            EscrowLedger::new(config.ledger.hold_account.clone()),
            config.ledger.uri.clone(),
            scheduler.clone(),
        )
        .with_push(push)
        .with_dispatch_wakeup(dispatcher.waker()),
    );

    let mut expiry_worker =
        ExpiryWorker::new(coordinator, scheduler, config.expiry.to_expiry_config());
    expiry_worker.start();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher_task = tokio::spawn({
        let dispatcher = dispatcher.clone();
        let shutdown_rx = shutdown_rx.clone();
        async move { dispatcher.run(shutdown_rx).await }
    });
    let relay_task = tokio::spawn({
        let relay = relay.clone();
        async move { relay.run(shutdown_rx).await }
    });

    info!(ledger = %config.ledger.uri, "🚀 Escrow ledger running");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    expiry_worker.stop().await;
    let _ = shutdown_tx.send(true);
    dispatcher_task.await.context("Dispatcher task failed")?;
    relay_task.await.context("Push relay task failed")?;

    info!("Escrow ledger stopped");
    Ok(())
}
