//! End-to-end flows through the public API against the in-memory store

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};

use escrow_ledger::condition::threshold_condition;
use escrow_ledger::notify::{DispatcherConfig, NotifierTransport, TransportError};
use escrow_ledger::{
    Account, AccountService, Actor, EscrowLedger, ExpiryScheduler, Fulfillment, LedgerError,
    LedgerStore, MemoryStore, NotificationDispatcher, Subscription, SubscriptionService,
    TransferCoordinator, TransferState, TransferSubmission,
};

/// Transport that records every POST and answers 200
#[derive(Default)]
struct RecordingTransport {
    posts: Mutex<Vec<(String, Value)>>,
}

#[async_trait]
impl NotifierTransport for RecordingTransport {
    async fn post_json(&self, url: &str, body: &Value) -> Result<u16, TransportError> {
        self.posts
            .lock()
            .unwrap()
            .push((url.to_string(), body.clone()));
        Ok(200)
    }
}

struct Ledger {
    store: MemoryStore,
    accounts: AccountService,
    subscriptions: SubscriptionService,
    coordinator: TransferCoordinator,
    dispatcher: NotificationDispatcher,
    transport: Arc<RecordingTransport>,
}

async fn ledger() -> Ledger {
    let store = MemoryStore::new();
    let shared: Arc<dyn LedgerStore> = Arc::new(store.clone());
    let transport = Arc::new(RecordingTransport::default());
    let dispatcher =
        NotificationDispatcher::new(shared.clone(), transport.clone(), DispatcherConfig::default());
    let coordinator = TransferCoordinator::new(
        shared.clone(),
        EscrowLedger::new("hold"),
        "http://ledger.example",
        Arc::new(ExpiryScheduler::new()),
    )
    .with_dispatch_wakeup(dispatcher.waker());

    let accounts = AccountService::new(shared.clone(), "hold");
    let admin = Actor::admin("admin");
    for (name, balance) in [("alice", 100), ("bob", 0), ("candice", 100)] {
        accounts
            .put_account(
                Account::new(name).with_balance(Decimal::from(balance)),
                &admin,
            )
            .await
            .unwrap();
    }

    Ledger {
        store,
        accounts,
        subscriptions: SubscriptionService::new(shared),
        coordinator,
        dispatcher,
        transport,
    }
}

async fn balance(ledger: &Ledger, name: &str) -> Decimal {
    ledger.accounts.get_account(name).await.unwrap().balance
}

async fn total(ledger: &Ledger) -> Decimal {
    let mut tx = ledger.store.begin().await.unwrap();
    tx.total_balance().await.unwrap()
}

#[tokio::test]
async fn qa_threshold_escrow_executes_and_notifies() {
    let ledger = ledger().await;
    let bob = Actor::user("bob");
    ledger
        .subscriptions
        .put_subscription(
            Subscription::new("bob", "transfer.*", "bob", "http://bob.example/hook"),
            &bob,
        )
        .await
        .unwrap();

    // Execution needs both the buyer's and the seller's secret
    let buyer = Fulfillment::preimage(b"buyer".to_vec());
    let seller = Fulfillment::preimage(b"seller".to_vec());
    let condition = threshold_condition(
        2,
        &[buyer.condition().unwrap(), seller.condition().unwrap()],
    )
    .unwrap();

    let id = uuid::Uuid::new_v4();
    let submission: TransferSubmission = serde_json::from_value(json!({
        "id": id,
        "debits": [{"account": "alice", "amount": "50.00", "authorized": true}],
        "credits": [{"account": "bob", "amount": "50"}],
        "execution_condition": condition.to_uri(),
    }))
    .unwrap();
    let outcome = ledger
        .coordinator
        .submit(submission, Some(&Actor::user("alice")))
        .await
        .unwrap();
    assert_eq!(outcome.transfer.state, TransferState::Prepared);

    // One secret alone is not enough
    let partial = Fulfillment::ThresholdSha256 {
        threshold: 2,
        subfulfillments: vec![buyer.clone()],
        subconditions: vec![seller.condition().unwrap()],
    };
    assert!(matches!(
        ledger.coordinator.fulfill(id, partial).await,
        Err(LedgerError::UnmetCondition(_))
    ));

    let full: Fulfillment = serde_json::from_value(json!({
        "type": "threshold-sha-256",
        "threshold": 2,
        "subfulfillments": [
            serde_json::to_value(&seller).unwrap(),
            serde_json::to_value(&buyer).unwrap(),
        ],
    }))
    .unwrap();
    let executed = ledger.coordinator.fulfill(id, full).await.unwrap();
    assert_eq!(executed.transfer.state, TransferState::Executed);
    assert_eq!(balance(&ledger, "alice").await, Decimal::from(50));
    assert_eq!(balance(&ledger, "bob").await, Decimal::from(50));

    let stats = ledger.dispatcher.deliver_pending().await.unwrap();
    assert_eq!(stats.delivered, 1);

    let posts = ledger.transport.posts.lock().unwrap().clone();
    assert_eq!(posts.len(), 1);
    let (url, body) = &posts[0];
    assert_eq!(url, "http://bob.example/hook");
    assert_eq!(body["resource"]["state"], "executed");
    assert_eq!(
        body["related_resources"]["execution_condition_fulfillment"]["type"],
        "threshold-sha-256"
    );
}

#[tokio::test]
async fn qa_conservation_across_outcomes() {
    let ledger = ledger().await;
    let alice = Actor::user("alice");
    let before = total(&ledger).await;
    let execute = Fulfillment::preimage(b"go".to_vec());
    let cancel = Fulfillment::preimage(b"stop".to_vec());

    for i in 0..12u32 {
        let amount = Decimal::from(i % 5 + 1);
        let submission = TransferSubmission::new(
            uuid::Uuid::new_v4(),
            vec![escrow_ledger::Debit::new("alice", amount).authorized()],
            vec![escrow_ledger::Credit::new("bob", amount)],
        )
        .with_execution_condition(execute.condition().unwrap())
        .with_cancellation_condition(cancel.condition().unwrap());
        let id = submission.id;
        ledger
            .coordinator
            .submit(submission, Some(&alice))
            .await
            .unwrap();

        match i % 3 {
            0 => {
                ledger.coordinator.fulfill(id, execute.clone()).await.unwrap();
            }
            1 => {
                ledger.coordinator.fulfill(id, cancel.clone()).await.unwrap();
            }
            _ => {}
        }
        assert_eq!(total(&ledger).await, before);
    }

    // Executed amounts: i in {0, 3, 6, 9} -> 1 + 4 + 2 + 5
    assert_eq!(balance(&ledger, "bob").await, Decimal::from(12));
    // Still held: i in {2, 5, 8, 11} -> 3 + 1 + 4 + 2
    assert_eq!(balance(&ledger, "hold").await, Decimal::from(10));
    assert_eq!(balance(&ledger, "alice").await, Decimal::from(78));
}

#[tokio::test]
async fn qa_disabled_account_cannot_join_new_transfers() {
    let ledger = ledger().await;
    let admin = Actor::admin("admin");
    ledger
        .accounts
        .put_account(
            Account {
                is_disabled: true,
                ..Account::new("candice")
            },
            &admin,
        )
        .await
        .unwrap();
    assert_eq!(balance(&ledger, "candice").await, Decimal::from(100));

    let submission = TransferSubmission::new(
        uuid::Uuid::new_v4(),
        vec![escrow_ledger::Debit::new("candice", Decimal::ONE)],
        vec![escrow_ledger::Credit::new("bob", Decimal::ONE)],
    );
    assert!(matches!(
        ledger.coordinator.submit(submission, None).await,
        Err(LedgerError::UnprocessableEntity(_))
    ));
}
