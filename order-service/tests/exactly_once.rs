//! Order and payment sides wired together over the in-memory broker.

use bigdecimal::BigDecimal;
use order_service::models::OrderStatus;
use order_service::reconciler::{StatusReconciler, RECONCILER_GROUP};
use order_service::relay::{OutboxRelay, RelayConfig};
use order_service::store::{InMemoryOrderStore, OrderStore};
use order_service::writer::OutboxWriter;
use payment_service::consumer::{BalanceConsumer, ConsumerConfig, CONSUMER_GROUP};
use payment_service::store::{InMemoryPaymentStore, PaymentStore};
use shared::bus::memory::InMemoryBus;
use shared::shutdown::{self, ShutdownTrigger};
use shared::{Backoff, Heartbeat, RESULT_TOPIC, TRANSACTION_TOPIC};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

struct Harness {
    orders: Arc<InMemoryOrderStore>,
    payments: Arc<InMemoryPaymentStore>,
    bus: InMemoryBus,
    writer: OutboxWriter,
    relay: Arc<OutboxRelay>,
}

impl Harness {
    fn new() -> Self {
        let orders = Arc::new(InMemoryOrderStore::new());
        let bus = InMemoryBus::new();
        let relay = Arc::new(OutboxRelay::new(
            orders.clone(),
            Arc::new(bus.clone()),
            RelayConfig {
                interval: Duration::from_millis(20),
                backoff: Backoff::immediate(),
                ..RelayConfig::default()
            },
            Heartbeat::new("event-relay"),
        ));
        Self {
            writer: OutboxWriter::new(orders.clone()),
            orders,
            payments: Arc::new(InMemoryPaymentStore::new()),
            bus,
            relay,
        }
    }

    async fn fund(&self, user_id: &str, amount: &str) {
        self.payments.create_account(user_id).await.unwrap();
        self.payments
            .deposit(user_id, &BigDecimal::from_str(amount).unwrap())
            .await
            .unwrap();
    }

    /// Starts the consumer and reconciler, and the relay loop when `with_relay` is set.
    async fn start(&self, with_relay: bool) -> (ShutdownTrigger, Vec<JoinHandle<()>>) {
        let (trigger, shutdown) = shutdown::channel();
        let mut tasks = Vec::new();

        if with_relay {
            let relay = self.relay.clone();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move { relay.run(shutdown).await }));
        }

        let consumer = BalanceConsumer::new(
            self.payments.clone(),
            Arc::new(self.bus.clone()),
            ConsumerConfig {
                max_delivery_attempts: 3,
                backoff: Backoff::immediate(),
                ..ConsumerConfig::default()
            },
            Heartbeat::new("balance-consumer"),
        );
        let subscription = self.bus.subscribe(CONSUMER_GROUP, &[TRANSACTION_TOPIC]).await;
        let consumer_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            consumer.run(subscription, consumer_shutdown).await
        }));

        let reconciler = StatusReconciler::new(
            self.orders.clone(),
            Backoff::immediate(),
            Heartbeat::new("status-reconciler"),
        );
        let subscription = self.bus.subscribe(RECONCILER_GROUP, &[RESULT_TOPIC]).await;
        tasks.push(tokio::spawn(async move {
            reconciler.run(subscription, shutdown).await
        }));

        (trigger, tasks)
    }

    async fn wait_for_status(&self, user_id: &str, id: Uuid, status: OrderStatus) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let order = self.orders.find_order(user_id, id).await.unwrap().unwrap();
                if order.order_status == status {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("order {} never reached {}", id, status));
    }

    async fn wait_for_commit(&self, group: &str, topic: &str, offset: i64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.bus.committed_offset(group, topic).await < offset {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("offset should be committed");
    }
}

async fn stop(trigger: ShutdownTrigger, tasks: Vec<JoinHandle<()>>) {
    trigger.trigger();
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn order_is_debited_exactly_once() {
    let h = Harness::new();
    h.fund("u1", "100").await;
    let (trigger, tasks) = h.start(true).await;

    let id = h
        .writer
        .create_order("u1", BigDecimal::from_str("50.0").unwrap())
        .await
        .unwrap();
    h.wait_for_status("u1", id, OrderStatus::Debited).await;

    assert_eq!(h.payments.balance("u1").await, Some(BigDecimal::from(50)));
    assert_eq!(h.payments.ledger_len().await, 1);
    assert!(h.payments.is_processed(id).await.unwrap());
    stop(trigger, tasks).await;
}

#[tokio::test]
async fn duplicate_publish_is_absorbed_by_the_ledger() {
    let h = Harness::new();
    h.fund("u1", "100").await;

    let id = h
        .writer
        .create_order("u1", BigDecimal::from(30))
        .await
        .unwrap();

    // The broker takes the message but the dispatched mark is lost, so the
    // entry is published a second time once its claim lapses.
    h.orders.fail_next_dispatch_marks(1).await;
    h.relay.sweep().await.unwrap();
    h.orders.expire_claim(id).await;
    assert_eq!(h.relay.sweep().await.unwrap().dispatched, 1);
    assert_eq!(h.bus.messages(TRANSACTION_TOPIC).await.len(), 2);

    let (trigger, tasks) = h.start(false).await;
    h.wait_for_commit(CONSUMER_GROUP, TRANSACTION_TOPIC, 2).await;
    h.wait_for_status("u1", id, OrderStatus::Debited).await;
    h.wait_for_commit(RECONCILER_GROUP, RESULT_TOPIC, 2).await;

    assert_eq!(h.payments.balance("u1").await, Some(BigDecimal::from(70)));
    assert_eq!(h.payments.debits_applied().await, 1);
    assert_eq!(
        h.orders.find_order("u1", id).await.unwrap().unwrap().order_status,
        OrderStatus::Debited
    );
    stop(trigger, tasks).await;
}

#[tokio::test]
async fn rolled_back_debit_is_retried_until_it_commits() {
    let h = Harness::new();
    h.fund("u1", "100").await;
    h.payments.fail_next_debits(2).await;
    let (trigger, tasks) = h.start(true).await;

    let id = h
        .writer
        .create_order("u1", BigDecimal::from(40))
        .await
        .unwrap();
    h.wait_for_status("u1", id, OrderStatus::Debited).await;

    assert_eq!(h.payments.balance("u1").await, Some(BigDecimal::from(60)));
    assert_eq!(h.payments.debits_applied().await, 1);
    stop(trigger, tasks).await;
}

#[tokio::test]
async fn unfunded_order_settles_as_failed() {
    let h = Harness::new();
    h.fund("u2", "10").await;
    let (trigger, tasks) = h.start(true).await;

    let id = h
        .writer
        .create_order("u2", BigDecimal::from(30))
        .await
        .unwrap();
    h.wait_for_status("u2", id, OrderStatus::Failed).await;

    assert_eq!(h.payments.balance("u2").await, Some(BigDecimal::from(10)));
    assert!(!h.payments.is_processed(id).await.unwrap());
    assert_eq!(h.payments.ledger_len().await, 0);
    stop(trigger, tasks).await;
}

#[tokio::test]
async fn broker_outage_delays_but_does_not_lose_the_order() {
    let h = Harness::new();
    h.fund("u1", "100").await;
    h.bus.fail_next_publishes(3).await;
    let (trigger, tasks) = h.start(true).await;

    let id = h
        .writer
        .create_order("u1", BigDecimal::from(25))
        .await
        .unwrap();
    h.wait_for_status("u1", id, OrderStatus::Debited).await;

    assert_eq!(h.payments.balance("u1").await, Some(BigDecimal::from(75)));
    let entry = h.orders.find_outbox_entry(id).await.unwrap().unwrap();
    assert!(entry.attempts >= 3);
    stop(trigger, tasks).await;
}

#[tokio::test]
async fn debit_that_never_commits_settles_as_failed() {
    let h = Harness::new();
    h.fund("u1", "100").await;
    h.payments.fail_next_debits(10).await;
    let (trigger, tasks) = h.start(true).await;

    let id = h
        .writer
        .create_order("u1", BigDecimal::from(40))
        .await
        .unwrap();
    h.wait_for_status("u1", id, OrderStatus::Failed).await;

    assert_eq!(h.payments.balance("u1").await, Some(BigDecimal::from(100)));
    assert_eq!(h.payments.ledger_len().await, 0);
    assert!(!h.payments.is_processed(id).await.unwrap());
    stop(trigger, tasks).await;
}
