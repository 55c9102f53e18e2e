use chrono::{DateTime, Utc};
use shared::{Backoff, Heartbeat, Publisher, Result, Shutdown, TransactionMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::models::{DispatchStatus, OutboxEntry};
use crate::store::SharedOrderStore;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub topic: String,
    pub interval: Duration,
    pub batch_size: i64,
    pub publish_timeout: Duration,
    /// How long a claim keeps other relays away from an entry. Must exceed
    /// `publish_timeout`.
    pub claim_ttl: Duration,
    pub backoff: Backoff,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            topic: shared::TRANSACTION_TOPIC.to_string(),
            interval: Duration::from_secs(1),
            batch_size: 100,
            publish_timeout: Duration::from_secs(5),
            claim_ttl: Duration::from_secs(30),
            backoff: Backoff::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Dispatched,
    /// Already dispatched, or claimed by someone else.
    Skipped,
    /// Publish failed; the entry stays pending and is retried after backoff.
    Retrying { attempt: i32, error: String },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub dispatched: usize,
    pub retrying: usize,
    pub skipped: usize,
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Moves pending outbox entries onto the broker.
///
/// An entry is marked dispatched only after the publisher has confirmed the
/// broker accepted the message. Every failure leaves the entry pending with a
/// later `next_attempt_at`; entries are never abandoned.
pub struct OutboxRelay {
    store: SharedOrderStore,
    publisher: Arc<dyn Publisher>,
    config: RelayConfig,
    heartbeat: Heartbeat,
}

impl OutboxRelay {
    pub fn new(
        store: SharedOrderStore,
        publisher: Arc<dyn Publisher>,
        config: RelayConfig,
        heartbeat: Heartbeat,
    ) -> Self {
        Self {
            store,
            publisher,
            config,
            heartbeat,
        }
    }

    pub async fn run(&self, mut shutdown: Shutdown) {
        let mut interval = time::interval(self.config.interval);
        info!(topic = %self.config.topic, "Event relay started");

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = interval.tick() => {}
            }
            self.heartbeat.beat();

            match self.sweep().await {
                Ok(report) if report.dispatched > 0 || report.retrying > 0 => {
                    info!(
                        dispatched = report.dispatched,
                        retrying = report.retrying,
                        "Outbox sweep finished"
                    );
                }
                Ok(_) => {}
                Err(e) => error!("Error sweeping outbox: {}", e),
            }
        }

        info!("Event relay stopped");
    }

    /// Dispatches every due pending entry. A failing entry does not stop the sweep.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let due = self
            .store
            .due_outbox_entries(Utc::now(), self.config.batch_size)
            .await?;

        let mut report = SweepReport::default();
        for entry in due {
            let transaction_id = entry.transaction_id;
            match self.dispatch_entry(entry).await {
                Ok(DispatchOutcome::Dispatched) => report.dispatched += 1,
                Ok(DispatchOutcome::Retrying { .. }) => report.retrying += 1,
                Ok(DispatchOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    report.retrying += 1;
                    error!(%transaction_id, "Failed to relay outbox entry: {}", e);
                }
            }
        }
        Ok(report)
    }

    /// Fast path used right after an order is written. Best effort; the sweep
    /// covers anything this misses.
    pub async fn dispatch(&self, transaction_id: Uuid) -> Result<DispatchOutcome> {
        match self.store.find_outbox_entry(transaction_id).await? {
            Some(entry) if entry.dispatch_status == DispatchStatus::Pending => {
                self.dispatch_entry(entry).await
            }
            _ => Ok(DispatchOutcome::Skipped),
        }
    }

    async fn dispatch_entry(&self, entry: OutboxEntry) -> Result<DispatchOutcome> {
        let transaction_id = entry.transaction_id;
        let now = Utc::now();

        let claimed = self
            .store
            .claim_outbox_entry(transaction_id, now, after(now, self.config.claim_ttl))
            .await?;
        if !claimed {
            debug!(%transaction_id, "Outbox entry dispatched or claimed elsewhere");
            return Ok(DispatchOutcome::Skipped);
        }

        let message = TransactionMessage::new(transaction_id, entry.user_id, entry.amount);
        let payload = message.encode()?;

        let published = match time::timeout(
            self.config.publish_timeout,
            self.publisher
                .publish(&self.config.topic, &message.key(), &payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(shared::Error::Delivery(format!(
                "publish timed out after {:?}",
                self.config.publish_timeout
            ))),
        };

        if let Err(e) = published {
            let attempt = entry.attempts + 1;
            let delay = self
                .config
                .backoff
                .delay(u32::try_from(attempt).unwrap_or(u32::MAX));
            let error = e.to_string();
            self.store
                .record_dispatch_failure(transaction_id, &error, after(Utc::now(), delay))
                .await?;
            warn!(%transaction_id, attempt, ?delay, "Publish failed, will retry: {}", error);
            return Ok(DispatchOutcome::Retrying { attempt, error });
        }

        // A crash or store error here leaves the entry pending; once the claim
        // expires it is published again and the consumer's ledger absorbs the duplicate.
        if self.store.mark_dispatched(transaction_id, Utc::now()).await? {
            info!(%transaction_id, "Published outbox entry");
            Ok(DispatchOutcome::Dispatched)
        } else {
            Ok(DispatchOutcome::Skipped)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryOrderStore, OrderStore};
    use crate::writer::OutboxWriter;
    use bigdecimal::BigDecimal;
    use shared::bus::memory::InMemoryBus;
    use std::str::FromStr;

    struct Fixture {
        store: Arc<InMemoryOrderStore>,
        bus: InMemoryBus,
        relay: OutboxRelay,
        writer: OutboxWriter,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryOrderStore::new());
        let bus = InMemoryBus::new();
        let config = RelayConfig {
            backoff: Backoff::immediate(),
            ..RelayConfig::default()
        };
        let relay = OutboxRelay::new(
            store.clone(),
            Arc::new(bus.clone()),
            config,
            Heartbeat::new("relay"),
        );
        let writer = OutboxWriter::new(store.clone());
        Fixture {
            store,
            bus,
            relay,
            writer,
        }
    }

    #[tokio::test]
    async fn publishes_then_marks_dispatched() {
        let f = fixture();
        let id = f
            .writer
            .create_order("u1", BigDecimal::from_str("50.0").unwrap())
            .await
            .unwrap();

        let report = f.relay.sweep().await.unwrap();
        assert_eq!(report.dispatched, 1);

        let messages = f.bus.messages(shared::TRANSACTION_TOPIC).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].key.as_deref(), Some(id.to_string().as_str()));
        let message = TransactionMessage::decode(&messages[0].payload).unwrap();
        assert_eq!(message.transaction_id, id);
        assert_eq!(message.user_id, "u1");
        assert_eq!(message.amount, BigDecimal::from(50));

        let entry = f.store.find_outbox_entry(id).await.unwrap().unwrap();
        assert_eq!(entry.dispatch_status, DispatchStatus::Dispatched);
        assert!(entry.dispatched_at.is_some());
    }

    #[tokio::test]
    async fn failed_publish_keeps_entry_pending_and_retries() {
        let f = fixture();
        let id = f.writer.create_order("u1", BigDecimal::from(5)).await.unwrap();
        f.bus.fail_next_publishes(2).await;

        for expected_attempt in 1..=2 {
            let outcome = f.relay.dispatch(id).await.unwrap();
            assert!(
                matches!(outcome, DispatchOutcome::Retrying { attempt, .. } if attempt == expected_attempt)
            );
            let entry = f.store.find_outbox_entry(id).await.unwrap().unwrap();
            assert_eq!(entry.dispatch_status, DispatchStatus::Pending);
            assert_eq!(entry.attempts, expected_attempt);
            assert!(entry.last_error.is_some());
            assert!(f.bus.messages(shared::TRANSACTION_TOPIC).await.is_empty());
        }

        let report = f.relay.sweep().await.unwrap();
        assert_eq!(report.dispatched, 1);
        let entry = f.store.find_outbox_entry(id).await.unwrap().unwrap();
        assert_eq!(entry.dispatch_status, DispatchStatus::Dispatched);
        assert_eq!(f.bus.messages(shared::TRANSACTION_TOPIC).await.len(), 1);
    }

    #[tokio::test]
    async fn dispatched_entry_is_not_published_again() {
        let f = fixture();
        let id = f.writer.create_order("u1", BigDecimal::from(5)).await.unwrap();

        assert_eq!(f.relay.dispatch(id).await.unwrap(), DispatchOutcome::Dispatched);
        assert_eq!(f.relay.dispatch(id).await.unwrap(), DispatchOutcome::Skipped);
        assert_eq!(f.relay.sweep().await.unwrap(), SweepReport::default());
        assert_eq!(f.bus.messages(shared::TRANSACTION_TOPIC).await.len(), 1);
    }

    #[tokio::test]
    async fn lost_dispatch_mark_causes_a_duplicate_publish_not_a_loss() {
        let f = fixture();
        let id = f.writer.create_order("u1", BigDecimal::from(5)).await.unwrap();
        f.store.fail_next_dispatch_marks(1).await;

        assert!(f.relay.dispatch(id).await.is_err());
        let entry = f.store.find_outbox_entry(id).await.unwrap().unwrap();
        assert_eq!(entry.dispatch_status, DispatchStatus::Pending);

        // still claimed by the relay that "crashed"
        assert_eq!(f.relay.sweep().await.unwrap().dispatched, 0);

        f.store.expire_claim(id).await;
        assert_eq!(f.relay.sweep().await.unwrap().dispatched, 1);
        assert_eq!(f.bus.messages(shared::TRANSACTION_TOPIC).await.len(), 2);
    }

    #[tokio::test]
    async fn one_failing_entry_does_not_block_the_others() {
        let f = fixture();
        let first = f.writer.create_order("u1", BigDecimal::from(1)).await.unwrap();
        let second = f.writer.create_order("u2", BigDecimal::from(2)).await.unwrap();
        f.bus.fail_next_publishes(1).await;

        let report = f.relay.sweep().await.unwrap();
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.retrying, 1);

        f.relay.sweep().await.unwrap();
        for id in [first, second] {
            let entry = f.store.find_outbox_entry(id).await.unwrap().unwrap();
            assert_eq!(entry.dispatch_status, DispatchStatus::Dispatched);
        }
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let f = fixture();
        let id = f.writer.create_order("u1", BigDecimal::from(1)).await.unwrap();
        let (trigger, shutdown) = shared::shutdown::channel();
        let relay = Arc::new(f.relay);

        let handle = {
            let relay = relay.clone();
            tokio::spawn(async move { relay.run(shutdown).await })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let entry = f.store.find_outbox_entry(id).await.unwrap().unwrap();
                if entry.dispatch_status == DispatchStatus::Dispatched {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("relay loop should dispatch the entry");

        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("relay loop should stop")
            .unwrap();
    }
}
