use shared::bus::settle;
use shared::{
    Backoff, DebitResult, Delivery, Disposition, Heartbeat, Publisher, Shutdown, Subscription,
    TransactionMessage,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::store::{DebitOutcome, SharedPaymentStore};

pub const CONSUMER_GROUP: &str = "payment-service";

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub result_topic: String,
    /// Deliveries of one transaction that may be rejected or fail before it is
    /// given up on and reported failed.
    pub max_delivery_attempts: u32,
    pub allow_overdraft: bool,
    pub backoff: Backoff,
    pub publish_timeout: Duration,
    /// Attempt counts not touched for this long are forgotten, so transactions
    /// that stop arriving here (their partition moved to another member) do not
    /// pile up.
    pub attempts_ttl: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            result_topic: shared::RESULT_TOPIC.to_string(),
            max_delivery_attempts: 5,
            allow_overdraft: false,
            backoff: Backoff::default(),
            publish_timeout: Duration::from_secs(5),
            attempts_ttl: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Attempts {
    count: u32,
    last_seen: Instant,
}

/// Applies debit requests exactly once.
///
/// A delivery is acknowledged only after its debit (or its tombstone) has
/// committed and the outcome has been published. Anything short of that asks the
/// broker for redelivery; the ledger turns the replay into a no-op.
pub struct BalanceConsumer {
    store: SharedPaymentStore,
    publisher: Arc<dyn Publisher>,
    config: ConsumerConfig,
    heartbeat: Heartbeat,
    attempts: Mutex<HashMap<Uuid, Attempts>>,
    idle_beat: Duration,
}

impl BalanceConsumer {
    pub fn new(
        store: SharedPaymentStore,
        publisher: Arc<dyn Publisher>,
        config: ConsumerConfig,
        heartbeat: Heartbeat,
    ) -> Self {
        Self {
            store,
            publisher,
            config,
            heartbeat,
            attempts: Mutex::new(HashMap::new()),
            idle_beat: Duration::from_secs(5),
        }
    }

    pub async fn run<S: Subscription>(&self, mut subscription: S, mut shutdown: Shutdown) {
        let mut consecutive_failures = 0u32;
        info!(result_topic = %self.config.result_topic, "Balance consumer started");

        loop {
            self.heartbeat.beat();
            let next = tokio::select! {
                _ = shutdown.wait() => break,
                _ = time::sleep(self.idle_beat) => continue,
                next = subscription.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    consecutive_failures += 1;
                    error!("Error receiving transaction: {}", e);
                    time::sleep(self.config.backoff.delay(consecutive_failures)).await;
                    continue;
                }
                None => break,
            };

            let disposition = self.handle(&delivery).await;
            if disposition == Disposition::Redeliver {
                consecutive_failures += 1;
                time::sleep(self.config.backoff.delay(consecutive_failures)).await;
            } else {
                consecutive_failures = 0;
            }

            if let Err(e) = settle(&mut subscription, &delivery, disposition).await {
                error!(offset = delivery.offset, "Error settling transaction: {}", e);
            }
        }

        info!("Balance consumer stopped");
    }

    pub async fn handle(&self, delivery: &Delivery) -> Disposition {
        let message = match TransactionMessage::decode(&delivery.payload) {
            Ok(message) => message,
            Err(e) => {
                error!(offset = delivery.offset, "Dropping malformed transaction: {}", e);
                return Disposition::Ack;
            }
        };
        let transaction_id = message.transaction_id;

        let result = match self
            .store
            .apply_debit(&message, self.config.allow_overdraft)
            .await
        {
            Ok(DebitOutcome::Applied) => {
                info!(%transaction_id, user_id = %message.user_id, amount = %message.amount, "Balance debited");
                self.attempts.lock().await.remove(&transaction_id);
                DebitResult::debited(transaction_id)
            }
            Ok(DebitOutcome::AlreadyApplied) => {
                debug!(%transaction_id, "Duplicate transaction, debit already applied");
                self.attempts.lock().await.remove(&transaction_id);
                DebitResult::debited(transaction_id)
            }
            Ok(DebitOutcome::PreviouslyRejected(reason)) => {
                debug!(%transaction_id, %reason, "Duplicate transaction, already rejected");
                DebitResult::failed(transaction_id, reason)
            }
            Ok(DebitOutcome::Rejected(rejection)) => {
                match self.give_up(transaction_id, &rejection.to_string(), false).await {
                    Some(result) => result,
                    None => return Disposition::Redeliver,
                }
            }
            Err(e) => {
                let permanent = !e.is_transient();
                match self.give_up(transaction_id, &e.to_string(), permanent).await {
                    Some(result) => result,
                    None => return Disposition::Redeliver,
                }
            }
        };

        self.publish_result(&result).await
    }

    /// Number of transactions with a pending attempt count.
    pub async fn tracked_attempts(&self) -> usize {
        self.attempts.lock().await.len()
    }

    /// Counts a failed attempt. Returns the result to report once the attempts
    /// are used up (or the failure is `permanent`) and the transaction has been
    /// tombstoned, `None` while it should still be retried.
    async fn give_up(
        &self,
        transaction_id: Uuid,
        reason: &str,
        permanent: bool,
    ) -> Option<DebitResult> {
        let attempt = {
            let now = Instant::now();
            let ttl = self.config.attempts_ttl;
            let mut attempts = self.attempts.lock().await;
            attempts.retain(|id, seen| {
                *id == transaction_id || now.duration_since(seen.last_seen) <= ttl
            });

            let entry = attempts.entry(transaction_id).or_insert(Attempts {
                count: 0,
                last_seen: now,
            });
            entry.count += 1;
            entry.last_seen = now;
            entry.count
        };

        if !permanent && attempt < self.config.max_delivery_attempts {
            warn!(%transaction_id, attempt, %reason, "Debit not applied, will retry");
            return None;
        }

        match self.store.record_rejection(transaction_id, reason).await {
            Ok(true) => {
                warn!(%transaction_id, attempt, %reason, "Giving up on transaction");
                self.attempts.lock().await.remove(&transaction_id);
                Some(DebitResult::failed(transaction_id, reason))
            }
            Ok(false) => {
                // A concurrent delivery got the debit in first.
                self.attempts.lock().await.remove(&transaction_id);
                Some(DebitResult::debited(transaction_id))
            }
            Err(e) => {
                error!(%transaction_id, "Failed to record rejection, will retry: {}", e);
                None
            }
        }
    }

    async fn publish_result(&self, result: &DebitResult) -> Disposition {
        let transaction_id = result.transaction_id;
        let payload = match result.encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!(%transaction_id, "Failed to encode debit result: {}", e);
                return Disposition::Redeliver;
            }
        };

        let published = match time::timeout(
            self.config.publish_timeout,
            self.publisher
                .publish(&self.config.result_topic, &result.key(), &payload),
        )
        .await
        {
            Ok(published) => published,
            Err(_) => Err(shared::Error::Delivery(format!(
                "publish timed out after {:?}",
                self.config.publish_timeout
            ))),
        };

        match published {
            Ok(()) => Disposition::Ack,
            Err(e) => {
                warn!(%transaction_id, "Failed to publish debit result, will redeliver: {}", e);
                Disposition::Redeliver
            }
        }
    }
}
