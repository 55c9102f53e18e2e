use chrono::Utc;
use shared::bus::settle;
use shared::{
    Backoff, DebitResult, DebitStatus, Delivery, Disposition, Heartbeat, Shutdown, Subscription,
};
use std::time::Duration;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::models::OrderStatus;
use crate::store::{SharedOrderStore, StatusTransition};

pub const RECONCILER_GROUP: &str = "order-service-reconciler";

/// Reflects debit outcomes published by the payment side back onto the order.
///
/// Orders only ever move out of `created`; a second, conflicting result for a
/// settled order is logged and dropped.
pub struct StatusReconciler {
    store: SharedOrderStore,
    backoff: Backoff,
    heartbeat: Heartbeat,
    idle_beat: Duration,
}

impl StatusReconciler {
    pub fn new(store: SharedOrderStore, backoff: Backoff, heartbeat: Heartbeat) -> Self {
        Self {
            store,
            backoff,
            heartbeat,
            idle_beat: Duration::from_secs(5),
        }
    }

    pub async fn run<S: Subscription>(&self, mut subscription: S, mut shutdown: Shutdown) {
        let mut consecutive_failures = 0u32;
        info!("Status reconciler started");

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
                    error!("Error receiving debit result: {}", e);
                    time::sleep(self.backoff.delay(consecutive_failures)).await;
                    continue;
                }
                None => break,
            };

            let disposition = self.handle(&delivery).await;
            if disposition == Disposition::Redeliver {
                consecutive_failures += 1;
                time::sleep(self.backoff.delay(consecutive_failures)).await;
            } else {
                consecutive_failures = 0;
            }

            if let Err(e) = settle(&mut subscription, &delivery, disposition).await {
                error!(offset = delivery.offset, "Error settling debit result: {}", e);
            }
        }

        info!("Status reconciler stopped");
    }

    pub async fn handle(&self, delivery: &Delivery) -> Disposition {
        let result = match DebitResult::decode(&delivery.payload) {
            Ok(result) => result,
            Err(e) => {
                error!(offset = delivery.offset, "Dropping malformed debit result: {}", e);
                return Disposition::Ack;
            }
        };

        let transaction_id = result.transaction_id;
        let target = match result.outcome {
            DebitStatus::Debited => OrderStatus::Debited,
            DebitStatus::Failed => OrderStatus::Failed,
        };

        match self
            .store
            .transition_status(transaction_id, target, Utc::now())
            .await
        {
            Ok(StatusTransition::Applied) => {
                info!(%transaction_id, status = %target, reason = ?result.reason, "Order reconciled");
                Disposition::Ack
            }
            Ok(StatusTransition::AlreadyFinal(current)) if current == target => {
                debug!(%transaction_id, status = %current, "Order already reconciled");
                Disposition::Ack
            }
            Ok(StatusTransition::AlreadyFinal(current)) => {
                warn!(%transaction_id, status = %current, incoming = %target, "Ignoring conflicting debit result");
                Disposition::Ack
            }
            Ok(StatusTransition::NotFound) => {
                warn!(%transaction_id, "Debit result for unknown order");
                Disposition::Ack
            }
            Err(e) => {
                error!(%transaction_id, "Failed to reconcile order, will retry: {}", e);
                Disposition::Redeliver
            }
        }
    }
}
