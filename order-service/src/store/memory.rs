//! Order store kept in process memory, with failure injection for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{Error, Result};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{OrderStore, StatusTransition};
use crate::models::*;

#[derive(Default)]
struct State {
    orders: HashMap<Uuid, Order>,
    outbox: HashMap<Uuid, OutboxEntry>,
    fail_outbox_inserts: u32,
    fail_status_updates: u32,
    fail_dispatch_marks: u32,
}

#[derive(Default)]
pub struct InMemoryOrderStore {
    state: Mutex<State>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` order writes fail after the order row is staged but before
    /// the outbox row is, so the whole unit must be discarded.
    pub async fn fail_next_outbox_inserts(&self, count: u32) {
        self.state.lock().await.fail_outbox_inserts = count;
    }

    pub async fn fail_next_status_updates(&self, count: u32) {
        self.state.lock().await.fail_status_updates = count;
    }

    pub async fn fail_next_dispatch_marks(&self, count: u32) {
        self.state.lock().await.fail_dispatch_marks = count;
    }

    pub async fn order_count(&self) -> usize {
        self.state.lock().await.orders.len()
    }

    pub async fn outbox_count(&self) -> usize {
        self.state.lock().await.outbox.len()
    }

    /// Drops any claim on the entry, as if the claiming relay had died and its lease
    /// had run out.
    pub async fn expire_claim(&self, transaction_id: Uuid) {
        if let Some(entry) = self.state.lock().await.outbox.get_mut(&transaction_id) {
            entry.claimed_until = None;
        }
    }
}

fn claimable(entry: &OutboxEntry, now: DateTime<Utc>) -> bool {
    entry.dispatch_status == DispatchStatus::Pending
        && entry.claimed_until.map_or(true, |until| until < now)
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn insert_order_with_outbox(&self, order: NewOrder, entry: NewOutboxEntry) -> Result<()> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        if state.orders.contains_key(&order.transaction_id)
            || state.outbox.contains_key(&entry.transaction_id)
        {
            return Err(Error::Conflict(format!(
                "transaction {} already exists",
                order.transaction_id
            )));
        }

        let staged_order = Order {
            transaction_id: order.transaction_id,
            user_id: order.user_id,
            amount: order.amount,
            order_status: order.order_status,
            created_at: now,
            updated_at: now,
        };

        if state.fail_outbox_inserts > 0 {
            state.fail_outbox_inserts -= 1;
            return Err(Error::Persistence(
                "outbox insert failed, transaction rolled back".to_string(),
            ));
        }

        let staged_entry = OutboxEntry {
            transaction_id: entry.transaction_id,
            user_id: entry.user_id,
            amount: entry.amount,
            dispatch_status: entry.dispatch_status,
            attempts: 0,
            last_error: None,
            next_attempt_at: now,
            claimed_until: None,
            created_at: now,
            dispatched_at: None,
        };

        state.orders.insert(staged_order.transaction_id, staged_order);
        state.outbox.insert(staged_entry.transaction_id, staged_entry);
        Ok(())
    }

    async fn find_order(&self, user_id: &str, transaction_id: Uuid) -> Result<Option<Order>> {
        let state = self.state.lock().await;
        Ok(state
            .orders
            .get(&transaction_id)
            .filter(|order| order.user_id == user_id)
            .cloned())
    }

    async fn list_orders(&self, user_id: &str) -> Result<Vec<Order>> {
        let state = self.state.lock().await;
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .filter(|order| order.user_id == user_id)
            .cloned()
            .collect();
        orders.sort_by_key(|order| order.created_at);
        Ok(orders)
    }

    async fn find_outbox_entry(&self, transaction_id: Uuid) -> Result<Option<OutboxEntry>> {
        Ok(self.state.lock().await.outbox.get(&transaction_id).cloned())
    }

    async fn due_outbox_entries(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<OutboxEntry>> {
        let state = self.state.lock().await;
        let mut due: Vec<OutboxEntry> = state
            .outbox
            .values()
            .filter(|entry| claimable(entry, now) && entry.next_attempt_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|entry| entry.created_at);
        due.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(due)
    }

    async fn claim_outbox_entry(
        &self,
        transaction_id: Uuid,
        now: DateTime<Utc>,
        claimed_until: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.outbox.get_mut(&transaction_id) {
            Some(entry) if claimable(entry, now) => {
                entry.claimed_until = Some(claimed_until);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_dispatched(&self, transaction_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.fail_dispatch_marks > 0 {
            state.fail_dispatch_marks -= 1;
            return Err(Error::Persistence("outbox update failed".to_string()));
        }
        match state.outbox.get_mut(&transaction_id) {
            Some(entry) if entry.dispatch_status == DispatchStatus::Pending => {
                entry.dispatch_status = DispatchStatus::Dispatched;
                entry.dispatched_at = Some(now);
                entry.claimed_until = None;
                entry.last_error = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_dispatch_failure(
        &self,
        transaction_id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.outbox.get_mut(&transaction_id) {
            if entry.dispatch_status == DispatchStatus::Pending {
                entry.attempts += 1;
                entry.last_error = Some(error.to_string());
                entry.next_attempt_at = next_attempt_at;
                entry.claimed_until = None;
            }
        }
        Ok(())
    }

    async fn transition_status(
        &self,
        transaction_id: Uuid,
        to: OrderStatus,
        now: DateTime<Utc>,
    ) -> Result<StatusTransition> {
        if !to.is_terminal() {
            return Err(Error::InvalidInput(format!("cannot transition an order to {}", to)));
        }
        let mut state = self.state.lock().await;
        if state.fail_status_updates > 0 {
            state.fail_status_updates -= 1;
            return Err(Error::Persistence("order update failed".to_string()));
        }
        let Some(order) = state.orders.get_mut(&transaction_id) else {
            return Ok(StatusTransition::NotFound);
        };
        if order.order_status.is_terminal() {
            return Ok(StatusTransition::AlreadyFinal(order.order_status));
        }
        order.order_status = to;
        order.updated_at = now;
        Ok(StatusTransition::Applied)
    }
}
