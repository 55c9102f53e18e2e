//! Order-side persistence: the `orders` table and its `transaction_outbox`.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::Result;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{NewOrder, NewOutboxEntry, Order, OrderStatus, OutboxEntry};

pub use memory::InMemoryOrderStore;
pub use postgres::PgOrderStore;

pub type SharedOrderStore = Arc<dyn OrderStore>;

/// Result of asking to move an order out of `created`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusTransition {
    Applied,
    /// The order had already settled; it keeps the status it has.
    AlreadyFinal(OrderStatus),
    NotFound,
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Writes both rows in one local transaction; on error neither row exists.
    async fn insert_order_with_outbox(&self, order: NewOrder, entry: NewOutboxEntry) -> Result<()>;

    async fn find_order(&self, user_id: &str, transaction_id: Uuid) -> Result<Option<Order>>;

    async fn list_orders(&self, user_id: &str) -> Result<Vec<Order>>;

    async fn find_outbox_entry(&self, transaction_id: Uuid) -> Result<Option<OutboxEntry>>;

    /// Pending entries whose backoff has elapsed and that nobody holds a claim on,
    /// oldest first.
    async fn due_outbox_entries(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<OutboxEntry>>;

    /// Compare-and-set claim on a pending entry. Returns false when the entry is
    /// already dispatched or another relay holds an unexpired claim.
    async fn claim_outbox_entry(
        &self,
        transaction_id: Uuid,
        now: DateTime<Utc>,
        claimed_until: DateTime<Utc>,
    ) -> Result<bool>;

    /// `pending -> dispatched`. Returns false if the entry was not pending.
    async fn mark_dispatched(&self, transaction_id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    /// Releases the claim and schedules the next attempt.
    async fn record_dispatch_failure(
        &self,
        transaction_id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()>;

    /// `created -> to`, never out of a terminal status.
    async fn transition_status(
        &self,
        transaction_id: Uuid,
        to: OrderStatus,
        now: DateTime<Utc>,
    ) -> Result<StatusTransition>;
}
