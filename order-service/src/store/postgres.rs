use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::pooled_connection::bb8::{Pool, PooledConnection};
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use shared::{Error, Result};
use uuid::Uuid;

use super::{OrderStore, StatusTransition};
use crate::models::*;
use crate::schema::*;

pub type DbPool = Pool<AsyncPgConnection>;

#[derive(Clone)]
pub struct PgOrderStore {
    pool: DbPool,
}

impl PgOrderStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<PooledConnection<'_, AsyncPgConnection>> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::Persistence(format!("connection pool: {}", e)))
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn insert_order_with_outbox(&self, order: NewOrder, entry: NewOutboxEntry) -> Result<()> {
        let mut conn = self.conn().await?;

        conn.transaction::<_, Error, _>(|conn| {
            Box::pin(async move {
                diesel::insert_into(orders::table)
                    .values(&order)
                    .execute(conn)
                    .await?;

                diesel::insert_into(transaction_outbox::table)
                    .values(&entry)
                    .execute(conn)
                    .await?;

                Ok(())
            })
        })
        .await
    }

    async fn find_order(&self, user_id: &str, transaction_id: Uuid) -> Result<Option<Order>> {
        let mut conn = self.conn().await?;

        let order = orders::table
            .filter(orders::transaction_id.eq(transaction_id))
            .filter(orders::user_id.eq(user_id))
            .select(Order::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(order)
    }

    async fn list_orders(&self, user_id: &str) -> Result<Vec<Order>> {
        let mut conn = self.conn().await?;

        let orders = orders::table
            .filter(orders::user_id.eq(user_id))
            .order(orders::created_at.asc())
            .select(Order::as_select())
            .load(&mut conn)
            .await?;
        Ok(orders)
    }

    async fn find_outbox_entry(&self, transaction_id: Uuid) -> Result<Option<OutboxEntry>> {
        let mut conn = self.conn().await?;

        let entry = transaction_outbox::table
            .find(transaction_id)
            .select(OutboxEntry::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(entry)
    }

    async fn due_outbox_entries(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<OutboxEntry>> {
        let mut conn = self.conn().await?;

        let entries = transaction_outbox::table
            .filter(transaction_outbox::dispatch_status.eq(DispatchStatus::Pending))
            .filter(transaction_outbox::next_attempt_at.le(now))
            .filter(
                transaction_outbox::claimed_until
                    .is_null()
                    .or(transaction_outbox::claimed_until.lt(now)),
            )
            .order(transaction_outbox::created_at.asc())
            .limit(limit)
            .select(OutboxEntry::as_select())
            .load(&mut conn)
            .await?;
        Ok(entries)
    }

    async fn claim_outbox_entry(
        &self,
        transaction_id: Uuid,
        now: DateTime<Utc>,
        claimed_until: DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.conn().await?;

        let claimed = diesel::update(
            transaction_outbox::table
                .filter(transaction_outbox::transaction_id.eq(transaction_id))
                .filter(transaction_outbox::dispatch_status.eq(DispatchStatus::Pending))
                .filter(
                    transaction_outbox::claimed_until
                        .is_null()
                        .or(transaction_outbox::claimed_until.lt(now)),
                ),
        )
        .set(transaction_outbox::claimed_until.eq(Some(claimed_until)))
        .execute(&mut conn)
        .await?;
        Ok(claimed == 1)
    }

    async fn mark_dispatched(&self, transaction_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.conn().await?;

        let updated = diesel::update(
            transaction_outbox::table
                .filter(transaction_outbox::transaction_id.eq(transaction_id))
                .filter(transaction_outbox::dispatch_status.eq(DispatchStatus::Pending)),
        )
        .set((
            transaction_outbox::dispatch_status.eq(DispatchStatus::Dispatched),
            transaction_outbox::dispatched_at.eq(Some(now)),
            transaction_outbox::claimed_until.eq(None::<DateTime<Utc>>),
            transaction_outbox::last_error.eq(None::<String>),
        ))
        .execute(&mut conn)
        .await?;
        Ok(updated == 1)
    }

    async fn record_dispatch_failure(
        &self,
        transaction_id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.conn().await?;

        diesel::update(
            transaction_outbox::table
                .filter(transaction_outbox::transaction_id.eq(transaction_id))
                .filter(transaction_outbox::dispatch_status.eq(DispatchStatus::Pending)),
        )
        .set((
            transaction_outbox::attempts.eq(transaction_outbox::attempts + 1),
            transaction_outbox::last_error.eq(Some(error)),
            transaction_outbox::next_attempt_at.eq(next_attempt_at),
            transaction_outbox::claimed_until.eq(None::<DateTime<Utc>>),
        ))
        .execute(&mut conn)
        .await?;
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
        let mut conn = self.conn().await?;

        let updated = diesel::update(
            orders::table
                .filter(orders::transaction_id.eq(transaction_id))
                .filter(orders::order_status.eq(OrderStatus::Created)),
        )
        .set((orders::order_status.eq(to), orders::updated_at.eq(now)))
        .execute(&mut conn)
        .await?;

        if updated == 1 {
            return Ok(StatusTransition::Applied);
        }

        let current = orders::table
            .find(transaction_id)
            .select(orders::order_status)
            .first::<OrderStatus>(&mut conn)
            .await
            .optional()?;

        Ok(match current {
            Some(status) => StatusTransition::AlreadyFinal(status),
            None => StatusTransition::NotFound,
        })
    }
}
