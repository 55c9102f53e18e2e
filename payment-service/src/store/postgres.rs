use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::pooled_connection::bb8::{Pool, PooledConnection};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use num_traits::Zero;
use shared::{validate_amount, validate_user_id, Error, Result, TransactionMessage};
use uuid::Uuid;

use super::{DebitOutcome, DebitRejection, PaymentStore};
use crate::ledger;
use crate::models::*;
use crate::schema::*;

pub type DbPool = Pool<AsyncPgConnection>;

#[derive(Clone)]
pub struct PgPaymentStore {
    pool: DbPool,
}

impl PgPaymentStore {
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
impl PaymentStore for PgPaymentStore {
    async fn apply_debit(
        &self,
        message: &TransactionMessage,
        allow_overdraft: bool,
    ) -> Result<DebitOutcome> {
        let mut conn = self.conn().await?;
        let message = message.clone();

        conn.build_transaction()
            .serializable()
            .run::<_, Error, _>(|conn| {
                Box::pin(async move {
                    let rejected = rejected_transactions::table
                        .find(message.transaction_id)
                        .select(rejected_transactions::reason)
                        .first::<String>(conn)
                        .await
                        .optional()?;
                    if let Some(reason) = rejected {
                        return Ok(DebitOutcome::PreviouslyRejected(reason));
                    }

                    if ledger::exists(conn, message.transaction_id).await? {
                        return Ok(DebitOutcome::AlreadyApplied);
                    }

                    let account = payment_accounts::table.filter(
                        payment_accounts::user_id.eq(message.user_id.as_str()),
                    );
                    let debit = (
                        payment_accounts::balance.eq(payment_accounts::balance - message.amount.clone()),
                        payment_accounts::updated_at.eq(Utc::now()),
                    );
                    let debited = if allow_overdraft {
                        diesel::update(account).set(debit).execute(conn).await?
                    } else {
                        diesel::update(
                            account.filter(payment_accounts::balance.ge(message.amount.clone())),
                        )
                        .set(debit)
                        .execute(conn)
                        .await?
                    };

                    if debited == 0 {
                        let has_account = diesel::select(diesel::dsl::exists(
                            payment_accounts::table.find(message.user_id.as_str()),
                        ))
                        .get_result::<bool>(conn)
                        .await?;
                        let rejection = if has_account {
                            DebitRejection::InsufficientFunds
                        } else {
                            DebitRejection::AccountNotFound
                        };
                        return Ok(DebitOutcome::Rejected(rejection));
                    }

                    ledger::record(conn, &message).await?;
                    Ok(DebitOutcome::Applied)
                })
            })
            .await
    }

    async fn record_rejection(&self, transaction_id: Uuid, reason: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let reason = reason.to_string();

        // Serializable, like the debit, so a rejection and a debit of the same id
        // racing on two consumers cannot both commit.
        conn.build_transaction()
            .serializable()
            .run::<_, Error, _>(|conn| {
                Box::pin(async move {
                    if ledger::exists(conn, transaction_id).await? {
                        return Ok(false);
                    }
                    diesel::insert_into(rejected_transactions::table)
                        .values(NewRejectedTransaction {
                            transaction_id,
                            reason: &reason,
                        })
                        .on_conflict_do_nothing()
                        .execute(conn)
                        .await?;
                    Ok(true)
                })
            })
            .await
    }

    async fn is_processed(&self, transaction_id: Uuid) -> Result<bool> {
        let mut conn = self.conn().await?;
        let processed = diesel::select(diesel::dsl::exists(
            processed_transactions::table.find(transaction_id),
        ))
        .get_result(&mut conn)
        .await?;
        Ok(processed)
    }

    async fn create_account(&self, user_id: &str) -> Result<Account> {
        validate_user_id(user_id)?;
        let mut conn = self.conn().await?;

        let account = diesel::insert_into(payment_accounts::table)
            .values(NewAccount {
                user_id,
                balance: BigDecimal::zero(),
            })
            .returning(Account::as_returning())
            .get_result(&mut conn)
            .await?;
        Ok(account)
    }

    async fn find_account(&self, user_id: &str) -> Result<Option<Account>> {
        let mut conn = self.conn().await?;

        let account = payment_accounts::table
            .find(user_id)
            .select(Account::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(account)
    }

    async fn deposit(&self, user_id: &str, amount: &BigDecimal) -> Result<Account> {
        validate_amount(amount)?;
        let mut conn = self.conn().await?;

        diesel::update(payment_accounts::table.find(user_id))
            .set((
                payment_accounts::balance.eq(payment_accounts::balance + amount.clone()),
                payment_accounts::updated_at.eq(Utc::now()),
            ))
            .returning(Account::as_returning())
            .get_result(&mut conn)
            .await
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("account {}", user_id)))
    }
}
