use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::payment_accounts)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Account {
    pub user_id: String,
    pub balance: BigDecimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::payment_accounts)]
pub struct NewAccount<'a> {
    pub user_id: &'a str,
    pub balance: BigDecimal,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize)]
#[diesel(table_name = crate::schema::processed_transactions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ProcessedTransaction {
    pub transaction_id: Uuid,
    pub user_id: String,
    pub amount: BigDecimal,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::processed_transactions)]
pub struct NewProcessedTransaction<'a> {
    pub transaction_id: Uuid,
    pub user_id: &'a str,
    pub amount: BigDecimal,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::rejected_transactions)]
pub struct NewRejectedTransaction<'a> {
    pub transaction_id: Uuid,
    pub reason: &'a str,
}
