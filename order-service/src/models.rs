use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::deserialize::{self, FromSql, FromSqlRow};
use diesel::expression::AsExpression;
use diesel::pg::{Pg, PgValue};
use diesel::prelude::*;
use diesel::serialize::{self, Output, ToSql};
use diesel::sql_types::Text;
use serde::{Deserialize, Serialize};
use shared::Error;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsExpression, FromSqlRow)]
#[diesel(sql_type = Text)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Created,
    Debited,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Created => "created",
            OrderStatus::Debited => "debited",
            OrderStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Created)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(OrderStatus::Created),
            "debited" => Ok(OrderStatus::Debited),
            "failed" => Ok(OrderStatus::Failed),
            other => Err(Error::InvalidInput(format!("unknown order status '{}'", other))),
        }
    }
}

impl ToSql<Text, Pg> for OrderStatus {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        <str as ToSql<Text, Pg>>::to_sql(self.as_str(), out)
    }
}

impl FromSql<Text, Pg> for OrderStatus {
    fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
        let raw = <String as FromSql<Text, Pg>>::from_sql(bytes)?;
        Ok(raw.parse::<OrderStatus>()?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsExpression, FromSqlRow)]
#[diesel(sql_type = Text)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Pending,
    Dispatched,
}

impl DispatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchStatus::Pending => "pending",
            DispatchStatus::Dispatched => "dispatched",
        }
    }
}

impl FromStr for DispatchStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DispatchStatus::Pending),
            "dispatched" => Ok(DispatchStatus::Dispatched),
            other => Err(Error::InvalidInput(format!("unknown dispatch status '{}'", other))),
        }
    }
}

impl ToSql<Text, Pg> for DispatchStatus {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        <str as ToSql<Text, Pg>>::to_sql(self.as_str(), out)
    }
}

impl FromSql<Text, Pg> for DispatchStatus {
    fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
        let raw = <String as FromSql<Text, Pg>>::from_sql(bytes)?;
        Ok(raw.parse::<DispatchStatus>()?)
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize)]
#[diesel(table_name = crate::schema::orders)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Order {
    pub transaction_id: Uuid,
    pub user_id: String,
    pub amount: BigDecimal,
    pub order_status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::orders)]
pub struct NewOrder {
    pub transaction_id: Uuid,
    pub user_id: String,
    pub amount: BigDecimal,
    pub order_status: OrderStatus,
}

/// Relay bookkeeping travels with the payload so a sweep never re-reads the order.
#[derive(Debug, Clone, PartialEq, Queryable, Selectable)]
#[diesel(table_name = crate::schema::transaction_outbox)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct OutboxEntry {
    pub transaction_id: Uuid,
    pub user_id: String,
    pub amount: BigDecimal,
    pub dispatch_status: DispatchStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub next_attempt_at: DateTime<Utc>,
    pub claimed_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::transaction_outbox)]
pub struct NewOutboxEntry {
    pub transaction_id: Uuid,
    pub user_id: String,
    pub amount: BigDecimal,
    pub dispatch_status: DispatchStatus,
}

impl NewOrder {
    /// The order row and the outbox row that must be written together.
    pub fn with_outbox(
        transaction_id: Uuid,
        user_id: String,
        amount: BigDecimal,
    ) -> (NewOrder, NewOutboxEntry) {
        let entry = NewOutboxEntry {
            transaction_id,
            user_id: user_id.clone(),
            amount: amount.clone(),
            dispatch_status: DispatchStatus::Pending,
        };
        let order = NewOrder {
            transaction_id,
            user_id,
            amount,
            order_status: OrderStatus::Created,
        };
        (order, entry)
    }
}
