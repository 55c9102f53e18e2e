//! Idempotency ledger: the durable set of transaction ids whose debit has been
//! applied.
//!
//! Both operations take the connection of an open transaction. They are only
//! meaningful composed with the balance update in that same transaction; calling
//! them on their own reopens the race the ledger exists to close.
//!
//! Entries are never deleted. Pruning is a deployment decision left for later.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::QueryResult;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use shared::TransactionMessage;
use std::collections::HashMap;
use uuid::Uuid;

use crate::models::{NewProcessedTransaction, ProcessedTransaction};
use crate::schema::processed_transactions;

pub async fn exists(conn: &mut AsyncPgConnection, transaction_id: Uuid) -> QueryResult<bool> {
    diesel::select(diesel::dsl::exists(
        processed_transactions::table.find(transaction_id),
    ))
    .get_result(conn)
    .await
}

/// Inserts the entry. A concurrent duplicate fails with a unique violation, which
/// rolls back the enclosing transaction, debit included.
pub async fn record(conn: &mut AsyncPgConnection, message: &TransactionMessage) -> QueryResult<()> {
    diesel::insert_into(processed_transactions::table)
        .values(NewProcessedTransaction {
            transaction_id: message.transaction_id,
            user_id: &message.user_id,
            amount: message.amount.clone(),
        })
        .execute(conn)
        .await?;
    Ok(())
}

/// The same set held in memory, for the in-memory payment store.
#[derive(Debug, Default, Clone)]
pub struct MemoryLedger {
    entries: HashMap<Uuid, ProcessedTransaction>,
}

impl MemoryLedger {
    pub fn exists(&self, transaction_id: Uuid) -> bool {
        self.entries.contains_key(&transaction_id)
    }

    /// Returns false if the id was already present.
    pub fn record(&mut self, message: &TransactionMessage, now: DateTime<Utc>) -> bool {
        if self.exists(message.transaction_id) {
            return false;
        }
        self.entries.insert(
            message.transaction_id,
            ProcessedTransaction {
                transaction_id: message.transaction_id,
                user_id: message.user_id.clone(),
                amount: message.amount.clone(),
                processed_at: now,
            },
        );
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
