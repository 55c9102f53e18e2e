//! Payment-side persistence: balances, the idempotency ledger and rejection
//! tombstones.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use shared::{Result, TransactionMessage};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::Account;

pub use memory::InMemoryPaymentStore;
pub use postgres::PgPaymentStore;

pub type SharedPaymentStore = Arc<dyn PaymentStore>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebitRejection {
    AccountNotFound,
    InsufficientFunds,
}

impl fmt::Display for DebitRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DebitRejection::AccountNotFound => f.write_str("account not found"),
            DebitRejection::InsufficientFunds => f.write_str("insufficient funds"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebitOutcome {
    /// Debit and ledger entry committed together.
    Applied,
    /// The ledger already holds the transaction; nothing was changed.
    AlreadyApplied,
    /// The transaction was given up on earlier; nothing was changed.
    PreviouslyRejected(String),
    /// The debit cannot be applied right now; nothing was changed.
    Rejected(DebitRejection),
}

#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Checks the ledger, debits and records the transaction in one local
    /// transaction. Either both the debit and the ledger entry commit or neither does.
    async fn apply_debit(
        &self,
        message: &TransactionMessage,
        allow_overdraft: bool,
    ) -> Result<DebitOutcome>;

    /// Tombstones a transaction that will not be debited. Returns false, writing
    /// nothing, if the debit has in fact been applied.
    async fn record_rejection(&self, transaction_id: Uuid, reason: &str) -> Result<bool>;

    async fn is_processed(&self, transaction_id: Uuid) -> Result<bool>;

    async fn create_account(&self, user_id: &str) -> Result<Account>;

    async fn find_account(&self, user_id: &str) -> Result<Option<Account>>;

    /// Atomic increment; commutes with concurrent debits.
    async fn deposit(&self, user_id: &str, amount: &BigDecimal) -> Result<Account>;
}
