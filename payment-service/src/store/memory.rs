//! Payment store kept in process memory, with failure injection for tests.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::Utc;
use num_traits::Zero;
use shared::{validate_amount, validate_user_id, Error, Result, TransactionMessage};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{DebitOutcome, DebitRejection, PaymentStore};
use crate::ledger::MemoryLedger;
use crate::models::Account;

#[derive(Default)]
struct State {
    accounts: HashMap<String, Account>,
    ledger: MemoryLedger,
    rejected: HashMap<Uuid, String>,
    fail_debits: u32,
    debit_error: Option<Error>,
    debits_applied: usize,
}

#[derive(Default)]
pub struct InMemoryPaymentStore {
    state: Mutex<State>,
}

impl InMemoryPaymentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` debit transactions fail with a persistence error and
    /// roll back.
    pub async fn fail_next_debits(&self, count: u32) {
        let error = Error::Persistence("debit transaction rolled back".to_string());
        self.fail_next_debits_with(count, error).await;
    }

    /// Like `fail_next_debits`, failing with `error` instead.
    pub async fn fail_next_debits_with(&self, count: u32, error: Error) {
        let mut state = self.state.lock().await;
        state.fail_debits = count;
        state.debit_error = Some(error);
    }

    pub async fn ledger_len(&self) -> usize {
        self.state.lock().await.ledger.len()
    }

    /// Number of balance debits ever applied, across all accounts.
    pub async fn debits_applied(&self) -> usize {
        self.state.lock().await.debits_applied
    }

    pub async fn balance(&self, user_id: &str) -> Option<BigDecimal> {
        self.state
            .lock()
            .await
            .accounts
            .get(user_id)
            .map(|account| account.balance.clone())
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn apply_debit(
        &self,
        message: &TransactionMessage,
        allow_overdraft: bool,
    ) -> Result<DebitOutcome> {
        let mut state = self.state.lock().await;

        if state.fail_debits > 0 {
            state.fail_debits -= 1;
            let error = state.debit_error.clone().unwrap_or_else(|| {
                Error::Persistence("debit transaction rolled back".to_string())
            });
            return Err(error);
        }
        if let Some(reason) = state.rejected.get(&message.transaction_id) {
            return Ok(DebitOutcome::PreviouslyRejected(reason.clone()));
        }
        if state.ledger.exists(message.transaction_id) {
            return Ok(DebitOutcome::AlreadyApplied);
        }

        let now = Utc::now();
        let Some(account) = state.accounts.get_mut(&message.user_id) else {
            return Ok(DebitOutcome::Rejected(DebitRejection::AccountNotFound));
        };
        if !allow_overdraft && account.balance < message.amount {
            return Ok(DebitOutcome::Rejected(DebitRejection::InsufficientFunds));
        }
        account.balance -= message.amount.clone();
        account.updated_at = now;

        state.ledger.record(message, now);
        state.debits_applied += 1;
        Ok(DebitOutcome::Applied)
    }

    async fn record_rejection(&self, transaction_id: Uuid, reason: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.ledger.exists(transaction_id) {
            return Ok(false);
        }
        state
            .rejected
            .entry(transaction_id)
            .or_insert_with(|| reason.to_string());
        Ok(true)
    }

    async fn is_processed(&self, transaction_id: Uuid) -> Result<bool> {
        Ok(self.state.lock().await.ledger.exists(transaction_id))
    }

    async fn create_account(&self, user_id: &str) -> Result<Account> {
        validate_user_id(user_id)?;
        let mut state = self.state.lock().await;
        if state.accounts.contains_key(user_id) {
            return Err(Error::Conflict(format!("account {} already exists", user_id)));
        }
        let now = Utc::now();
        let account = Account {
            user_id: user_id.to_string(),
            balance: BigDecimal::zero(),
            created_at: now,
            updated_at: now,
        };
        state.accounts.insert(user_id.to_string(), account.clone());
        Ok(account)
    }

    async fn find_account(&self, user_id: &str) -> Result<Option<Account>> {
        Ok(self.state.lock().await.accounts.get(user_id).cloned())
    }

    async fn deposit(&self, user_id: &str, amount: &BigDecimal) -> Result<Account> {
        validate_amount(amount)?;
        let mut state = self.state.lock().await;
        let account = state
            .accounts
            .get_mut(user_id)
            .ok_or_else(|| Error::NotFound(format!("account {}", user_id)))?;
        account.balance += amount.clone();
        account.updated_at = Utc::now();
        Ok(account.clone())
    }
}
