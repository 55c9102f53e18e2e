use bigdecimal::BigDecimal;
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

pub const TRANSACTION_TOPIC: &str = "payment_transactions";
pub const RESULT_TOPIC: &str = "payment_results";

/// Current version of both message schemas. Messages without a version are read as v1.
pub const MESSAGE_VERSION: u16 = 1;

const MAX_USER_ID_LEN: usize = 255;

fn default_version() -> u16 {
    MESSAGE_VERSION
}

pub fn validate_user_id(user_id: &str) -> Result<()> {
    if user_id.trim().is_empty() {
        return Err(Error::InvalidInput("user_id must not be empty".to_string()));
    }
    if user_id.len() > MAX_USER_ID_LEN {
        return Err(Error::InvalidInput(format!(
            "user_id longer than {} bytes",
            MAX_USER_ID_LEN
        )));
    }
    Ok(())
}

pub fn validate_amount(amount: &BigDecimal) -> Result<()> {
    if *amount <= BigDecimal::zero() {
        return Err(Error::InvalidInput(format!(
            "amount must be positive, got {}",
            amount
        )));
    }
    Ok(())
}

fn check_version(version: u16) -> Result<()> {
    if version != MESSAGE_VERSION {
        return Err(Error::InvalidInput(format!(
            "unsupported message version {}",
            version
        )));
    }
    Ok(())
}

/// Debit request relayed from the order outbox to the payment side.
///
/// `amount` is written as a decimal string so no precision is lost on the wire; a JSON
/// number is accepted on input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionMessage {
    #[serde(default = "default_version")]
    pub version: u16,
    pub transaction_id: Uuid,
    pub user_id: String,
    pub amount: BigDecimal,
}

impl TransactionMessage {
    pub fn new(transaction_id: Uuid, user_id: impl Into<String>, amount: BigDecimal) -> Self {
        Self {
            version: MESSAGE_VERSION,
            transaction_id,
            user_id: user_id.into(),
            amount,
        }
    }

    /// Parses and validates a payload. Any error here is permanent.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let message: Self = serde_json::from_slice(payload)?;
        check_version(message.version)?;
        validate_user_id(&message.user_id)?;
        validate_amount(&message.amount)?;
        Ok(message)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Partition key; keeps every message of one transaction on one partition.
    pub fn key(&self) -> String {
        self.transaction_id.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebitStatus {
    Debited,
    Failed,
}

/// Outcome of a debit, published by the payment side for the status reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebitResult {
    #[serde(default = "default_version")]
    pub version: u16,
    pub transaction_id: Uuid,
    pub outcome: DebitStatus,
    #[serde(default)]
    pub reason: Option<String>,
}

impl DebitResult {
    pub fn debited(transaction_id: Uuid) -> Self {
        Self {
            version: MESSAGE_VERSION,
            transaction_id,
            outcome: DebitStatus::Debited,
            reason: None,
        }
    }

    pub fn failed(transaction_id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            version: MESSAGE_VERSION,
            transaction_id,
            outcome: DebitStatus::Failed,
            reason: Some(reason.into()),
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let result: Self = serde_json::from_slice(payload)?;
        check_version(result.version)?;
        Ok(result)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn key(&self) -> String {
        self.transaction_id.to_string()
    }
}
