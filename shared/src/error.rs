//! Error taxonomy shared by the order and payment services.

use thiserror::Error;

/// Errors surfaced by the order/payment core.
///
/// Only `InvalidInput`, `NotFound` and `Conflict` are meant for callers. `Persistence`
/// and `Delivery` are transient infrastructure failures that the background loops
/// retry instead of propagating.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Rejected synchronously, never retried
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Local atomic write or read failed
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Broker publish, subscribe or commit failed
    #[error("delivery error: {0}")]
    Delivery(String),

    /// Requested row does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Row already exists
    #[error("conflict: {0}")]
    Conflict(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether retrying the same operation later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Persistence(_) | Error::Delivery(_))
    }
}

impl From<diesel::result::Error> for Error {
    fn from(e: diesel::result::Error) -> Self {
        use diesel::result::{DatabaseErrorKind, Error as DieselError};

        match e {
            DieselError::NotFound => Error::NotFound("record not found".to_string()),
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                Error::Conflict(info.message().to_string())
            }
            other => Error::Persistence(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidInput(format!("malformed message: {}", e))
    }
}

impl From<rdkafka::error::KafkaError> for Error {
    fn from(e: rdkafka::error::KafkaError) -> Self {
        Error::Delivery(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_infrastructure_failures_are_transient() {
        assert!(Error::Persistence("db down".into()).is_transient());
        assert!(Error::Delivery("broker down".into()).is_transient());
        assert!(!Error::InvalidInput("amount".into()).is_transient());
        assert!(!Error::NotFound("order".into()).is_transient());
        assert!(!Error::Conflict("account".into()).is_transient());
    }

    #[test]
    fn diesel_not_found_maps_to_not_found() {
        let err: Error = diesel::result::Error::NotFound.into();
        assert_eq!(err, Error::NotFound("record not found".to_string()));
    }

    #[test]
    fn display_messages() {
        assert_eq!(
            Error::InvalidInput("amount must be positive".into()).to_string(),
            "invalid input: amount must be positive"
        );
        assert_eq!(
            Error::Delivery("timed out".into()).to_string(),
            "delivery error: timed out"
        );
    }
}
