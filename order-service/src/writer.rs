use bigdecimal::BigDecimal;
use shared::{validate_amount, validate_user_id, Result};
use tracing::{error, info};
use uuid::Uuid;

use crate::models::NewOrder;
use crate::store::SharedOrderStore;

/// Creates orders together with their outbox entry. Never touches the broker; the
/// relay picks the entry up from the outbox.
#[derive(Clone)]
pub struct OutboxWriter {
    store: SharedOrderStore,
}

impl OutboxWriter {
    pub fn new(store: SharedOrderStore) -> Self {
        Self { store }
    }

    pub async fn create_order(&self, user_id: &str, amount: BigDecimal) -> Result<Uuid> {
        validate_user_id(user_id)?;
        validate_amount(&amount)?;

        let transaction_id = Uuid::new_v4();
        let (order, entry) = NewOrder::with_outbox(transaction_id, user_id.to_string(), amount);

        if let Err(e) = self.store.insert_order_with_outbox(order, entry).await {
            error!(%transaction_id, user_id, "Failed to create order: {}", e);
            return Err(e);
        }

        info!(%transaction_id, user_id, "Order created with pending outbox entry");
        Ok(transaction_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DispatchStatus, OrderStatus};
    use crate::store::{InMemoryOrderStore, OrderStore};
    use shared::Error;
    use std::str::FromStr;
    use std::sync::Arc;

    #[tokio::test]
    async fn creates_order_and_pending_outbox_entry() {
        let store = Arc::new(InMemoryOrderStore::new());
        let writer = OutboxWriter::new(store.clone());

        let id = writer
            .create_order("u1", BigDecimal::from_str("50.0").unwrap())
            .await
            .unwrap();

        let order = store.find_order("u1", id).await.unwrap().unwrap();
        assert_eq!(order.order_status, OrderStatus::Created);
        assert_eq!(order.amount, BigDecimal::from(50));

        let entry = store.find_outbox_entry(id).await.unwrap().unwrap();
        assert_eq!(entry.dispatch_status, DispatchStatus::Pending);
        assert_eq!(entry.user_id, "u1");
        assert_eq!(entry.amount, order.amount);
    }

    #[tokio::test]
    async fn rejects_non_positive_amounts_without_writing() {
        let store = Arc::new(InMemoryOrderStore::new());
        let writer = OutboxWriter::new(store.clone());

        for amount in ["0", "-1", "-0.01"] {
            let err = writer
                .create_order("u1", BigDecimal::from_str(amount).unwrap())
                .await
                .unwrap_err();
            assert!(matches!(err, Error::InvalidInput(_)));
        }
        let err = writer.create_order("", BigDecimal::from(5)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        assert_eq!(store.order_count().await, 0);
        assert_eq!(store.outbox_count().await, 0);
    }

    #[tokio::test]
    async fn mid_write_failure_leaves_no_partial_rows() {
        let store = Arc::new(InMemoryOrderStore::new());
        let writer = OutboxWriter::new(store.clone());
        store.fail_next_outbox_inserts(1).await;

        let err = writer.create_order("u1", BigDecimal::from(5)).await.unwrap_err();
        assert!(matches!(err, Error::Persistence(_)));
        assert_eq!(store.order_count().await, 0);
        assert_eq!(store.outbox_count().await, 0);

        let id = writer.create_order("u1", BigDecimal::from(5)).await.unwrap();
        assert!(store.find_order("u1", id).await.unwrap().is_some());
        assert!(store.find_outbox_entry(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn every_order_gets_a_fresh_transaction_id() {
        let writer = OutboxWriter::new(Arc::new(InMemoryOrderStore::new()));
        let first = writer.create_order("u1", BigDecimal::from(1)).await.unwrap();
        let second = writer.create_order("u1", BigDecimal::from(1)).await.unwrap();
        assert_ne!(first, second);
    }
}
