//! Broker channel between the services.
//!
//! Delivery is at-least-once: a subscriber acknowledges a message only after its
//! effects are committed, and asks for redelivery otherwise. Messages are keyed by
//! transaction id so all messages of one transaction stay on one partition.

pub mod kafka;
pub mod memory;

use async_trait::async_trait;

use crate::error::Result;

/// A message handed to a subscriber, owned so it can outlive the poll that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Resolves once the broker has durably accepted the message.
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()>;
}

/// A durable consumer-group subscription.
#[async_trait]
pub trait Subscription: Send {
    /// Waits for the next message. `None` means the subscription is closed.
    async fn next(&mut self) -> Option<Result<Delivery>>;

    /// Commits the delivery; it will not be delivered to this group again.
    async fn ack(&mut self, delivery: &Delivery) -> Result<()>;

    /// Rewinds to the delivery so it is handed out again.
    async fn nack(&mut self, delivery: &Delivery) -> Result<()>;
}

/// What a handler wants done with a delivery once it has finished with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Redeliver,
}

/// Applies a handler's disposition to its delivery.
pub async fn settle<S>(subscription: &mut S, delivery: &Delivery, disposition: Disposition) -> Result<()>
where
    S: Subscription + ?Sized,
{
    match disposition {
        Disposition::Ack => subscription.ack(delivery).await,
        Disposition::Redeliver => subscription.nack(delivery).await,
    }
}
