//! In-process broker used by tests and local runs.
//!
//! Each topic is a single-partition append-only log. A subscription starts from its
//! group's committed offset, so dropping a subscription without acking and
//! subscribing again replays everything not yet committed, the same way a consumer
//! restart behaves against Kafka.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

use super::{Delivery, Publisher, Subscription};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct Record {
    key: String,
    payload: Vec<u8>,
}

#[derive(Default)]
struct State {
    topics: HashMap<String, Vec<Record>>,
    committed: HashMap<(String, String), i64>,
    failing_publishes: u32,
}

struct Inner {
    state: Mutex<State>,
    appended: watch::Sender<u64>,
}

#[derive(Clone)]
pub struct InMemoryBus {
    inner: Arc<Inner>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBus {
    pub fn new() -> Self {
        let (appended, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                appended,
            }),
        }
    }

    /// Makes the next `count` publishes fail without appending anything.
    pub async fn fail_next_publishes(&self, count: u32) {
        self.inner.state.lock().await.failing_publishes = count;
    }

    /// Everything ever appended to `topic`, in offset order.
    pub async fn messages(&self, topic: &str) -> Vec<Delivery> {
        let state = self.inner.state.lock().await;
        state
            .topics
            .get(topic)
            .map(|log| {
                log.iter()
                    .enumerate()
                    .map(|(offset, record)| to_delivery(topic, offset as i64, record))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn committed_offset(&self, group: &str, topic: &str) -> i64 {
        let state = self.inner.state.lock().await;
        state
            .committed
            .get(&(group.to_string(), topic.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub async fn subscribe(&self, group: &str, topics: &[&str]) -> InMemorySubscription {
        let state = self.inner.state.lock().await;
        let positions = topics
            .iter()
            .map(|topic| {
                let committed = state
                    .committed
                    .get(&(group.to_string(), topic.to_string()))
                    .copied()
                    .unwrap_or(0);
                (topic.to_string(), committed)
            })
            .collect();

        InMemorySubscription {
            bus: self.clone(),
            group: group.to_string(),
            topics: topics.iter().map(|t| t.to_string()).collect(),
            positions,
            appended: self.inner.appended.subscribe(),
        }
    }
}

fn to_delivery(topic: &str, offset: i64, record: &Record) -> Delivery {
    Delivery {
        topic: topic.to_string(),
        partition: 0,
        offset,
        key: Some(record.key.clone()),
        payload: record.payload.clone(),
    }
}

#[async_trait]
impl Publisher for InMemoryBus {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()> {
        {
            let mut state = self.inner.state.lock().await;
            if state.failing_publishes > 0 {
                state.failing_publishes -= 1;
                return Err(Error::Delivery(format!("broker rejected publish to {}", topic)));
            }
            state.topics.entry(topic.to_string()).or_default().push(Record {
                key: key.to_string(),
                payload: payload.to_vec(),
            });
        }
        self.inner.appended.send_modify(|count| *count += 1);
        Ok(())
    }
}

pub struct InMemorySubscription {
    bus: InMemoryBus,
    group: String,
    topics: Vec<String>,
    positions: HashMap<String, i64>,
    appended: watch::Receiver<u64>,
}

impl InMemorySubscription {
    async fn poll(&mut self) -> Option<Delivery> {
        let state = self.bus.inner.state.lock().await;
        for topic in &self.topics {
            let position = self.positions.get(topic).copied().unwrap_or(0);
            let record = state
                .topics
                .get(topic)
                .and_then(|log| log.get(position as usize));
            if let Some(record) = record {
                let delivery = to_delivery(topic, position, record);
                self.positions.insert(topic.clone(), position + 1);
                return Some(delivery);
            }
        }
        None
    }
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn next(&mut self) -> Option<Result<Delivery>> {
        loop {
            self.appended.borrow_and_update();
            if let Some(delivery) = self.poll().await {
                return Some(Ok(delivery));
            }
            if self.appended.changed().await.is_err() {
                return None;
            }
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<()> {
        let mut state = self.bus.inner.state.lock().await;
        let committed = state
            .committed
            .entry((self.group.clone(), delivery.topic.clone()))
            .or_insert(0);
        *committed = (*committed).max(delivery.offset + 1);
        Ok(())
    }

    async fn nack(&mut self, delivery: &Delivery) -> Result<()> {
        self.positions.insert(delivery.topic.clone(), delivery.offset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn failed_publish_appends_nothing() {
        let bus = InMemoryBus::new();
        bus.fail_next_publishes(1).await;

        assert!(bus.publish("t", "k", b"one").await.is_err());
        bus.publish("t", "k", b"two").await.unwrap();

        let messages = bus.messages("t").await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload, b"two".to_vec());
    }

    #[tokio::test]
    async fn nack_redelivers_the_same_offset() {
        let bus = InMemoryBus::new();
        bus.publish("t", "k", b"a").await.unwrap();
        bus.publish("t", "k", b"b").await.unwrap();

        let mut sub = bus.subscribe("g", &["t"]).await;
        let first = sub.next().await.unwrap().unwrap();
        sub.nack(&first).await.unwrap();
        let again = sub.next().await.unwrap().unwrap();
        assert_eq!(first, again);

        sub.ack(&again).await.unwrap();
        let second = sub.next().await.unwrap().unwrap();
        assert_eq!(second.payload, b"b".to_vec());
    }

    #[tokio::test]
    async fn resubscribe_resumes_from_committed_offset() {
        let bus = InMemoryBus::new();
        bus.publish("t", "k", b"a").await.unwrap();
        bus.publish("t", "k", b"b").await.unwrap();

        let mut sub = bus.subscribe("g", &["t"]).await;
        let first = sub.next().await.unwrap().unwrap();
        sub.ack(&first).await.unwrap();
        let _unacked = sub.next().await.unwrap().unwrap();
        drop(sub);

        let mut restarted = bus.subscribe("g", &["t"]).await;
        let replayed = restarted.next().await.unwrap().unwrap();
        assert_eq!(replayed.offset, 1);
        assert_eq!(bus.committed_offset("g", "t").await, 1);
    }

    #[tokio::test]
    async fn next_waits_for_a_publish() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe("g", &["t"]).await;

        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("t", "k", b"late").await.unwrap();
        });

        let delivery = tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .expect("publish should wake the subscriber")
            .unwrap()
            .unwrap();
        assert_eq!(delivery.payload, b"late".to_vec());
    }
}
