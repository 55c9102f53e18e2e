use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Message, Offset, TopicPartitionList};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{Delivery, Publisher, Subscription};
use crate::error::{Error, Result};

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

pub fn producer(brokers: &str, timeout: Duration) -> Result<FutureProducer> {
    let producer = ClientConfig::new()
        .set("bootstrap.servers", brokers)
        .set("message.timeout.ms", timeout.as_millis().to_string())
        .set("acks", "all")
        .set("enable.idempotence", "true")
        .create()?;
    Ok(producer)
}

pub struct KafkaPublisher {
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaPublisher {
    pub fn new(producer: FutureProducer, timeout: Duration) -> Self {
        Self { producer, timeout }
    }
}

#[async_trait]
impl Publisher for KafkaPublisher {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()> {
        let record = FutureRecord::to(topic).payload(payload).key(key);

        let (partition, offset) = self
            .producer
            .send(record, self.timeout)
            .await
            .map_err(|(e, _)| Error::Delivery(format!("failed to publish to {}: {}", topic, e)))?;

        debug!(topic, key, partition, offset, "Message published");
        Ok(())
    }
}

/// Consumer-group subscription with manual offset commits.
pub struct KafkaSubscription {
    consumer: StreamConsumer,
}

impl KafkaSubscription {
    pub fn new(brokers: &str, group_id: &str, topics: &[&str]) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", group_id)
            .set("bootstrap.servers", brokers)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()?;

        consumer.subscribe(topics)?;
        info!(?topics, group_id, "Subscribed with manual commit");

        Ok(Self { consumer })
    }
}

#[async_trait]
impl Subscription for KafkaSubscription {
    async fn next(&mut self) -> Option<Result<Delivery>> {
        let result = match self.consumer.recv().await {
            Ok(m) => Ok(Delivery {
                topic: m.topic().to_string(),
                partition: m.partition(),
                offset: m.offset(),
                key: m
                    .key()
                    .map(|k| String::from_utf8_lossy(k).into_owned()),
                payload: m.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            }),
            Err(e) => Err(Error::Delivery(format!("failed to receive message: {}", e))),
        };
        Some(result)
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<()> {
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(
            &delivery.topic,
            delivery.partition,
            Offset::Offset(delivery.offset + 1),
        )?;
        self.consumer.commit(&offsets, CommitMode::Async)?;
        Ok(())
    }

    async fn nack(&mut self, delivery: &Delivery) -> Result<()> {
        if let Err(e) = self.consumer.seek(
            &delivery.topic,
            delivery.partition,
            Offset::Offset(delivery.offset),
            SEEK_TIMEOUT,
        ) {
            warn!(
                topic = %delivery.topic,
                partition = delivery.partition,
                offset = delivery.offset,
                error = %e,
                "Failed to rewind for redelivery"
            );
            return Err(e.into());
        }
        Ok(())
    }
}
