use crate::{GroupKey, JoinEvent, Result, TicketQueueError};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use serde::Serialize;
use std::time::Duration;

#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
}

impl KafkaProducer {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let producer: FutureProducer = config.create()?;
        Ok(Self { producer })
    }

    pub async fn send<T>(&self, topic: &str, key: &str, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        let payload = serde_json::to_string(value)?;

        let record = FutureRecord::to(topic)
            .key(key)
            .payload(&payload);

        self.producer
            .send(record, Duration::from_secs(10))
            .await
            .map_err(|(kafka_err, _)| TicketQueueError::Kafka(kafka_err))?;

        Ok(())
    }

    /// Publish a join event to its group's topic, keyed by request id.
    pub async fn publish_join(&self, group: &GroupKey, event: &JoinEvent) -> Result<String> {
        let topic = group.topic();
        self.send(&topic, &event.request_id, event).await?;
        Ok(topic)
    }

    pub async fn flush(&self, timeout: Duration) -> Result<()> {
        self.producer.flush(timeout)?;
        Ok(())
    }
}
