use crate::{GroupKey, Result, TicketQueueError};
use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::{ClientConfig, Message, Offset, TopicPartitionList};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::time::timeout;

/// The broker operations the ingress adapter relies on.
#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    /// Replace the subscription with `topics`.
    fn subscribe(&self, topics: &[String]) -> Result<()>;

    /// Next message, or `None` when the poll timed out.
    async fn recv_message(&self, timeout_duration: Duration) -> Result<Option<KafkaMessage>>;

    fn commit_message(&self, message: &KafkaMessage) -> Result<()>;

    /// Stop fetching from a partition and rewind it to `offset`, so that
    /// message is delivered again after [`BrokerConsumer::resume`].
    fn pause_at(&self, topic: &str, partition: i32, offset: i64) -> Result<()>;

    fn resume(&self, topic: &str, partition: i32) -> Result<()>;
}

pub struct KafkaConsumer {
    consumer: StreamConsumer,
}

impl KafkaConsumer {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let consumer: StreamConsumer = config.create()?;
        Ok(Self { consumer })
    }

    fn partition_list(topic: &str, partition: i32) -> TopicPartitionList {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition(topic, partition);
        tpl
    }
}

#[async_trait]
impl BrokerConsumer for KafkaConsumer {
    fn subscribe(&self, topics: &[String]) -> Result<()> {
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&topics)?;
        Ok(())
    }

    async fn recv_message(&self, timeout_duration: Duration) -> Result<Option<KafkaMessage>> {
        match timeout(timeout_duration, self.consumer.recv()).await {
            Ok(Ok(message)) => {
                let key = message.key()
                    .map(|k| String::from_utf8_lossy(k).to_string());

                let payload = message.payload()
                    .map(|p| String::from_utf8_lossy(p).to_string());

                Ok(Some(KafkaMessage {
                    topic: message.topic().to_string(),
                    partition: message.partition(),
                    offset: message.offset(),
                    key,
                    payload,
                }))
            }
            Ok(Err(e)) => Err(TicketQueueError::BrokerUnavailable(e.to_string())),
            Err(_) => Ok(None), // Timeout
        }
    }

    fn commit_message(&self, message: &KafkaMessage) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&message.topic, message.partition, Offset::Offset(message.offset + 1))?;
        self.consumer.commit(&tpl, CommitMode::Sync)?;
        Ok(())
    }

    fn pause_at(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        self.consumer.pause(&Self::partition_list(topic, partition))?;
        self.consumer
            .seek(topic, partition, Offset::Offset(offset), Duration::from_secs(5))?;
        Ok(())
    }

    fn resume(&self, topic: &str, partition: i32) -> Result<()> {
        self.consumer.resume(&Self::partition_list(topic, partition))?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct KafkaMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Option<String>,
}

impl KafkaMessage {
    pub fn deserialize_value<T>(&self) -> Result<T>
    where
        T: DeserializeOwned,
    {
        match &self.payload {
            Some(payload) => serde_json::from_str(payload).map_err(|e| self.malformed(e.to_string())),
            None => Err(self.malformed("empty message payload")),
        }
    }

    pub fn group_key(&self) -> Result<GroupKey> {
        GroupKey::from_topic(&self.topic).map_err(|_| self.malformed("topic does not name a group"))
    }

    fn malformed(&self, reason: impl Into<String>) -> TicketQueueError {
        TicketQueueError::MalformedMessage {
            topic: self.topic.clone(),
            offset: self.offset,
            reason: reason.into(),
        }
    }
}
