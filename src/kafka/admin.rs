use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{GroupKey, Result, TicketQueueError};
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::ClientConfig;
use tracing::{info, warn};

/// Creates join topics for newly discovered groups.
pub struct TopicProvisioner {
    admin: AdminClient<DefaultClientContext>,
    partitions: i32,
    replication: i32,
}

impl TopicProvisioner {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let admin: AdminClient<DefaultClientContext> = config.create()?;
        Ok(Self {
            admin,
            partitions: 1,
            replication: 1,
        })
    }

    /// Create any missing topics for `groups`. Topics that already exist
    /// count as success.
    pub async fn ensure_topics(&self, groups: &[GroupKey]) -> Result<()> {
        if groups.is_empty() {
            return Ok(());
        }
        let names: Vec<String> = groups.iter().map(GroupKey::topic).collect();
        let names = &names;
        let admin = &self.admin;
        let (partitions, replication) = (self.partitions, self.replication);

        retry_with_backoff(&RetryConfig::topic_admin(), "create_topics", || async move {
            let topics: Vec<NewTopic<'_>> = names
                .iter()
                .map(|name| NewTopic::new(name, partitions, TopicReplication::Fixed(replication)))
                .collect();

            let results = admin.create_topics(&topics, &AdminOptions::new()).await?;

            let mut failed = Vec::new();
            for result in results {
                match result {
                    Ok(topic) => info!(topic = %topic, "Created topic"),
                    Err((topic, RDKafkaErrorCode::TopicAlreadyExists)) => {
                        info!(topic = %topic, "Topic already exists")
                    }
                    Err((topic, code)) => {
                        warn!(topic = %topic, "Failed to create topic: {}", code);
                        failed.push(topic);
                    }
                }
            }

            if failed.is_empty() {
                Ok(())
            } else {
                Err(TicketQueueError::BrokerUnavailable(format!(
                    "could not create topics: {}",
                    failed.join(", ")
                )))
            }
        })
        .await
    }
}
