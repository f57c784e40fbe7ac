use crate::{GroupKey, Result, TicketQueueError, DEFAULT_CATEGORIES};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    pub bootstrap_servers: String,
    pub security_protocol: Option<String>,
    pub sasl_mechanism: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub ssl_ca_location: Option<String>,
    pub additional_properties: HashMap<String, String>,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            security_protocol: None,
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
            ssl_ca_location: None,
            additional_properties: HashMap::new(),
        }
    }
}

/// Admission queue and ingestion settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    pub capacity: usize,
    pub categories: Vec<String>,
    /// Groups ingested when no matches API is configured.
    pub groups: Vec<GroupKey>,
    pub matches_api_url: Option<String>,
    pub poll_timeout_ms: u64,
    pub refresh_interval_ms: u64,
    /// Deadline for a promoted user to finish; `None` disables the watchdog.
    pub selection_timeout_ms: Option<u64>,
    /// Admitted request ids remembered per group for redelivery checks.
    pub dedup_window: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: 5,
            categories: DEFAULT_CATEGORIES.iter().map(|c| c.to_string()).collect(),
            groups: Vec::new(),
            matches_api_url: None,
            poll_timeout_ms: 1000,
            refresh_interval_ms: 30_000,
            selection_timeout_ms: Some(10_000),
            dedup_window: crate::queue::DEFAULT_DEDUP_WINDOW,
        }
    }
}

impl QueueSettings {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn selection_timeout(&self) -> Option<Duration> {
        self.selection_timeout_ms.map(Duration::from_millis)
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    pub count: usize,
    pub selection_timeout_ms: u64,
    /// Request source the coordinator connects to.
    pub source_address: String,
    /// Address the queue service serves the request source on, if any.
    pub source_listen: Option<String>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            count: 4,
            selection_timeout_ms: 10_000,
            source_address: "127.0.0.1:5000".to_string(),
            source_listen: None,
        }
    }
}

impl WorkerSettings {
    pub fn selection_timeout(&self) -> Duration {
        Duration::from_millis(self.selection_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub application_id: String,
    pub state_dir: String,
    pub kafka: KafkaConfig,
    pub queue: QueueSettings,
    pub workers: WorkerSettings,
}

impl ServiceConfig {
    pub fn new(application_id: &str) -> Self {
        Self {
            application_id: application_id.to_string(),
            state_dir: "/tmp/ticket-queue".to_string(),
            kafka: KafkaConfig::default(),
            queue: QueueSettings::default(),
            workers: WorkerSettings::default(),
        }
    }

    pub fn to_kafka_config(&self) -> rdkafka::ClientConfig {
        let mut config = rdkafka::ClientConfig::new();

        config.set("bootstrap.servers", &self.kafka.bootstrap_servers);

        if let Some(security_protocol) = &self.kafka.security_protocol {
            config.set("security.protocol", security_protocol);
        }

        if let Some(sasl_mechanism) = &self.kafka.sasl_mechanism {
            config.set("sasl.mechanism", sasl_mechanism);
        }

        if let Some(sasl_username) = &self.kafka.sasl_username {
            config.set("sasl.username", sasl_username);
        }

        if let Some(sasl_password) = &self.kafka.sasl_password {
            config.set("sasl.password", sasl_password);
        }

        if let Some(ssl_ca_location) = &self.kafka.ssl_ca_location {
            config.set("ssl.ca.location", ssl_ca_location);
        }

        // Add additional properties
        for (key, value) in &self.kafka.additional_properties {
            config.set(key, value);
        }

        config
    }

    /// Consumer settings: offsets are committed by hand once admission succeeds.
    pub fn to_consumer_config(&self) -> rdkafka::ClientConfig {
        let mut config = self.to_kafka_config();
        config.set("group.id", &self.application_id);
        config.set("auto.offset.reset", "earliest");
        config.set("enable.auto.commit", "false");
        config.set("enable.partition.eof", "false");
        config
    }

    /// Layer `TICKET_QUEUE_*` environment variables over the file settings.
    pub fn apply_env_overrides(self) -> Result<Self> {
        let source = config::Config::builder()
            .add_source(config::Environment::with_prefix("TICKET_QUEUE").try_parsing(true))
            .build()?;
        self.apply_overrides(&source)
    }

    pub(crate) fn apply_overrides(mut self, source: &config::Config) -> Result<Self> {
        if let Some(servers) = lookup::<String>(source, "bootstrap_servers")? {
            self.kafka.bootstrap_servers = servers;
        }
        if let Some(group_id) = lookup::<String>(source, "group_id")? {
            self.application_id = group_id;
        }
        if let Some(capacity) = lookup::<usize>(source, "capacity")? {
            self.queue.capacity = capacity;
        }
        if let Some(interval) = lookup::<u64>(source, "refresh_interval_ms")? {
            self.queue.refresh_interval_ms = interval;
        }
        if let Some(timeout) = lookup::<u64>(source, "selection_timeout_ms")? {
            // 0 switches the promotion deadline off; workers always need one.
            self.queue.selection_timeout_ms = (timeout > 0).then_some(timeout);
            if timeout > 0 {
                self.workers.selection_timeout_ms = timeout;
            }
        }
        if let Some(count) = lookup::<usize>(source, "workers")? {
            self.workers.count = count;
        }
        if let Some(address) = lookup::<String>(source, "source_address")? {
            self.workers.source_address = address;
        }
        if let Some(url) = lookup::<String>(source, "matches_api_url")? {
            self.queue.matches_api_url = Some(url);
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject settings the services cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.queue.capacity == 0 {
            return Err(TicketQueueError::InvalidArgument("queue.capacity must be at least 1".to_string()));
        }
        if self.workers.count == 0 {
            return Err(TicketQueueError::InvalidArgument("workers.count must be at least 1".to_string()));
        }
        if self.workers.selection_timeout_ms == 0 {
            return Err(TicketQueueError::InvalidArgument(
                "workers.selection.timeout.ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn lookup<T>(source: &config::Config, key: &str) -> Result<Option<T>>
where
    T: for<'de> Deserialize<'de>,
{
    match source.get::<T>(key) {
        Ok(value) => Ok(Some(value)),
        Err(config::ConfigError::NotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_replace_file_values() {
        let source = config::Config::builder()
            .set_override("capacity", 22)
            .unwrap()
            .set_override("bootstrap_servers", "kafka:9092")
            .unwrap()
            .set_override("selection_timeout_ms", 2500)
            .unwrap()
            .build()
            .unwrap();

        let config = ServiceConfig::new("queue-service").apply_overrides(&source).unwrap();

        assert_eq!(config.queue.capacity, 22);
        assert_eq!(config.kafka.bootstrap_servers, "kafka:9092");
        assert_eq!(config.queue.selection_timeout_ms, Some(2500));
        assert_eq!(config.workers.selection_timeout_ms, 2500);
        assert_eq!(config.workers.count, 4);
    }

    #[test]
    fn zero_timeout_override_disables_the_promotion_deadline() {
        let source = config::Config::builder()
            .set_override("selection_timeout_ms", 0)
            .unwrap()
            .build()
            .unwrap();

        let config = ServiceConfig::new("queue-service").apply_overrides(&source).unwrap();

        assert_eq!(config.queue.selection_timeout_ms, None);
        assert_eq!(config.queue.selection_timeout(), None);
        assert_eq!(config.workers.selection_timeout_ms, 10_000);
    }

    #[test]
    fn zero_capacity_or_workers_override_is_rejected() {
        for key in ["capacity", "workers"] {
            let source = config::Config::builder()
                .set_override(key, 0)
                .unwrap()
                .build()
                .unwrap();
            assert!(ServiceConfig::new("queue-service").apply_overrides(&source).is_err(), "{}", key);
        }
    }

    #[test]
    fn consumer_config_disables_auto_commit() {
        let config = ServiceConfig::new("queue-service").to_consumer_config();
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("group.id"), Some("queue-service"));
    }
}
