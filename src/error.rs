use thiserror::Error;

#[derive(Error, Debug)]
pub enum TicketQueueError {
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("RocksDB error: {0}")]
    RocksDB(#[from] rocksdb::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Malformed message on {topic}@{offset}: {reason}")]
    MalformedMessage {
        topic: String,
        offset: i64,
        reason: String,
    },

    #[error("No connection registered for request {0}")]
    UnknownConnection(String),

    #[error("Invalid topic name: {0}")]
    InvalidTopic(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, TicketQueueError>;
