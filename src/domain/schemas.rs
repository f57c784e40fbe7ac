// Kafka topic definitions
pub struct Topics;

impl Topics {
    /// Join events are published to `match.<resource_id>.<category>`.
    pub const JOIN_PREFIX: &'static str = "match";
}

// State store definitions
pub struct Stores;

impl Stores {
    pub const TRANSITIONS: &'static str = "transitions";
}

pub const DEFAULT_CATEGORIES: [&str; 3] = ["vip", "premium", "standard"];

// Utility functions for key generation
pub fn transition_key(request_id: &str, timestamp_micros: i64, sequence: u64) -> String {
    format!("{}#{:020}#{:010}", request_id, timestamp_micros.max(0), sequence)
}

pub fn transition_prefix(request_id: &str) -> String {
    format!("{}#", request_id)
}
