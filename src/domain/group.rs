use crate::{Result, TicketQueueError, Topics};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One independent FCFS domain: a match and one of its seat categories.
///
/// Categories are case-insensitive and stored lower-cased, so `VIP` and `vip`
/// address the same queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey {
    pub resource_id: String,
    pub category: String,
}

impl GroupKey {
    pub fn new(resource_id: impl Into<String>, category: impl AsRef<str>) -> Self {
        Self {
            resource_id: resource_id.into(),
            category: category.as_ref().to_lowercase(),
        }
    }

    /// Like [`GroupKey::new`], but only accepts parts that survive the trip
    /// through a topic name: non-empty ASCII letters, digits, `-` or `_`.
    pub fn checked(resource_id: impl Into<String>, category: impl AsRef<str>) -> Result<Self> {
        let group = Self::new(resource_id, category);
        let valid = |part: &str| {
            !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        };
        if valid(&group.resource_id) && valid(&group.category) {
            Ok(group)
        } else {
            Err(TicketQueueError::InvalidTopic(group.topic()))
        }
    }

    /// Topic carrying join events for this group.
    pub fn topic(&self) -> String {
        format!("{}.{}.{}", Topics::JOIN_PREFIX, self.resource_id, self.category)
    }

    /// Parse a `match.<resource_id>.<category>` topic name.
    pub fn from_topic(topic: &str) -> Result<Self> {
        let mut parts = topic.splitn(3, '.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(prefix), Some(resource_id), Some(category))
                if prefix == Topics::JOIN_PREFIX
                    && !resource_id.is_empty()
                    && !category.is_empty()
                    && !category.contains('.') =>
            {
                Ok(Self::new(resource_id, category))
            }
            _ => Err(TicketQueueError::InvalidTopic(topic.to_string())),
        }
    }

    /// Parse the `resource_id:category` form used in configuration files.
    pub fn parse_pair(value: &str) -> Result<Self> {
        match value.trim().split_once(':') {
            Some((resource_id, category)) if !resource_id.is_empty() && !category.is_empty() => {
                Ok(Self::new(resource_id.trim(), category.trim()))
            }
            _ => Err(TicketQueueError::InvalidArgument(format!(
                "Expected <resource_id>:<category>, got '{}'",
                value
            ))),
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_id, self.category)
    }
}
