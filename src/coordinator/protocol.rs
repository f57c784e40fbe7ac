use crate::{AdmissionRequest, GroupKey, Result, TicketQueueError};
use serde::{Deserialize, Serialize};

/// One unit of work handed to a worker: a user who may now pick a seat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub request_id: String,
    pub resource_id: String,
    pub category: String,
    pub user_identity: String,
    #[serde(default)]
    pub worker: usize,
}

impl WorkItem {
    pub fn from_request(request: &AdmissionRequest, worker: usize) -> Self {
        Self {
            request_id: request.request_id.clone(),
            resource_id: request.group_key.resource_id.clone(),
            category: request.group_key.category.clone(),
            user_identity: request.user_identity.clone(),
            worker,
        }
    }

    pub fn group_key(&self) -> GroupKey {
        GroupKey::new(self.resource_id.clone(), &self.category)
    }
}

/// Completion echo from a worker. `success` is false on timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionReport {
    pub worker: usize,
    pub request_id: String,
    pub resource_id: String,
    pub category: String,
    pub user_identity: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seat_id: Option<String>,
}

impl SelectionReport {
    pub fn new(item: &WorkItem, seat_id: Option<String>) -> Self {
        Self {
            worker: item.worker,
            request_id: item.request_id.clone(),
            resource_id: item.resource_id.clone(),
            category: item.category.clone(),
            user_identity: item.user_identity.clone(),
            success: seat_id.is_some(),
            seat_id,
        }
    }

    pub fn group_key(&self) -> GroupKey {
        GroupKey::new(self.resource_id.clone(), &self.category)
    }
}

/// Coordinator to request source, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "UPPERCASE")]
pub enum SourceRequest {
    Next { worker: usize },
    Done(SelectionReport),
    /// An item that reached the coordinator after its caller gave up.
    Return(WorkItem),
}

pub fn encode_line<T: Serialize>(value: &T) -> Result<String> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    Ok(line)
}

pub fn decode_line<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T> {
    serde_json::from_str(line.trim())
        .map_err(|e| TicketQueueError::Protocol(format!("{}: {}", e, line.trim())))
}
