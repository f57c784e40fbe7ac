use super::group::GroupKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Join event as published on a group's topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinEvent {
    pub request_id: String,
    #[serde(alias = "username")]
    pub user_identity: String,
}

/// A join request accepted into a group's FIFO. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionRequest {
    pub request_id: String,
    pub group_key: GroupKey,
    pub user_identity: String,
    pub enqueued_at: DateTime<Utc>,
    /// Process-wide arrival order, used to compare heads of different groups.
    #[serde(default)]
    pub sequence: u64,
}

impl AdmissionRequest {
    pub fn new(request_id: impl Into<String>, group_key: GroupKey, user_identity: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            group_key,
            user_identity: user_identity.into(),
            enqueued_at: Utc::now(),
            sequence: 0,
        }
    }

    pub fn from_join(group_key: GroupKey, event: JoinEvent) -> Self {
        Self::new(event.request_id, group_key, event.user_identity)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    InQueue,
    Selecting,
    Reserved,
    Cancelled,
    TimedOut,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Reserved | Self::Cancelled | Self::TimedOut)
    }
}

/// How the user currently selecting in a group left the selecting state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionOutcome {
    #[default]
    Reserved,
    Cancelled,
    TimedOut,
}

impl From<SelectionOutcome> for RequestStatus {
    fn from(outcome: SelectionOutcome) -> Self {
        match outcome {
            SelectionOutcome::Reserved => RequestStatus::Reserved,
            SelectionOutcome::Cancelled => RequestStatus::Cancelled,
            SelectionOutcome::TimedOut => RequestStatus::TimedOut,
        }
    }
}

/// Append-only audit record, one per state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub transition_id: Uuid,
    pub request_id: String,
    pub status: RequestStatus,
    pub timestamp: DateTime<Utc>,
}

impl StateTransition {
    pub fn new(request_id: impl Into<String>, status: RequestStatus) -> Self {
        Self {
            transition_id: Uuid::new_v4(),
            request_id: request_id.into(),
            status,
            timestamp: Utc::now(),
        }
    }
}

/// A worker waiting for one user's seat choice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionSession {
    pub request_id: String,
    pub group_key: GroupKey,
    pub user_identity: String,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}
