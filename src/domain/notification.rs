use super::group::GroupKey;
use super::request::SelectionOutcome;
use serde::{Deserialize, Deserializer, Serialize};

/// Push notifications delivered to a client's live connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    Registered { request_id: String },
    StartSelection { group: GroupKey, position: usize },
    QueueFull { group: GroupKey },
    YourTurn { group: GroupKey },
    SelectionTimeout { group: GroupKey },
    SeatSubmitted { group: GroupKey, delivered: bool },
    Error { message: String },
}

/// Control messages sent by clients over their connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientAction {
    Register {
        request_id: String,
    },
    Finish {
        resource_id: String,
        category: String,
        #[serde(default)]
        outcome: SelectionOutcome,
    },
    Cancel {
        request_id: String,
        resource_id: String,
        category: String,
    },
    Select {
        resource_id: String,
        category: String,
        user_identity: String,
        #[serde(deserialize_with = "string_or_number")]
        seat_id: String,
    },
}

impl ClientAction {
    pub fn group_key(&self) -> Option<GroupKey> {
        match self {
            Self::Register { .. } => None,
            Self::Finish { resource_id, category, .. }
            | Self::Cancel { resource_id, category, .. }
            | Self::Select { resource_id, category, .. } => Some(GroupKey::new(resource_id.clone(), category)),
        }
    }
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("expected seat id, got {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notifications_use_wire_shape() {
        let value = serde_json::to_value(Notification::StartSelection {
            group: GroupKey::new("11", "vip"),
            position: 3,
        })
        .unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "type": "start_selection",
                "group": {"resource_id": "11", "category": "vip"},
                "position": 3
            })
        );
    }

    #[test]
    fn finish_defaults_to_reserved() {
        let action: ClientAction =
            serde_json::from_str(r#"{"action":"finish","resource_id":"11","category":"VIP"}"#).unwrap();
        assert_eq!(
            action,
            ClientAction::Finish {
                resource_id: "11".to_string(),
                category: "VIP".to_string(),
                outcome: SelectionOutcome::Reserved,
            }
        );
        assert_eq!(action.group_key(), Some(GroupKey::new("11", "vip")));
    }

    #[test]
    fn select_accepts_numeric_seat_ids() {
        let action: ClientAction = serde_json::from_str(
            r#"{"action":"select","resource_id":"1","category":"vip","user_identity":"u","seat_id":42}"#,
        )
        .unwrap();
        match action {
            ClientAction::Select { seat_id, .. } => assert_eq!(seat_id, "42"),
            other => panic!("unexpected action {:?}", other),
        }
    }
}
