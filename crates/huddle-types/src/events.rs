use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::TagInput;
use crate::error::ErrorKind;
use crate::models::Message;

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum GatewayEvent {
    /// Server confirms the handshake; the session id is new on every connect.
    Ready {
        user_id: Uuid,
        username: String,
        session_id: Uuid,
    },

    /// Outcome of a `join-groups` command.
    Joined {
        group_ids: Vec<Uuid>,
        rejected: Vec<Uuid>,
    },

    /// A message was created in a room the session has joined.
    NewMessage { message: Message },

    /// Send confirmation, delivered only to the originating session.
    MessageSent {
        client_id: Option<Uuid>,
        message: Message,
    },

    /// A `send-message` command was refused.
    MessageError {
        client_id: Option<Uuid>,
        error: ErrorKind,
        message: String,
    },

    UserTyping {
        group_id: Uuid,
        user_id: Uuid,
        username: String,
    },

    UserStopTyping { group_id: Uuid, user_id: Uuid },

    /// One or more messages transitioned from unread to read for `user_id`.
    MessageRead {
        group_id: Uuid,
        user_id: Uuid,
        message_ids: Vec<Uuid>,
        read_at: DateTime<Utc>,
    },

    PresenceUpdate {
        group_id: Uuid,
        user_id: Uuid,
        online: bool,
    },
}

impl GatewayEvent {
    /// Returns the group this event is scoped to, if any.
    pub fn group_id(&self) -> Option<Uuid> {
        match self {
            Self::NewMessage { message } | Self::MessageSent { message, .. } => {
                Some(message.group_id)
            }
            Self::UserTyping { group_id, .. }
            | Self::UserStopTyping { group_id, .. }
            | Self::MessageRead { group_id, .. }
            | Self::PresenceUpdate { group_id, .. } => Some(*group_id),
            Self::Ready { .. } | Self::Joined { .. } | Self::MessageError { .. } => None,
        }
    }
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },

    SendMessage(SendMessageCommand),

    /// Join the rooms for these groups. Each id is checked against group
    /// membership; refused ids come back in `joined.rejected`.
    JoinGroups { group_ids: Vec<Uuid> },

    TypingStart { group_id: Uuid },

    TypingStop { group_id: Uuid },

    /// Mark one message read, or every unread message in the group when
    /// `message_id` is absent.
    MarkRead {
        group_id: Uuid,
        #[serde(default)]
        message_id: Option<Uuid>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SendMessageCommand {
    pub group_id: Uuid,
    pub content: String,
    #[serde(default)]
    pub message_type: Option<String>,
    #[serde(default)]
    pub reply_to: Option<Uuid>,
    #[serde(default)]
    pub tags: Vec<TagInput>,
    #[serde(default)]
    pub client_id: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_use_kebab_case_tags() {
        let group_id = Uuid::new_v4();
        let raw = format!(
            r#"{{"type":"typing-start","data":{{"group_id":"{}"}}}}"#,
            group_id
        );
        let cmd: GatewayCommand = serde_json::from_str(&raw).unwrap();
        assert_eq!(cmd, GatewayCommand::TypingStart { group_id });
    }

    #[test]
    fn mark_read_without_message_means_whole_group() {
        let group_id = Uuid::new_v4();
        let raw = format!(
            r#"{{"type":"mark-read","data":{{"group_id":"{}"}}}}"#,
            group_id
        );
        match serde_json::from_str::<GatewayCommand>(&raw).unwrap() {
            GatewayCommand::MarkRead { message_id, .. } => assert!(message_id.is_none()),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn message_error_serializes_kind() {
        let event = GatewayEvent::MessageError {
            client_id: None,
            error: ErrorKind::Authorization,
            message: "volunteer is not allowed to write".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "message-error");
        assert_eq!(json["data"]["error"], "authorization");
        assert_eq!(event.group_id(), None);
    }
}
