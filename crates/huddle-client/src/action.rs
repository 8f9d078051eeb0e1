use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use huddle_types::api::{CreateGroupRequest, CreateMessageRequest, TagInput};
use huddle_types::events::SendMessageCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    SendMessage,
    CreateGroup,
    UploadFile,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendMessage => "send-message",
            Self::CreateGroup => "create-group",
            Self::UploadFile => "upload-file",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something the user did that has to reach the server eventually.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum ActionPayload {
    SendMessage {
        group_id: Uuid,
        content: String,
        #[serde(default)]
        message_type: Option<String>,
        #[serde(default)]
        reply_to: Option<Uuid>,
        #[serde(default)]
        tags: Vec<TagInput>,
    },
    CreateGroup(CreateGroupRequest),
    UploadFile {
        #[serde(default)]
        group_id: Option<Uuid>,
        filename: String,
        content_type: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
}

impl ActionPayload {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::SendMessage { .. } => ActionKind::SendMessage,
            Self::CreateGroup(_) => ActionKind::CreateGroup,
            Self::UploadFile { .. } => ActionKind::UploadFile,
        }
    }

    pub fn group_id(&self) -> Option<Uuid> {
        match self {
            Self::SendMessage { group_id, .. } => Some(*group_id),
            Self::UploadFile { group_id, .. } => *group_id,
            Self::CreateGroup(_) => None,
        }
    }
}

/// A persisted action. `id` is generated once at enqueue and doubles as the
/// server-side idempotency key, so a replay of a send the server already
/// stored is confirmed rather than duplicated.
#[derive(Debug, Clone)]
pub struct QueuedAction {
    pub id: Uuid,
    pub payload: ActionPayload,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl QueuedAction {
    pub fn new(payload: ActionPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            enqueued_at: Utc::now(),
            attempts: 0,
            last_attempt_at: None,
        }
    }

    pub fn kind(&self) -> ActionKind {
        self.payload.kind()
    }

    /// Gateway form of a `send-message` action.
    pub fn send_command(&self) -> Option<SendMessageCommand> {
        match &self.payload {
            ActionPayload::SendMessage {
                group_id,
                content,
                message_type,
                reply_to,
                tags,
            } => Some(SendMessageCommand {
                group_id: *group_id,
                content: content.clone(),
                message_type: message_type.clone(),
                reply_to: *reply_to,
                tags: tags.clone(),
                client_id: Some(self.id),
            }),
            _ => None,
        }
    }

    /// Request-style form of a `send-message` action.
    pub fn create_request(&self) -> Option<(Uuid, CreateMessageRequest)> {
        self.send_command().map(|cmd| {
            (
                cmd.group_id,
                CreateMessageRequest {
                    content: cmd.content,
                    message_type: cmd.message_type,
                    reply_to: cmd.reply_to,
                    tags: cmd.tags,
                    client_id: cmd.client_id,
                },
            )
        })
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
