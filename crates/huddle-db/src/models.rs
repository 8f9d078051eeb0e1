//! Row and input types for the store. Reads come back as `huddle-types`
//! models; only the password-bearing user row stays store-local.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use huddle_types::models::{GroupType, Message, MessageType, Role, TagKind, User};

/// A user row including the password hash. Never leaves the auth layer.
pub struct UserRow {
    pub user: User,
    pub password: String,
}

pub struct NewUser {
    pub id: Uuid,
    pub username: String,
    pub display_name: String,
    pub password_hash: String,
    pub organization_id: String,
    /// Role for every account after the first; the first account of an
    /// organization is always created as `admin`.
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

pub struct NewGroup {
    pub id: Uuid,
    pub name: String,
    pub group_type: GroupType,
    pub description: Option<String>,
    pub organization_id: String,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
}

pub struct NewMessage {
    pub id: Uuid,
    pub group_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub message_type: MessageType,
    pub reply_to: Option<Uuid>,
    pub client_id: Option<Uuid>,
    pub tags: Vec<(TagKind, Option<String>)>,
    pub created_at: DateTime<Utc>,
}

/// Result of the message-creation transaction.
#[derive(Debug)]
pub enum CreateOutcome {
    /// Message, tags and one delivery row per member were written.
    Created {
        message: Message,
        recipients: Vec<Uuid>,
    },
    /// `(sender, client_id)` was already stored; nothing was written.
    Replayed(Message),
    /// `reply_to` does not name a message in the same group.
    ReplyTargetMissing,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RemoveMemberOutcome {
    Removed,
    NotMember,
    LastAdmin,
}
