use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Declares a closed string enum with the same spelling on the wire, in the
/// database and in `Display`/`FromStr`.
macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// Returned when a stored or submitted string is not one of an enum's spellings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} '{}'", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

string_enum! {
    /// Organization-wide role, distinct from the per-group membership role.
    Role {
        Admin => "admin",
        FieldStaff => "field_staff",
        Volunteer => "volunteer",
    }
}

string_enum! {
    UserStatus {
        Active => "active",
        Inactive => "inactive",
    }
}

string_enum! {
    GroupType {
        Team => "team",
        Project => "project",
        Emergency => "emergency",
        General => "general",
    }
}

string_enum! {
    MembershipRole {
        Member => "member",
        Moderator => "moderator",
        Admin => "admin",
    }
}

string_enum! {
    MessageType {
        Text => "text",
        File => "file",
        Image => "image",
        Form => "form",
    }
}

string_enum! {
    /// The fixed tag vocabulary. Anything else is rejected before storage.
    TagKind {
        Urgent => "urgent",
        FollowUp => "follow-up",
        Financial => "financial",
        Logistics => "logistics",
        Medical => "medical",
        Security => "security",
    }
}

string_enum! {
    /// What a caller wants to do inside a group.
    GroupAction {
        Read => "read",
        Write => "write",
        Delete => "delete",
        Manage => "manage",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub display_name: String,
    pub role: Role,
    pub organization_id: String,
    pub status: UserStatus,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Group {
    pub id: Uuid,
    pub name: String,
    pub group_type: GroupType,
    pub description: Option<String>,
    pub organization_id: String,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Membership {
    pub group_id: Uuid,
    pub user_id: Uuid,
    pub role: MembershipRole,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag {
    pub kind: TagKind,
    pub value: Option<String>,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub group_id: Uuid,
    pub sender_id: Uuid,
    pub sender_username: String,
    pub content: String,
    pub message_type: MessageType,
    pub reply_to: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub tags: Vec<Tag>,
}

/// One row of the "who has seen what" ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryStatus {
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub delivered_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}
