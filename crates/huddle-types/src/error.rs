use std::fmt::Display;

use serde::{Deserialize, Serialize};
use tracing::error;

/// A single rejected input field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Wire-level name of an error class, shared by the REST layer and the
/// gateway's `message-error` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Authentication,
    Authorization,
    Validation,
    NotFound,
    Internal,
    Delivery,
}

#[derive(Debug, thiserror::Error)]
pub enum HuddleError {
    /// Missing, invalid or expired credential.
    #[error("authentication required")]
    Authentication,

    /// Valid identity, insufficient permission.
    #[error("{role} is not allowed to {action}")]
    Authorization { action: String, role: String },

    /// Malformed input, refused before any mutation.
    #[error("invalid input")]
    Validation(Vec<FieldError>),

    /// Absent or inaccessible; the two are deliberately indistinguishable.
    #[error("not found")]
    NotFound,

    /// Storage failed and the enclosing transaction was rolled back.
    /// The cause is logged where this is constructed, never returned.
    #[error("internal error")]
    Storage,

    /// An offline-queued action exhausted its retry ceiling.
    #[error("delivery failed after {attempts} attempts")]
    Delivery { attempts: u32 },
}

impl HuddleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Authentication => ErrorKind::Authentication,
            Self::Authorization { .. } => ErrorKind::Authorization,
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound => ErrorKind::NotFound,
            Self::Storage => ErrorKind::Internal,
            Self::Delivery { .. } => ErrorKind::Delivery,
        }
    }

    pub fn forbidden(action: impl Into<String>, role: impl Display) -> Self {
        Self::Authorization {
            action: action.into(),
            role: role.to_string(),
        }
    }

    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation(vec![FieldError::new(field, message)])
    }

    /// Log a storage failure with its full context and collapse it into the
    /// generic class returned to callers.
    pub fn storage(context: &str, err: impl Display) -> Self {
        error!("storage failure during {}: {:#}", context, err);
        Self::Storage
    }
}
