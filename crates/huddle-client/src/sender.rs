use async_trait::async_trait;
use huddle_types::ErrorKind;

use crate::action::{ActionKind, QueuedAction};

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("channel unavailable")]
    Unavailable,

    #[error("no confirmation within the send timeout")]
    Timeout,

    /// The server answered and refused the action.
    #[error("refused by server ({kind:?}): {message}")]
    Rejected { kind: ErrorKind, message: String },

    #[error("transport error: {0}")]
    Transport(String),
}

/// A way of getting a queued action to the server. `send` returns only once
/// the server has confirmed the action or the attempt has failed.
#[async_trait]
pub trait ActionSender: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports(&self, kind: ActionKind) -> bool;

    async fn is_available(&self) -> bool;

    async fn send(&self, action: &QueuedAction) -> Result<(), SendError>;
}
