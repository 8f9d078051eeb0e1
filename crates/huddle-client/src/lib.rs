//! Client-side offline synchronizer.
//!
//! Every outbound action is written to a local SQLite queue before it is
//! sent, then removed by id once the server confirms it. Sends prefer the
//! live gateway link and fall back to request-style calls.

pub mod action;
pub mod config;
pub mod http;
pub mod live;
pub mod queue;
pub mod sender;
pub mod sync;

use std::sync::Arc;

pub use action::{ActionKind, ActionPayload, QueuedAction};
pub use config::SyncConfig;
pub use queue::OfflineQueue;
pub use sender::{ActionSender, SendError};
pub use sync::{Attempt, DeliveryFailure, ReplaySummary, Synchronizer};

/// Sender preference: the live link when there is one, then HTTP.
pub fn default_senders(
    config: &SyncConfig,
    link: Option<Arc<live::GatewayLink>>,
) -> anyhow::Result<Vec<Arc<dyn ActionSender>>> {
    let mut senders: Vec<Arc<dyn ActionSender>> = Vec::new();
    if let Some(link) = link {
        senders.push(link);
    }
    senders.push(Arc::new(http::HttpSender::new(config)?));
    Ok(senders)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_is_always_the_last_resort() {
        let config = SyncConfig::new("http://localhost:3000", "ws://localhost:3000/gateway", "t");
        let senders = default_senders(&config, None).unwrap();
        assert_eq!(senders.len(), 1);
        assert_eq!(senders[0].name(), "http");
        assert!(senders[0].supports(ActionKind::UploadFile));
    }
}
