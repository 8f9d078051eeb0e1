use std::sync::Arc;

use tracing::trace;
use uuid::Uuid;

use huddle_types::events::GatewayEvent;

use crate::registry::{SessionId, SessionRegistry};

/// Room-scoped publish/subscribe over the sessions in the registry.
///
/// Delivery is at most once and only to sessions in the room at publish
/// time; nothing is buffered for later joiners. Each session has its own
/// FIFO channel, so events from one publisher reach a given session in
/// publish order. Events from different publishers may interleave
/// differently at different recipients.
#[derive(Clone)]
pub struct BroadcastFabric {
    registry: Arc<SessionRegistry>,
}

impl BroadcastFabric {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Publish to every session in `group_id`'s room except `exclude`.
    /// Returns the number of sessions the event was handed to.
    pub async fn publish(
        &self,
        group_id: Uuid,
        event: GatewayEvent,
        exclude: Option<SessionId>,
    ) -> usize {
        let targets = self.registry.room_targets(group_id, exclude).await;
        let delivered = targets
            .iter()
            .filter(|tx| tx.send(event.clone()).is_ok())
            .count();
        trace!("Published to room {}: {}/{} sessions", group_id, delivered, targets.len());
        delivered
    }

    /// Send to one session only. Returns false if it is gone or stale.
    pub async fn send_to_session(&self, session_id: SessionId, event: GatewayEvent) -> bool {
        match self.registry.session_sender(session_id).await {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DEFAULT_GRACE;
    use crate::testing::{Fixture, identity};
    use huddle_types::models::{MembershipRole, Role};

    #[tokio::test]
    async fn publish_skips_excluded_and_non_joined_sessions() {
        let fx = Fixture::new();
        let a = fx.user("ada", Role::Volunteer);
        let b = fx.user("bo", Role::Volunteer);
        let group = fx.group(&fx.root);
        fx.add(&group, &a, MembershipRole::Member);
        fx.add(&group, &b, MembershipRole::Member);

        let registry = Arc::new(SessionRegistry::new(fx.authority(), DEFAULT_GRACE));
        let fabric = BroadcastFabric::new(registry.clone());

        let (sa, mut rxa) = registry.register(identity(&a)).await;
        let (sb, mut rxb) = registry.register(identity(&b)).await;
        registry.join_room(sa, group.id).await.unwrap();

        let event = GatewayEvent::UserStopTyping { group_id: group.id, user_id: a.id };
        // b has not joined yet, a is excluded.
        assert_eq!(fabric.publish(group.id, event.clone(), Some(sa)).await, 0);

        registry.join_room(sb, group.id).await.unwrap();
        assert_eq!(fabric.publish(group.id, event.clone(), Some(sa)).await, 1);

        assert_eq!(rxb.recv().await.unwrap(), event);
        assert!(rxa.try_recv().is_err());
        assert!(rxb.try_recv().is_err());
    }

    #[tokio::test]
    async fn same_publisher_order_is_preserved() {
        let fx = Fixture::new();
        let a = fx.user("ada", Role::Volunteer);
        let group = fx.group(&fx.root);
        fx.add(&group, &a, MembershipRole::Member);

        let registry = Arc::new(SessionRegistry::new(fx.authority(), DEFAULT_GRACE));
        let fabric = BroadcastFabric::new(registry.clone());
        let (s, mut rx) = registry.register(identity(&a)).await;
        registry.join_room(s, group.id).await.unwrap();

        for online in [true, false, true] {
            fabric
                .publish(
                    group.id,
                    GatewayEvent::PresenceUpdate { group_id: group.id, user_id: a.id, online },
                    None,
                )
                .await;
        }

        let mut seen = Vec::new();
        while let Ok(GatewayEvent::PresenceUpdate { online, .. }) = rx.try_recv() {
            seen.push(online);
        }
        assert_eq!(seen, vec![true, false, true]);
    }

    #[tokio::test]
    async fn stale_sessions_receive_nothing() {
        let fx = Fixture::new();
        let a = fx.user("ada", Role::Volunteer);
        let registry = Arc::new(SessionRegistry::new(fx.authority(), DEFAULT_GRACE));
        let fabric = BroadcastFabric::new(registry.clone());

        let (s, _rx) = registry.register(identity(&a)).await;
        registry.disconnect(s).await;

        let event = GatewayEvent::Joined { group_ids: vec![], rejected: vec![] };
        assert!(!fabric.send_to_session(s, event).await);
    }
}
