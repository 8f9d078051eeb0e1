use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use huddle_types::HuddleError;
use huddle_types::api::CreateMessageRequest;
use huddle_types::events::{GatewayEvent, SendMessageCommand};
use huddle_types::models::{GroupAction, UserStatus};

use crate::access::MembershipAuthority;
use crate::fabric::BroadcastFabric;
use crate::identity::{Identity, IdentityResolver};
use crate::registry::{JoinOutcome, SessionId, SessionRegistry};
use crate::store::Store;
use crate::tracker::DeliveryTracker;

/// Composes the gateway components and handles what a connection asks for.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    store: Store,
    identity: IdentityResolver,
    authority: MembershipAuthority,
    registry: Arc<SessionRegistry>,
    fabric: BroadcastFabric,
    tracker: DeliveryTracker,
}

impl Dispatcher {
    pub fn new(store: Store, identity: IdentityResolver, grace: Duration) -> Self {
        let authority = MembershipAuthority::new(store.clone());
        let registry = Arc::new(SessionRegistry::new(authority.clone(), grace));
        let fabric = BroadcastFabric::new(registry.clone());
        let tracker = DeliveryTracker::new(
            store.clone(),
            authority.clone(),
            registry.clone(),
            fabric.clone(),
        );

        Self {
            inner: Arc::new(DispatcherInner {
                store,
                identity,
                authority,
                registry,
                fabric,
                tracker,
            }),
        }
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn identity(&self) -> &IdentityResolver {
        &self.inner.identity
    }

    pub fn authority(&self) -> &MembershipAuthority {
        &self.inner.authority
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.inner.registry
    }

    pub fn fabric(&self) -> &BroadcastFabric {
        &self.inner.fabric
    }

    pub fn tracker(&self) -> &DeliveryTracker {
        &self.inner.tracker
    }

    /// Register a live session for a verified identity and stamp last-seen.
    pub async fn connect(
        &self,
        identity: Identity,
    ) -> (SessionId, mpsc::UnboundedReceiver<GatewayEvent>) {
        let user_id = identity.user_id;
        let now = Utc::now();
        if let Err(e) = self
            .inner
            .store
            .call("touch last seen", move |db| db.touch_last_seen(user_id, now))
            .await
        {
            // Last-seen is advisory; the connection proceeds.
            warn!("Could not record last-seen for {}: {}", user_id, e);
        }

        self.inner.registry.register(identity).await
    }

    /// The caller as the store sees them now. A connection keeps the
    /// identity from its handshake; every write and join re-reads it so a
    /// role change or deactivation applies to the next command.
    pub async fn reload(&self, identity: &Identity) -> Result<Identity, HuddleError> {
        let user_id = identity.user_id;
        self.inner
            .store
            .call("reload user", move |db| db.get_user(user_id))
            .await?
            .filter(|user| user.status == UserStatus::Active)
            .map(|user| Identity::from(&user))
            .ok_or(HuddleError::Authentication)
    }

    /// Join each requested room the membership authority allows. Returns
    /// (joined, rejected). A user's first session in a room announces
    /// presence there.
    pub async fn join_groups(
        &self,
        session_id: SessionId,
        group_ids: Vec<Uuid>,
    ) -> (Vec<Uuid>, Vec<Uuid>) {
        let mut joined = Vec::new();
        let mut rejected = Vec::new();
        let Some(cached) = self.inner.registry.identity(session_id).await else {
            return (joined, group_ids);
        };
        match self.reload(&cached).await {
            Ok(current) if current != cached => self.inner.registry.set_identity(current).await,
            Ok(_) => {}
            Err(e) => {
                debug!("Session {} may no longer join rooms: {}", session_id, e);
                return (joined, group_ids);
            }
        }
        let user_id = cached.user_id;

        for group_id in group_ids {
            match self.inner.registry.join_room(session_id, group_id).await {
                Ok(outcome) => {
                    joined.push(group_id);
                    if outcome == (JoinOutcome::Joined { first_for_user: true }) {
                        self.inner
                            .fabric
                            .publish(
                                group_id,
                                GatewayEvent::PresenceUpdate {
                                    group_id,
                                    user_id,
                                    online: true,
                                },
                                Some(session_id),
                            )
                            .await;
                    }
                }
                Err(e) => {
                    debug!("Session {} refused room {}: {}", session_id, group_id, e);
                    rejected.push(group_id);
                }
            }
        }

        (joined, rejected)
    }

    pub async fn typing(&self, session_id: SessionId, group_id: Uuid, typing: bool) {
        let Some(identity) = self.inner.registry.identity(session_id).await else {
            return;
        };
        if !self.inner.registry.set_typing(session_id, group_id, typing).await {
            return;
        }

        let event = if typing {
            GatewayEvent::UserTyping {
                group_id,
                user_id: identity.user_id,
                username: identity.username,
            }
        } else {
            GatewayEvent::UserStopTyping {
                group_id,
                user_id: identity.user_id,
            }
        };
        self.inner.fabric.publish(group_id, event, Some(session_id)).await;
    }

    /// Handle `send-message` for the session's user. Failures go back to
    /// the session as `message-error`, tagged with the client's id. The
    /// identity is captured by the connection, so a write queued before a
    /// disconnect still completes; its role and status are re-read first.
    pub async fn send_message(
        &self,
        identity: &Identity,
        session_id: SessionId,
        cmd: SendMessageCommand,
    ) {
        let client_id = cmd.client_id;
        let req = CreateMessageRequest {
            content: cmd.content,
            message_type: cmd.message_type,
            reply_to: cmd.reply_to,
            tags: cmd.tags,
            client_id,
        };
        let result = match self.reload(identity).await {
            Ok(current) => {
                self.inner
                    .tracker
                    .create_message(&current, Some(session_id), cmd.group_id, req)
                    .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            warn!("send-message from {} refused: {}", identity.username, e);
            self.inner
                .fabric
                .send_to_session(
                    session_id,
                    GatewayEvent::MessageError {
                        client_id,
                        error: e.kind(),
                        message: e.to_string(),
                    },
                )
                .await;
        }
    }

    pub async fn mark_read(&self, identity: &Identity, group_id: Uuid, message_id: Option<Uuid>) {
        let result = match (self.reload(identity).await, message_id) {
            (Err(e), _) => Err(e),
            (Ok(current), Some(message_id)) => self
                .inner
                .tracker
                .mark_read(&current, group_id, message_id)
                .await
                .map(|_| ()),
            (Ok(current), None) => self
                .inner
                .tracker
                .mark_group_read(&current, group_id)
                .await
                .map(|_| ()),
        };
        if let Err(e) = result {
            warn!("mark-read from {} in group {} refused: {}", identity.username, group_id, e);
        }
    }

    /// A membership row was removed. Unless the user can still read the
    /// group through their global role, their sessions leave its room.
    pub async fn revoke_membership(&self, user_id: Uuid, group_id: Uuid) {
        let user = self
            .inner
            .store
            .call("load user for revoke", move |db| db.get_user(user_id))
            .await;
        if let Ok(Some(user)) = user {
            let current = Identity::from(&user);
            if user.status == UserStatus::Active
                && matches!(
                    self.inner.authority.can_access(&current, group_id, GroupAction::Read).await,
                    Ok(true)
                )
            {
                return;
            }
        }
        self.leave_room(user_id, group_id).await;
    }

    /// Pull a user's sessions out of a room and tell the room they are gone.
    async fn leave_room(&self, user_id: Uuid, group_id: Uuid) {
        let exit = self.inner.registry.leave_room(user_id, group_id).await;
        if exit.sessions == 0 {
            return;
        }
        if exit.typing_cleared {
            self.inner
                .fabric
                .publish(group_id, GatewayEvent::UserStopTyping { group_id, user_id }, None)
                .await;
        }
        self.inner
            .fabric
            .publish(
                group_id,
                GatewayEvent::PresenceUpdate {
                    group_id,
                    user_id,
                    online: false,
                },
                None,
            )
            .await;
        info!("User {} removed from live room {}", user_id, group_id);
    }

    /// Re-read a user after an account change. An inactive user leaves
    /// every room; otherwise the cached role is replaced and rooms the user
    /// can no longer read are left.
    pub async fn refresh_user(&self, user_id: Uuid) -> Result<(), HuddleError> {
        let user = self
            .inner
            .store
            .call("load user for refresh", move |db| db.get_user(user_id))
            .await?;

        let Some(current) = user
            .filter(|u| u.status == UserStatus::Active)
            .map(|u| Identity::from(&u))
        else {
            let mut rooms = HashSet::new();
            for session_id in self.inner.registry.sessions_of(user_id).await {
                rooms.extend(self.inner.registry.leave_all(session_id).await);
            }
            for group_id in rooms {
                self.inner
                    .fabric
                    .publish(group_id, GatewayEvent::UserStopTyping { group_id, user_id }, None)
                    .await;
                self.inner
                    .fabric
                    .publish(
                        group_id,
                        GatewayEvent::PresenceUpdate {
                            group_id,
                            user_id,
                            online: false,
                        },
                        None,
                    )
                    .await;
            }
            info!("Inactive user {} removed from all live rooms", user_id);
            return Ok(());
        };

        self.inner.registry.set_identity(current.clone()).await;
        for group_id in self.inner.registry.rooms_of(user_id).await {
            if !self
                .inner
                .authority
                .can_access(&current, group_id, GroupAction::Read)
                .await?
            {
                self.leave_room(user_id, group_id).await;
            }
        }
        Ok(())
    }

    /// The connection is gone: stop targeting it and clear its typing flags.
    /// In-flight writes it started are not cancelled.
    pub async fn disconnect(&self, session_id: SessionId) {
        let Some(identity) = self.inner.registry.identity(session_id).await else {
            return;
        };
        let cleared = self.inner.registry.disconnect(session_id).await;
        for group_id in cleared {
            self.inner
                .fabric
                .publish(
                    group_id,
                    GatewayEvent::UserStopTyping {
                        group_id,
                        user_id: identity.user_id,
                    },
                    None,
                )
                .await;
        }
    }

    /// Evict sessions past their grace window and announce users that are
    /// now fully offline to the rooms they had joined.
    pub async fn evict_expired(&self, now: Instant) -> usize {
        let evicted = self.inner.registry.evict_expired(now).await;
        // Several sessions of one user can expire in the same pass.
        let mut announced = HashSet::new();
        for e in &evicted {
            if !e.fully_offline {
                continue;
            }
            for group_id in &e.rooms {
                if !announced.insert((e.user_id, *group_id)) {
                    continue;
                }
                if self.inner.registry.members_online(*group_id).await.contains(&e.user_id) {
                    continue;
                }
                self.inner
                    .fabric
                    .publish(
                        *group_id,
                        GatewayEvent::PresenceUpdate {
                            group_id: *group_id,
                            user_id: e.user_id,
                            online: false,
                        },
                        None,
                    )
                    .await;
            }
        }
        evicted.len()
    }

    /// Background eviction. Runs until the task is dropped.
    pub async fn run_eviction_loop(self, every: Duration) {
        let mut interval = tokio::time::interval(every);
        info!(
            "Session eviction running every {:?} (grace {:?})",
            every,
            self.inner.registry.grace()
        );

        loop {
            interval.tick().await;
            let count = self.evict_expired(Instant::now()).await;
            if count > 0 {
                debug!("Eviction pass removed {} sessions", count);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Fixture, identity};
    use huddle_types::models::{MembershipRole, Role};

    #[tokio::test]
    async fn presence_is_announced_on_join_and_after_grace() {
        let fx = Fixture::new();
        let a = fx.user("ada", Role::Volunteer);
        let b = fx.user("bo", Role::Volunteer);
        let group = fx.group(&fx.root);
        fx.add(&group, &a, MembershipRole::Member);
        fx.add(&group, &b, MembershipRole::Member);
        let dispatcher = fx.dispatcher();

        let (sa, mut rxa) = dispatcher.connect(identity(&a)).await;
        dispatcher.join_groups(sa, vec![group.id]).await;

        let (sb, _rxb) = dispatcher.connect(identity(&b)).await;
        let (joined, rejected) = dispatcher.join_groups(sb, vec![group.id, Uuid::new_v4()]).await;
        assert_eq!(joined, vec![group.id]);
        assert_eq!(rejected.len(), 1);

        assert_eq!(
            rxa.recv().await.unwrap(),
            GatewayEvent::PresenceUpdate { group_id: group.id, user_id: b.id, online: true }
        );

        dispatcher.disconnect(sb).await;
        assert!(rxa.try_recv().is_err());

        let grace = dispatcher.registry().grace();
        assert_eq!(dispatcher.evict_expired(Instant::now() + grace).await, 1);
        assert_eq!(
            rxa.recv().await.unwrap(),
            GatewayEvent::PresenceUpdate { group_id: group.id, user_id: b.id, online: false }
        );
    }

    #[tokio::test]
    async fn typing_is_echo_suppressed() {
        let fx = Fixture::new();
        let a = fx.user("ada", Role::Volunteer);
        let b = fx.user("bo", Role::Volunteer);
        let group = fx.group(&fx.root);
        fx.add(&group, &a, MembershipRole::Member);
        fx.add(&group, &b, MembershipRole::Member);
        let dispatcher = fx.dispatcher();

        let (sa, mut rxa) = dispatcher.connect(identity(&a)).await;
        let (sb, mut rxb) = dispatcher.connect(identity(&b)).await;
        dispatcher.join_groups(sb, vec![group.id]).await;
        dispatcher.join_groups(sa, vec![group.id]).await;
        while rxb.try_recv().is_ok() {}

        dispatcher.typing(sa, group.id, true).await;
        dispatcher.typing(sa, group.id, true).await;
        assert!(matches!(rxb.recv().await, Some(GatewayEvent::UserTyping { user_id, .. }) if user_id == a.id));
        assert!(rxb.try_recv().is_err());
        assert!(rxa.try_recv().is_err());

        // Sending a message clears the indicator.
        dispatcher
            .send_message(
                &identity(&a),
                sa,
                SendMessageCommand {
                    group_id: group.id,
                    content: "on my way".into(),
                    message_type: None,
                    reply_to: None,
                    tags: vec![],
                    client_id: None,
                },
            )
            .await;
        assert!(matches!(rxb.recv().await, Some(GatewayEvent::UserStopTyping { .. })));
        assert!(matches!(rxb.recv().await, Some(GatewayEvent::NewMessage { .. })));
        assert!(dispatcher.registry().typing_in(group.id).await.is_empty());
    }

    #[tokio::test]
    async fn refused_send_reports_message_error() {
        let fx = Fixture::new();
        let outsider = fx.user("cy", Role::Volunteer);
        let group = fx.group(&fx.root);
        let dispatcher = fx.dispatcher();

        let (s, mut rx) = dispatcher.connect(identity(&outsider)).await;
        let client_id = Uuid::new_v4();
        dispatcher
            .send_message(
                &identity(&outsider),
                s,
                SendMessageCommand {
                    group_id: group.id,
                    content: "let me in".into(),
                    message_type: None,
                    reply_to: None,
                    tags: vec![],
                    client_id: Some(client_id),
                },
            )
            .await;

        match rx.recv().await.unwrap() {
            GatewayEvent::MessageError { client_id: cid, error, .. } => {
                assert_eq!(cid, Some(client_id));
                assert_eq!(error, huddle_types::ErrorKind::NotFound);
            }
            other => panic!("unexpected {:?}", other),
        }
        let stored = fx.store.database().list_messages(group.id, 50, 0, None).unwrap();
        assert!(stored.is_empty());
    }

    #[tokio::test]
    async fn offline_presence_is_announced_once_per_room() {
        let fx = Fixture::new();
        let a = fx.user("ada", Role::Volunteer);
        let b = fx.user("bo", Role::Volunteer);
        let group = fx.group(&fx.root);
        fx.add(&group, &a, MembershipRole::Member);
        fx.add(&group, &b, MembershipRole::Member);
        let dispatcher = fx.dispatcher();

        let (sa, mut rxa) = dispatcher.connect(identity(&a)).await;
        dispatcher.join_groups(sa, vec![group.id]).await;
        let (phone, _rx1) = dispatcher.connect(identity(&b)).await;
        let (laptop, _rx2) = dispatcher.connect(identity(&b)).await;
        dispatcher.join_groups(phone, vec![group.id]).await;
        dispatcher.join_groups(laptop, vec![group.id]).await;
        while rxa.try_recv().is_ok() {}

        dispatcher.disconnect(phone).await;
        dispatcher.disconnect(laptop).await;
        let grace = dispatcher.registry().grace();
        assert_eq!(dispatcher.evict_expired(Instant::now() + grace).await, 2);

        let mut offline = 0;
        while let Ok(event) = rxa.try_recv() {
            if let GatewayEvent::PresenceUpdate { user_id, online: false, .. } = event {
                assert_eq!(user_id, b.id);
                offline += 1;
            }
        }
        assert_eq!(offline, 1);
    }

    #[tokio::test]
    async fn demoted_admin_loses_rooms_it_held_only_by_role() {
        let fx = Fixture::new();
        let admin = fx.user("ada", Role::Admin);
        let group = fx.group(&fx.root);
        let dispatcher = fx.dispatcher();

        let (s, _rx) = dispatcher.connect(identity(&admin)).await;
        let (joined, _) = dispatcher.join_groups(s, vec![group.id]).await;
        assert_eq!(joined, vec![group.id]);

        fx.store.database().set_user_role(admin.id, Role::Volunteer).unwrap();
        dispatcher.refresh_user(admin.id).await.unwrap();

        assert!(!dispatcher.registry().members_online(group.id).await.contains(&admin.id));
        assert_eq!(dispatcher.registry().identity(s).await.unwrap().role, Role::Volunteer);
        let (joined, rejected) = dispatcher.join_groups(s, vec![group.id]).await;
        assert!(joined.is_empty());
        assert_eq!(rejected, vec![group.id]);
    }
}
