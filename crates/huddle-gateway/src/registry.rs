use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::{RwLock, mpsc};
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use huddle_types::HuddleError;
use huddle_types::events::GatewayEvent;
use huddle_types::models::GroupAction;

use crate::access::MembershipAuthority;
use crate::identity::Identity;

pub type SessionId = Uuid;

/// Default time a disconnected session is retained before final eviction.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(30);

const SHARDS: usize = 16;

/// A map split into independently locked shards keyed by uuid, so that
/// unrelated sessions and rooms never contend on one lock.
struct Shards<V> {
    shards: Vec<RwLock<HashMap<Uuid, V>>>,
}

impl<V> Shards<V> {
    fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, key: &Uuid) -> &RwLock<HashMap<Uuid, V>> {
        &self.shards[(key.as_u128() % SHARDS as u128) as usize]
    }
}

struct SessionEntry {
    identity: Identity,
    tx: mpsc::UnboundedSender<GatewayEvent>,
    rooms: HashSet<Uuid>,
    last_activity: Instant,
    stale_since: Option<Instant>,
}

struct RoomMember {
    user_id: Uuid,
    tx: mpsc::UnboundedSender<GatewayEvent>,
}

#[derive(Default)]
struct RoomState {
    sessions: HashMap<SessionId, RoomMember>,
    typing: HashSet<Uuid>,
}

impl RoomState {
    fn user_present(&self, user_id: Uuid) -> bool {
        self.sessions.values().any(|m| m.user_id == user_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Newly joined. `first_for_user` is true when no other live session of
    /// the same user was already in the room.
    Joined { first_for_user: bool },
    AlreadyJoined,
}

/// Result of pulling a user out of one room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoomExit {
    /// Live sessions of the user that were in the room.
    pub sessions: usize,
    /// The user's typing flag was set there and is now cleared.
    pub typing_cleared: bool,
}

/// A session removed after its grace window.
#[derive(Debug, Clone)]
pub struct Evicted {
    pub session_id: SessionId,
    pub user_id: Uuid,
    pub rooms: Vec<Uuid>,
    /// No other live session of this user remains.
    pub fully_offline: bool,
}

/// Who is connected and which rooms each connection occupies.
///
/// Lock order is always session shard before room shard. Publishing reads
/// only the room shard, so fan-out never waits on session mutations.
pub struct SessionRegistry {
    authority: MembershipAuthority,
    grace: Duration,
    sessions: Shards<SessionEntry>,
    rooms: Shards<RoomState>,
    /// Live (non-stale) sessions per user.
    users: Shards<HashSet<SessionId>>,
}

impl SessionRegistry {
    pub fn new(authority: MembershipAuthority, grace: Duration) -> Self {
        Self {
            authority,
            grace,
            sessions: Shards::new(),
            rooms: Shards::new(),
            users: Shards::new(),
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Record a new live session. Every call issues a fresh session id, also
    /// for a user reconnecting inside the grace window.
    pub async fn register(
        &self,
        identity: Identity,
    ) -> (SessionId, mpsc::UnboundedReceiver<GatewayEvent>) {
        let session_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let user_id = identity.user_id;

        self.sessions.shard(&session_id).write().await.insert(
            session_id,
            SessionEntry {
                identity,
                tx,
                rooms: HashSet::new(),
                last_activity: Instant::now(),
                stale_since: None,
            },
        );
        self.users
            .shard(&user_id)
            .write()
            .await
            .entry(user_id)
            .or_default()
            .insert(session_id);

        debug!("Session {} registered for user {}", session_id, user_id);
        (session_id, rx)
    }

    pub async fn identity(&self, session_id: SessionId) -> Option<Identity> {
        self.sessions
            .shard(&session_id)
            .read()
            .await
            .get(&session_id)
            .filter(|s| s.stale_since.is_none())
            .map(|s| s.identity.clone())
    }

    /// Join a group's room after the membership authority confirms the
    /// session's user may read the group.
    pub async fn join_room(
        &self,
        session_id: SessionId,
        group_id: Uuid,
    ) -> Result<JoinOutcome, HuddleError> {
        let identity = self.identity(session_id).await.ok_or(HuddleError::NotFound)?;

        self.authority
            .authorize(&identity, group_id, GroupAction::Read)
            .await?;

        let mut sessions = self.sessions.shard(&session_id).write().await;
        let entry = sessions
            .get_mut(&session_id)
            .filter(|s| s.stale_since.is_none())
            .ok_or(HuddleError::NotFound)?;

        if !entry.rooms.insert(group_id) {
            return Ok(JoinOutcome::AlreadyJoined);
        }

        let mut rooms = self.rooms.shard(&group_id).write().await;
        let room = rooms.entry(group_id).or_default();
        let first_for_user = !room.user_present(identity.user_id);
        room.sessions.insert(
            session_id,
            RoomMember {
                user_id: identity.user_id,
                tx: entry.tx.clone(),
            },
        );

        Ok(JoinOutcome::Joined { first_for_user })
    }

    /// Detach every live session of `user_id` from one room. Used when the
    /// user loses access to the group while connected.
    pub async fn leave_room(&self, user_id: Uuid, group_id: Uuid) -> RoomExit {
        let mut exit = RoomExit::default();
        for session_id in self.sessions_of(user_id).await {
            let mut sessions = self.sessions.shard(&session_id).write().await;
            let Some(entry) = sessions.get_mut(&session_id) else {
                continue;
            };
            if !entry.rooms.remove(&group_id) {
                continue;
            }
            exit.sessions += 1;
            if !self.detach(session_id, user_id, &[group_id]).await.is_empty() {
                exit.typing_cleared = true;
            }
        }
        if exit.sessions > 0 {
            debug!("User {} removed from room {} ({} sessions)", user_id, group_id, exit.sessions);
        }
        exit
    }

    /// Live sessions of a user.
    pub async fn sessions_of(&self, user_id: Uuid) -> Vec<SessionId> {
        self.users
            .shard(&user_id)
            .read()
            .await
            .get(&user_id)
            .map(|live| live.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Rooms joined by any live session of a user.
    pub async fn rooms_of(&self, user_id: Uuid) -> HashSet<Uuid> {
        let mut rooms = HashSet::new();
        for session_id in self.sessions_of(user_id).await {
            if let Some(entry) = self.sessions.shard(&session_id).read().await.get(&session_id) {
                rooms.extend(entry.rooms.iter().copied());
            }
        }
        rooms
    }

    /// Replace the identity cached on a user's live sessions, so later room
    /// joins are decided on the current role.
    pub async fn set_identity(&self, identity: Identity) {
        for session_id in self.sessions_of(identity.user_id).await {
            if let Some(entry) = self.sessions.shard(&session_id).write().await.get_mut(&session_id) {
                entry.identity = identity.clone();
            }
        }
    }

    /// Leave every room but stay connected. Returns the rooms left.
    pub async fn leave_all(&self, session_id: SessionId) -> Vec<Uuid> {
        let mut sessions = self.sessions.shard(&session_id).write().await;
        let Some(entry) = sessions.get_mut(&session_id) else {
            return vec![];
        };
        let rooms: Vec<Uuid> = entry.rooms.drain().collect();
        let user_id = entry.identity.user_id;
        self.detach(session_id, user_id, &rooms).await;
        rooms
    }

    /// Mark a session stale. It stops counting as online and stops
    /// receiving room events immediately; the record itself is kept until
    /// `evict_expired` runs after the grace window. Returns the rooms whose
    /// typing set lost this user.
    pub async fn disconnect(&self, session_id: SessionId) -> Vec<Uuid> {
        let mut sessions = self.sessions.shard(&session_id).write().await;
        let Some(entry) = sessions.get_mut(&session_id) else {
            return vec![];
        };
        if entry.stale_since.is_some() {
            return vec![];
        }
        entry.stale_since = Some(Instant::now());
        let user_id = entry.identity.user_id;
        let rooms: Vec<Uuid> = entry.rooms.iter().copied().collect();

        {
            let mut users = self.users.shard(&user_id).write().await;
            if let Some(live) = users.get_mut(&user_id) {
                live.remove(&session_id);
                if live.is_empty() {
                    users.remove(&user_id);
                }
            }
        }

        self.detach(session_id, user_id, &rooms).await
    }

    /// Remove a session from room indexes, clearing the user's typing flag
    /// where no other session of theirs remains. Caller holds the session lock.
    async fn detach(&self, session_id: SessionId, user_id: Uuid, rooms: &[Uuid]) -> Vec<Uuid> {
        let mut cleared = Vec::new();
        for group_id in rooms {
            let mut shard = self.rooms.shard(group_id).write().await;
            let Some(room) = shard.get_mut(group_id) else {
                continue;
            };
            room.sessions.remove(&session_id);
            if !room.user_present(user_id) && room.typing.remove(&user_id) {
                cleared.push(*group_id);
            }
            if room.sessions.is_empty() {
                shard.remove(group_id);
            }
        }
        cleared
    }

    /// Drop sessions whose grace window has elapsed at `now`.
    pub async fn evict_expired(&self, now: Instant) -> Vec<Evicted> {
        let mut evicted = Vec::new();
        for shard in &self.sessions.shards {
            let mut sessions = shard.write().await;
            let expired: Vec<SessionId> = sessions
                .iter()
                .filter(|(_, s)| s.stale_since.is_some_and(|t| now.duration_since(t) >= self.grace))
                .map(|(id, _)| *id)
                .collect();
            for session_id in expired {
                if let Some(entry) = sessions.remove(&session_id) {
                    evicted.push(Evicted {
                        session_id,
                        user_id: entry.identity.user_id,
                        rooms: entry.rooms.into_iter().collect(),
                        fully_offline: false,
                    });
                }
            }
        }

        for e in &mut evicted {
            e.fully_offline = !self.is_online(e.user_id).await;
        }

        if !evicted.is_empty() {
            info!("Evicted {} stale sessions", evicted.len());
        }
        evicted
    }

    pub async fn touch(&self, session_id: SessionId) {
        if let Some(entry) = self.sessions.shard(&session_id).write().await.get_mut(&session_id) {
            entry.last_activity = Instant::now();
        }
    }

    pub async fn last_activity(&self, session_id: SessionId) -> Option<Instant> {
        self.sessions
            .shard(&session_id)
            .read()
            .await
            .get(&session_id)
            .map(|s| s.last_activity)
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.users
            .shard(&user_id)
            .read()
            .await
            .get(&user_id)
            .is_some_and(|live| !live.is_empty())
    }

    pub async fn members_online(&self, group_id: Uuid) -> HashSet<Uuid> {
        self.rooms
            .shard(&group_id)
            .read()
            .await
            .get(&group_id)
            .map(|room| room.sessions.values().map(|m| m.user_id).collect())
            .unwrap_or_default()
    }

    /// Set or clear the session user's typing flag in a room the session
    /// has joined. Returns true when the flag changed. Best-effort only: a
    /// start without a stop is cleared by the client's debounce, not here.
    pub async fn set_typing(&self, session_id: SessionId, group_id: Uuid, typing: bool) -> bool {
        let sessions = self.sessions.shard(&session_id).read().await;
        let Some(entry) = sessions
            .get(&session_id)
            .filter(|s| s.stale_since.is_none() && s.rooms.contains(&group_id))
        else {
            return false;
        };
        let user_id = entry.identity.user_id;

        let mut rooms = self.rooms.shard(&group_id).write().await;
        let Some(room) = rooms.get_mut(&group_id) else {
            return false;
        };
        if typing {
            room.typing.insert(user_id)
        } else {
            room.typing.remove(&user_id)
        }
    }

    /// Clear a user's typing flag regardless of session; used when the user
    /// sends a message.
    pub async fn clear_typing(&self, group_id: Uuid, user_id: Uuid) -> bool {
        self.rooms
            .shard(&group_id)
            .write()
            .await
            .get_mut(&group_id)
            .is_some_and(|room| room.typing.remove(&user_id))
    }

    pub async fn typing_in(&self, group_id: Uuid) -> HashSet<Uuid> {
        self.rooms
            .shard(&group_id)
            .read()
            .await
            .get(&group_id)
            .map(|room| room.typing.clone())
            .unwrap_or_default()
    }

    /// Senders for every live session in a room, in no particular order.
    pub(crate) async fn room_targets(
        &self,
        group_id: Uuid,
        exclude: Option<SessionId>,
    ) -> Vec<mpsc::UnboundedSender<GatewayEvent>> {
        self.rooms
            .shard(&group_id)
            .read()
            .await
            .get(&group_id)
            .map(|room| {
                room.sessions
                    .iter()
                    .filter(|(id, _)| Some(**id) != exclude)
                    .map(|(_, m)| m.tx.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) async fn session_sender(
        &self,
        session_id: SessionId,
    ) -> Option<mpsc::UnboundedSender<GatewayEvent>> {
        self.sessions
            .shard(&session_id)
            .read()
            .await
            .get(&session_id)
            .filter(|s| s.stale_since.is_none())
            .map(|s| s.tx.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Fixture, identity};
    use huddle_types::models::{MembershipRole, Role};

    fn registry(fx: &Fixture) -> SessionRegistry {
        SessionRegistry::new(fx.authority(), DEFAULT_GRACE)
    }

    #[tokio::test]
    async fn join_requires_membership() {
        let fx = Fixture::new();
        let member = fx.user("bo", Role::Volunteer);
        let outsider = fx.user("cy", Role::Volunteer);
        let group = fx.group(&fx.root);
        fx.add(&group, &member, MembershipRole::Member);
        let reg = registry(&fx);

        let (s1, _rx1) = reg.register(identity(&member)).await;
        let (s2, _rx2) = reg.register(identity(&outsider)).await;

        assert_eq!(
            reg.join_room(s1, group.id).await.unwrap(),
            JoinOutcome::Joined { first_for_user: true }
        );
        assert_eq!(reg.join_room(s1, group.id).await.unwrap(), JoinOutcome::AlreadyJoined);
        assert!(matches!(reg.join_room(s2, group.id).await, Err(HuddleError::NotFound)));

        let online = reg.members_online(group.id).await;
        assert!(online.contains(&member.id));
        assert!(!online.contains(&outsider.id));
    }

    #[tokio::test]
    async fn global_admin_joins_without_membership() {
        let fx = Fixture::new();
        let group = fx.group(&fx.root);
        let other_admin = fx.user("ada", Role::Admin);
        let reg = registry(&fx);

        let (s, _rx) = reg.register(identity(&other_admin)).await;
        assert!(reg.join_room(s, group.id).await.is_ok());
    }

    #[tokio::test]
    async fn disconnect_is_immediately_offline_but_retained_for_grace() {
        let fx = Fixture::new();
        let member = fx.user("bo", Role::Volunteer);
        let group = fx.group(&fx.root);
        fx.add(&group, &member, MembershipRole::Member);
        let reg = registry(&fx);

        let (s1, _rx) = reg.register(identity(&member)).await;
        reg.join_room(s1, group.id).await.unwrap();
        assert!(reg.set_typing(s1, group.id, true).await);
        assert!(reg.is_online(member.id).await);

        let cleared = reg.disconnect(s1).await;
        assert_eq!(cleared, vec![group.id]);
        assert!(!reg.is_online(member.id).await);
        assert!(reg.members_online(group.id).await.is_empty());
        assert!(reg.room_targets(group.id, None).await.is_empty());

        // Still retained inside the window.
        assert!(reg.evict_expired(Instant::now()).await.is_empty());
        assert!(reg.last_activity(s1).await.is_some());

        let evicted = reg.evict_expired(Instant::now() + DEFAULT_GRACE).await;
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].rooms, vec![group.id]);
        assert!(evicted[0].fully_offline);
        assert!(reg.last_activity(s1).await.is_none());
    }

    #[tokio::test]
    async fn reconnect_in_grace_gets_new_session_id() {
        let fx = Fixture::new();
        let member = fx.user("bo", Role::Volunteer);
        let reg = registry(&fx);

        let (old, _rx) = reg.register(identity(&member)).await;
        reg.disconnect(old).await;
        let (new, _rx2) = reg.register(identity(&member)).await;

        assert_ne!(old, new);
        assert!(reg.is_online(member.id).await);

        let evicted = reg.evict_expired(Instant::now() + DEFAULT_GRACE).await;
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].session_id, old);
        assert!(!evicted[0].fully_offline);
    }

    #[tokio::test]
    async fn typing_requires_joined_room() {
        let fx = Fixture::new();
        let member = fx.user("bo", Role::Volunteer);
        let group = fx.group(&fx.root);
        fx.add(&group, &member, MembershipRole::Member);
        let reg = registry(&fx);

        let (s, _rx) = reg.register(identity(&member)).await;
        assert!(!reg.set_typing(s, group.id, true).await);

        reg.join_room(s, group.id).await.unwrap();
        assert!(reg.set_typing(s, group.id, true).await);
        assert!(!reg.set_typing(s, group.id, true).await);
        assert!(reg.typing_in(group.id).await.contains(&member.id));
        assert!(reg.clear_typing(group.id, member.id).await);
        assert!(reg.typing_in(group.id).await.is_empty());
    }

    #[tokio::test]
    async fn leave_all_keeps_session_live() {
        let fx = Fixture::new();
        let member = fx.user("bo", Role::Volunteer);
        let group = fx.group(&fx.root);
        fx.add(&group, &member, MembershipRole::Member);
        let reg = registry(&fx);

        let (s, _rx) = reg.register(identity(&member)).await;
        reg.join_room(s, group.id).await.unwrap();
        assert_eq!(reg.leave_all(s).await, vec![group.id]);
        assert!(reg.members_online(group.id).await.is_empty());
        assert!(reg.is_online(member.id).await);
    }

    #[tokio::test]
    async fn leave_room_detaches_every_session_of_the_user() {
        let fx = Fixture::new();
        let member = fx.user("bo", Role::Volunteer);
        let other = fx.user("cy", Role::Volunteer);
        let group = fx.group(&fx.root);
        let second = fx.group(&fx.root);
        fx.add(&group, &member, MembershipRole::Member);
        fx.add(&second, &member, MembershipRole::Member);
        fx.add(&group, &other, MembershipRole::Member);
        let reg = registry(&fx);

        let (phone, _rx1) = reg.register(identity(&member)).await;
        let (laptop, _rx2) = reg.register(identity(&member)).await;
        let (s_other, _rx3) = reg.register(identity(&other)).await;
        reg.join_room(phone, group.id).await.unwrap();
        reg.join_room(phone, second.id).await.unwrap();
        reg.join_room(laptop, group.id).await.unwrap();
        reg.join_room(s_other, group.id).await.unwrap();
        assert!(reg.set_typing(laptop, group.id, true).await);

        let exit = reg.leave_room(member.id, group.id).await;
        assert_eq!(exit, RoomExit { sessions: 2, typing_cleared: true });

        let online = reg.members_online(group.id).await;
        assert!(!online.contains(&member.id));
        assert!(online.contains(&other.id));
        assert_eq!(reg.room_targets(group.id, None).await.len(), 1);
        assert!(reg.typing_in(group.id).await.is_empty());
        assert_eq!(reg.rooms_of(member.id).await, HashSet::from([second.id]));
        assert!(reg.is_online(member.id).await);

        assert_eq!(reg.leave_room(member.id, group.id).await, RoomExit::default());
    }

    #[tokio::test]
    async fn refreshed_identity_decides_later_joins() {
        let fx = Fixture::new();
        let group = fx.group(&fx.root);
        let admin = fx.user("ada", Role::Admin);
        let reg = registry(&fx);

        let (s, _rx) = reg.register(identity(&admin)).await;
        let mut demoted = identity(&admin);
        demoted.role = Role::Volunteer;
        reg.set_identity(demoted.clone()).await;

        assert_eq!(reg.identity(s).await, Some(demoted));
        assert!(matches!(reg.join_room(s, group.id).await, Err(HuddleError::NotFound)));
    }
}
