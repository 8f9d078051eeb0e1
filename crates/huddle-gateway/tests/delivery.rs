use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use huddle_db::{Database, NewGroup, NewUser};
use huddle_gateway::dispatcher::Dispatcher;
use huddle_gateway::identity::{Identity, IdentityResolver};
use huddle_gateway::store::Store;
use huddle_types::error::ErrorKind;
use huddle_types::events::{GatewayEvent, SendMessageCommand};
use huddle_types::models::{Group, GroupType, MembershipRole, Role, User};

struct Org {
    store: Store,
    dispatcher: Dispatcher,
    admin: User,
}

impl Org {
    fn new() -> Self {
        let store = Store::new(Database::open_in_memory().unwrap(), 4);
        let resolver =
            IdentityResolver::new("integration-secret", chrono::Duration::hours(1), store.clone());
        let dispatcher = Dispatcher::new(store.clone(), resolver, Duration::from_secs(30));
        let admin = create_user(&store, "coordinator", Role::Admin);
        Self {
            store,
            dispatcher,
            admin,
        }
    }

    fn user(&self, username: &str) -> User {
        create_user(&self.store, username, Role::Volunteer)
    }

    /// A group created by `creator`, who becomes its admin member.
    fn group_by(&self, creator: &User, members: &[&User]) -> Group {
        let db = self.store.database();
        let group = db
            .create_group(&NewGroup {
                id: Uuid::new_v4(),
                name: "shelter-north".into(),
                group_type: GroupType::Team,
                description: Some("night shift".into()),
                organization_id: creator.organization_id.clone(),
                created_by: creator.id,
                created_at: Utc::now(),
            })
            .unwrap();
        for m in members {
            db.add_member(group.id, m.id, MembershipRole::Member, Utc::now())
                .unwrap();
        }
        group
    }

    async fn online(&self, user: &User, group: &Group) -> (Uuid, UnboundedReceiver<GatewayEvent>) {
        let (session, rx) = self.dispatcher.connect(Identity::from(user)).await;
        let (joined, _) = self.dispatcher.join_groups(session, vec![group.id]).await;
        assert_eq!(joined, vec![group.id]);
        (session, rx)
    }
}

fn create_user(store: &Store, username: &str, role: Role) -> User {
    store
        .database()
        .create_user(&NewUser {
            id: Uuid::new_v4(),
            username: username.into(),
            display_name: username.into(),
            password_hash: "unused".into(),
            organization_id: "harbor-relief".into(),
            role,
            created_at: Utc::now(),
        })
        .unwrap()
}

fn command(group: &Group, content: &str, client_id: Option<Uuid>) -> SendMessageCommand {
    SendMessageCommand {
        group_id: group.id,
        content: content.into(),
        message_type: None,
        reply_to: None,
        tags: vec![],
        client_id,
    }
}

fn drain(rx: &mut UnboundedReceiver<GatewayEvent>) -> Vec<GatewayEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn message_reaches_every_other_member_and_confirms_to_sender() {
    let org = Org::new();
    let a = org.user("amal");
    let b = org.user("bruno");
    let c = org.user("chen");
    let group = org.group_by(&a, &[&b, &c]);

    let (sa, mut rxa) = org.online(&a, &group).await;
    let (_, mut rxb) = org.online(&b, &group).await;
    let (_, mut rxc) = org.online(&c, &group).await;
    drain(&mut rxa);
    drain(&mut rxb);
    drain(&mut rxc);

    let client_id = Uuid::new_v4();
    org.dispatcher
        .send_message(&Identity::from(&a), sa, command(&group, "water truck at 9", Some(client_id)))
        .await;

    let sent = drain(&mut rxa);
    assert_eq!(sent.len(), 1);
    let message = match &sent[0] {
        GatewayEvent::MessageSent {
            client_id: cid,
            message,
        } => {
            assert_eq!(*cid, Some(client_id));
            message.clone()
        }
        other => panic!("sender got {:?}", other),
    };

    for rx in [&mut rxb, &mut rxc] {
        let events = drain(rx);
        assert_eq!(events, vec![GatewayEvent::NewMessage { message: message.clone() }]);
    }

    let statuses = org.store.database().message_status(message.id).unwrap();
    assert_eq!(statuses.len(), 3);
    let own = statuses.iter().find(|s| s.user_id == a.id).unwrap();
    assert!(own.read_at.is_some());
    assert!(statuses
        .iter()
        .filter(|s| s.user_id != a.id)
        .all(|s| s.read_at.is_none()));
}

#[tokio::test]
async fn replayed_client_id_is_stored_once() {
    let org = Org::new();
    let a = org.user("amal");
    let b = org.user("bruno");
    let group = org.group_by(&a, &[&b]);

    let (sa, mut rxa) = org.online(&a, &group).await;
    let (_, mut rxb) = org.online(&b, &group).await;
    drain(&mut rxa);
    drain(&mut rxb);

    let client_id = Uuid::new_v4();
    let identity = Identity::from(&a);
    org.dispatcher
        .send_message(&identity, sa, command(&group, "generator fuel low", Some(client_id)))
        .await;
    // Reconnect and replay the same queued action.
    org.dispatcher
        .send_message(&identity, sa, command(&group, "generator fuel low", Some(client_id)))
        .await;

    let stored = org.store.database().list_messages(group.id, 50, 0, None).unwrap();
    assert_eq!(stored.len(), 1);

    let confirmations = drain(&mut rxa);
    assert_eq!(confirmations.len(), 2);
    assert!(confirmations.iter().all(|e| matches!(
        e,
        GatewayEvent::MessageSent { message, .. } if message.id == stored[0].id
    )));
    assert_eq!(drain(&mut rxb).len(), 1);
}

#[tokio::test]
async fn outsiders_cannot_join_or_receive() {
    let org = Org::new();
    let a = org.user("amal");
    let outsider = org.user("olek");
    let group = org.group_by(&org.admin, &[&a]);

    let (sa, mut rxa) = org.online(&a, &group).await;
    let (so, mut rxo) = org.dispatcher.connect(Identity::from(&outsider)).await;
    let (joined, rejected) = org.dispatcher.join_groups(so, vec![group.id]).await;
    assert!(joined.is_empty());
    assert_eq!(rejected, vec![group.id]);

    org.dispatcher
        .send_message(&Identity::from(&a), sa, command(&group, "medical kit restocked", None))
        .await;

    assert_eq!(drain(&mut rxa).len(), 1);
    assert!(drain(&mut rxo).is_empty());
    assert!(!org
        .dispatcher
        .registry()
        .members_online(group.id)
        .await
        .contains(&outsider.id));
}

#[tokio::test]
async fn read_receipts_fire_once() {
    let org = Org::new();
    let a = org.user("amal");
    let b = org.user("bruno");
    let group = org.group_by(&a, &[&b]);

    let (sa, mut rxa) = org.online(&a, &group).await;
    let (sb, mut rxb) = org.online(&b, &group).await;
    org.dispatcher
        .send_message(&Identity::from(&a), sa, command(&group, "roll call", None))
        .await;
    drain(&mut rxa);
    let message_id = match drain(&mut rxb).pop() {
        Some(GatewayEvent::NewMessage { message }) => message.id,
        other => panic!("unexpected {:?}", other),
    };

    let reader = Identity::from(&b);
    org.dispatcher.mark_read(&reader, group.id, Some(message_id)).await;
    org.dispatcher.mark_read(&reader, group.id, Some(message_id)).await;
    org.dispatcher.mark_read(&reader, group.id, None).await;

    let receipts = drain(&mut rxa);
    assert_eq!(receipts.len(), 1);
    assert!(matches!(
        &receipts[0],
        GatewayEvent::MessageRead { user_id, message_ids, .. }
            if *user_id == b.id && message_ids == &vec![message_id]
    ));

    org.dispatcher.disconnect(sb).await;
    assert!(!org.dispatcher.registry().is_online(b.id).await);
}

#[tokio::test]
async fn removed_member_stops_receiving_room_events() {
    let org = Org::new();
    let a = org.user("amal");
    let b = org.user("bruno");
    let group = org.group_by(&a, &[&b]);

    let (sa, mut rxa) = org.online(&a, &group).await;
    let (_, mut rxb) = org.online(&b, &group).await;
    drain(&mut rxa);
    drain(&mut rxb);

    org.store.database().remove_member(group.id, b.id).unwrap();
    org.dispatcher.revoke_membership(b.id, group.id).await;

    assert_eq!(
        drain(&mut rxa),
        vec![GatewayEvent::PresenceUpdate {
            group_id: group.id,
            user_id: b.id,
            online: false,
        }]
    );
    assert!(!org.dispatcher.registry().members_online(group.id).await.contains(&b.id));

    org.dispatcher
        .send_message(&Identity::from(&a), sa, command(&group, "convoy leaves at dawn", None))
        .await;
    assert_eq!(drain(&mut rxa).len(), 1);
    assert!(drain(&mut rxb).is_empty());
}

#[tokio::test]
async fn demoted_admin_next_send_is_refused() {
    let org = Org::new();
    let a = org.user("amal");
    let group = org.group_by(&a, &[]);
    let dana = create_user(&org.store, "dana", Role::Admin);

    // Admin by role only, not a member of the group.
    let handshake = Identity::from(&dana);
    let (sd, mut rxd) = org.online(&dana, &group).await;
    drain(&mut rxd);

    org.store.database().set_user_role(dana.id, Role::Volunteer).unwrap();
    org.dispatcher
        .send_message(&handshake, sd, command(&group, "stand down", Some(Uuid::new_v4())))
        .await;

    let events = drain(&mut rxd);
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        GatewayEvent::MessageError { error: ErrorKind::NotFound, client_id: Some(_), .. }
    ));
    assert!(org.store.database().list_messages(group.id, 50, 0, None).unwrap().is_empty());
}

#[tokio::test]
async fn deactivated_user_next_send_is_refused_and_rooms_are_left() {
    let org = Org::new();
    let a = org.user("amal");
    let b = org.user("bruno");
    let group = org.group_by(&a, &[&b]);

    let (_, mut rxa) = org.online(&a, &group).await;
    let handshake = Identity::from(&b);
    let (sb, mut rxb) = org.online(&b, &group).await;
    drain(&mut rxa);
    drain(&mut rxb);

    org.store.database().deactivate_user(b.id).unwrap();
    org.dispatcher
        .send_message(&handshake, sb, command(&group, "still here?", None))
        .await;
    let events = drain(&mut rxb);
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        GatewayEvent::MessageError { error: ErrorKind::Authentication, .. }
    ));
    assert!(drain(&mut rxa).is_empty());

    org.dispatcher.refresh_user(b.id).await.unwrap();
    assert!(!org.dispatcher.registry().members_online(group.id).await.contains(&b.id));
    assert!(drain(&mut rxa).contains(&GatewayEvent::PresenceUpdate {
        group_id: group.id,
        user_id: b.id,
        online: false,
    }));

    let (joined, rejected) = org.dispatcher.join_groups(sb, vec![group.id]).await;
    assert!(joined.is_empty());
    assert_eq!(rejected, vec![group.id]);
}

#[tokio::test]
async fn removed_member_who_is_a_global_admin_keeps_the_room() {
    let org = Org::new();
    let a = org.user("amal");
    let dana = create_user(&org.store, "dana", Role::Admin);
    let group = org.group_by(&a, &[&dana]);

    let (_, mut rxa) = org.online(&a, &group).await;
    org.online(&dana, &group).await;
    drain(&mut rxa);

    org.store.database().remove_member(group.id, dana.id).unwrap();
    org.dispatcher.revoke_membership(dana.id, group.id).await;

    assert!(org.dispatcher.registry().members_online(group.id).await.contains(&dana.id));
    assert!(drain(&mut rxa).is_empty());
}
