use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use huddle_db::{Database, NewGroup, NewUser};
use huddle_types::models::{Group, GroupType, MembershipRole, Role, User};

use crate::access::MembershipAuthority;
use crate::dispatcher::Dispatcher;
use crate::identity::{Identity, IdentityResolver};
use crate::store::Store;

/// In-memory store with an organization whose bootstrap admin already exists,
/// so `user()` gets exactly the role it asks for.
pub(crate) struct Fixture {
    pub store: Store,
    pub identity: IdentityResolver,
    pub root: User,
}

impl Fixture {
    pub fn new() -> Self {
        let store = Store::new(Database::open_in_memory().unwrap(), 4);
        let identity = IdentityResolver::new("test-secret", chrono::Duration::hours(1), store.clone());
        let root = create_user(&store, "root", Role::Admin);
        Self {
            store,
            identity,
            root,
        }
    }

    pub fn user(&self, username: &str, role: Role) -> User {
        create_user(&self.store, username, role)
    }

    pub fn group(&self, creator: &User) -> Group {
        self.store
            .database()
            .create_group(&NewGroup {
                id: Uuid::new_v4(),
                name: "logistics".into(),
                group_type: GroupType::Team,
                description: None,
                organization_id: creator.organization_id.clone(),
                created_by: creator.id,
                created_at: Utc::now(),
            })
            .unwrap()
    }

    pub fn add(&self, group: &Group, user: &User, role: MembershipRole) {
        self.store
            .database()
            .add_member(group.id, user.id, role, Utc::now())
            .unwrap();
    }

    pub fn authority(&self) -> MembershipAuthority {
        MembershipAuthority::new(self.store.clone())
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(self.store.clone(), self.identity.clone(), Duration::from_secs(30))
    }
}

pub(crate) fn identity(user: &User) -> Identity {
    Identity::from(user)
}

fn create_user(store: &Store, username: &str, role: Role) -> User {
    store
        .database()
        .create_user(&NewUser {
            id: Uuid::new_v4(),
            username: username.into(),
            display_name: username.into(),
            password_hash: "unused".into(),
            organization_id: "relief-org".into(),
            role,
            created_at: Utc::now(),
        })
        .unwrap()
}
