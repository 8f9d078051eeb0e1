use uuid::Uuid;

use huddle_types::HuddleError;
use huddle_types::models::{Group, GroupAction, MembershipRole, Message, Role};

use crate::identity::Identity;
use crate::store::Store;

/// Decide an action from the caller's standing in a group. First match wins:
/// global admin, then no membership (refused), then creator, then the
/// per-action policy on the membership role.
pub fn resolve(
    role: Role,
    is_creator: bool,
    membership: Option<MembershipRole>,
    action: GroupAction,
) -> bool {
    if role == Role::Admin {
        return true;
    }
    let Some(membership) = membership else {
        return false;
    };
    if is_creator {
        return true;
    }
    match action {
        GroupAction::Read | GroupAction::Write => true,
        GroupAction::Delete | GroupAction::Manage => {
            matches!(membership, MembershipRole::Admin | MembershipRole::Moderator)
        }
    }
}

fn decide(
    identity: &Identity,
    group: &Group,
    membership: Option<MembershipRole>,
    action: GroupAction,
) -> bool {
    // Groups never leak across organizations, admins included.
    if group.organization_id != identity.organization_id {
        return false;
    }
    resolve(
        identity.role,
        group.created_by == identity.user_id,
        membership,
        action,
    )
}

/// The single authority for group-scoped permissions. Room joins, message
/// writes and every delete/manage request go through here.
#[derive(Clone)]
pub struct MembershipAuthority {
    store: Store,
}

impl MembershipAuthority {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn can_access(
        &self,
        identity: &Identity,
        group_id: Uuid,
        action: GroupAction,
    ) -> Result<bool, HuddleError> {
        let snapshot = self.snapshot(identity, group_id).await?;
        Ok(snapshot.is_some_and(|(group, membership)| decide(identity, &group, membership, action)))
    }

    /// Like `can_access`, but returns the group on success and the right
    /// error otherwise. Callers that cannot even read the group get
    /// `NotFound`, so existence is never revealed.
    pub async fn authorize(
        &self,
        identity: &Identity,
        group_id: Uuid,
        action: GroupAction,
    ) -> Result<Group, HuddleError> {
        let (group, membership) = self
            .snapshot(identity, group_id)
            .await?
            .ok_or(HuddleError::NotFound)?;

        if decide(identity, &group, membership, action) {
            return Ok(group);
        }
        if !decide(identity, &group, membership, GroupAction::Read) {
            return Err(HuddleError::NotFound);
        }

        let role = membership.map(|m| m.to_string()).unwrap_or_else(|| identity.role.to_string());
        Err(HuddleError::forbidden(format!("{} group {}", action, group.id), role))
    }

    /// Groups the caller may read: the whole organization for admins,
    /// otherwise the caller's memberships.
    pub async fn accessible_groups(&self, identity: &Identity) -> Result<Vec<Group>, HuddleError> {
        let user_id = identity.user_id;
        let org = identity.organization_id.clone();
        if identity.role == Role::Admin {
            self.store
                .call("list organization groups", move |db| db.list_groups_in_org(&org))
                .await
        } else {
            self.store
                .call("list member groups", move |db| db.list_groups_for_member(user_id))
                .await
                .map(|groups| {
                    groups
                        .into_iter()
                        .filter(|g| g.organization_id == org)
                        .collect()
                })
        }
    }

    /// Edit and delete of a message: its sender, a global admin, or an admin
    /// of the message's group.
    pub async fn can_modify_message(
        &self,
        identity: &Identity,
        message: &Message,
    ) -> Result<bool, HuddleError> {
        if message.sender_id == identity.user_id {
            return Ok(true);
        }
        let Some((group, membership)) = self.snapshot(identity, message.group_id).await? else {
            return Ok(false);
        };
        if group.organization_id != identity.organization_id {
            return Ok(false);
        }
        Ok(identity.role == Role::Admin || membership == Some(MembershipRole::Admin))
    }

    async fn snapshot(
        &self,
        identity: &Identity,
        group_id: Uuid,
    ) -> Result<Option<(Group, Option<MembershipRole>)>, HuddleError> {
        let user_id = identity.user_id;
        self.store
            .call("load group access", move |db| db.access_snapshot(group_id, user_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Fixture, identity};

    #[test]
    fn resolution_order() {
        use GroupAction::*;
        use MembershipRole as M;

        // Global admin short-circuits, even without membership.
        assert!(resolve(Role::Admin, false, None, Manage));
        // No membership is refused for everyone else, creators included.
        assert!(!resolve(Role::FieldStaff, true, None, Read));
        assert!(!resolve(Role::Volunteer, false, None, Read));
        // Creator with a membership may do anything.
        assert!(resolve(Role::Volunteer, true, Some(M::Member), Manage));
        // Per-action policy.
        assert!(resolve(Role::Volunteer, false, Some(M::Member), Read));
        assert!(resolve(Role::Volunteer, false, Some(M::Member), Write));
        assert!(!resolve(Role::Volunteer, false, Some(M::Member), Delete));
        assert!(!resolve(Role::FieldStaff, false, Some(M::Member), Manage));
        assert!(resolve(Role::Volunteer, false, Some(M::Moderator), Delete));
        assert!(resolve(Role::Volunteer, false, Some(M::Admin), Manage));
    }

    #[test]
    fn unknown_action_names_never_parse() {
        assert!("archive".parse::<GroupAction>().is_err());
    }

    #[tokio::test]
    async fn outsiders_get_not_found_members_get_forbidden() {
        let fx = Fixture::new();
        let member = fx.user("bo", Role::Volunteer);
        let outsider = fx.user("cy", Role::FieldStaff);
        let group = fx.group(&fx.root);
        fx.add(&group, &member, MembershipRole::Member);
        let authority = fx.authority();

        let err = authority
            .authorize(&identity(&outsider), group.id, GroupAction::Read)
            .await
            .unwrap_err();
        assert!(matches!(err, HuddleError::NotFound));

        let err = authority
            .authorize(&identity(&member), group.id, GroupAction::Manage)
            .await
            .unwrap_err();
        match err {
            HuddleError::Authorization { role, .. } => assert_eq!(role, "member"),
            other => panic!("unexpected {:?}", other),
        }

        assert!(authority
            .can_access(&identity(&fx.root), group.id, GroupAction::Manage)
            .await
            .unwrap());
        assert!(!authority
            .can_access(&identity(&member), Uuid::new_v4(), GroupAction::Read)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn accessible_groups_follow_membership() {
        let fx = Fixture::new();
        let member = fx.user("bo", Role::Volunteer);
        let g1 = fx.group(&fx.root);
        let _g2 = fx.group(&fx.root);
        fx.add(&g1, &member, MembershipRole::Member);
        let authority = fx.authority();

        let mine = authority.accessible_groups(&identity(&member)).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, g1.id);

        let all = authority.accessible_groups(&identity(&fx.root)).await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
