use std::str::FromStr;

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use uuid::Uuid;

use huddle_types::models::{
    Group, GroupType, Membership, MembershipRole, Role, User, UserStatus,
};

use crate::Database;
use crate::models::{NewGroup, NewUser, RemoveMemberOutcome, UserRow};

impl Database {
    // -- Users --

    /// Insert a user. The first account of an organization becomes its admin.
    pub fn create_user(&self, new: &NewUser) -> Result<User> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let existing: i64 = tx.query_row(
                "SELECT COUNT(*) FROM users WHERE organization_id = ?1",
                [&new.organization_id],
                |r| r.get(0),
            )?;
            let role = if existing == 0 { Role::Admin } else { new.role };

            tx.execute(
                "INSERT INTO users (id, username, display_name, password, role, organization_id, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'active', ?7)",
                params![
                    new.id.to_string(),
                    new.username,
                    new.display_name,
                    new.password_hash,
                    role.as_str(),
                    new.organization_id,
                    ts(&new.created_at),
                ],
            )?;
            tx.commit()?;

            Ok(User {
                id: new.id,
                username: new.username.clone(),
                display_name: new.display_name.clone(),
                role,
                organization_id: new.organization_id.clone(),
                status: UserStatus::Active,
                created_at: new.created_at,
                last_seen_at: None,
            })
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {}, password FROM users WHERE username = ?1", USER_COLUMNS);
            let row = conn
                .query_row(&sql, [username], |row| {
                    Ok(UserRow {
                        user: map_user(row)?,
                        password: row.get(8)?,
                    })
                })
                .optional()?;
            Ok(row)
        })
    }

    pub fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        self.with_conn(|conn| query_user(conn, id))
    }

    pub fn set_user_role(&self, id: Uuid, role: Role) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "UPDATE users SET role = ?2 WHERE id = ?1",
                params![id.to_string(), role.as_str()],
            )?;
            Ok(n == 1)
        })
    }

    /// Users are never hard-deleted; they flip to inactive.
    pub fn deactivate_user(&self, id: Uuid) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "UPDATE users SET status = 'inactive' WHERE id = ?1",
                [id.to_string()],
            )?;
            Ok(n == 1)
        })
    }

    pub fn touch_last_seen(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE users SET last_seen_at = ?2 WHERE id = ?1",
                params![id.to_string(), ts(&at)],
            )?;
            Ok(())
        })
    }

    // -- Groups --

    /// Insert a group together with its creator's admin membership.
    pub fn create_group(&self, new: &NewGroup) -> Result<Group> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO groups (id, name, group_type, description, organization_id, created_by, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    new.id.to_string(),
                    new.name,
                    new.group_type.as_str(),
                    new.description,
                    new.organization_id,
                    new.created_by.to_string(),
                    ts(&new.created_at),
                ],
            )?;
            tx.execute(
                "INSERT INTO memberships (group_id, user_id, role, joined_at) VALUES (?1, ?2, 'admin', ?3)",
                params![new.id.to_string(), new.created_by.to_string(), ts(&new.created_at)],
            )?;
            tx.commit()?;

            Ok(Group {
                id: new.id,
                name: new.name.clone(),
                group_type: new.group_type,
                description: new.description.clone(),
                organization_id: new.organization_id.clone(),
                created_by: new.created_by,
                created_at: new.created_at,
            })
        })
    }

    pub fn get_group(&self, id: Uuid) -> Result<Option<Group>> {
        self.with_conn(|conn| query_group(conn, id))
    }

    /// Metadata-only edit. Absent fields are left untouched.
    pub fn update_group(
        &self,
        id: Uuid,
        name: Option<&str>,
        group_type: Option<GroupType>,
        description: Option<&str>,
    ) -> Result<Option<Group>> {
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "UPDATE groups SET
                    name = COALESCE(?2, name),
                    group_type = COALESCE(?3, group_type),
                    description = COALESCE(?4, description)
                 WHERE id = ?1",
                params![id.to_string(), name, group_type.map(|t| t.as_str()), description],
            )?;
            if n == 0 {
                return Ok(None);
            }
            query_group(conn, id)
        })
    }

    /// The group plus the caller's membership role, read together so an
    /// authorization decision sees one consistent snapshot.
    pub fn access_snapshot(
        &self,
        group_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<(Group, Option<MembershipRole>)>> {
        self.with_conn(|conn| {
            let Some(group) = query_group(conn, group_id)? else {
                return Ok(None);
            };
            let role = query_membership_role(conn, group_id, user_id)?;
            Ok(Some((group, role)))
        })
    }

    pub fn list_groups_for_member(&self, user_id: Uuid) -> Result<Vec<Group>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM groups g
                 JOIN memberships m ON m.group_id = g.id
                 WHERE m.user_id = ?1
                 ORDER BY g.name",
                GROUP_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([user_id.to_string()], map_group)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn list_groups_in_org(&self, organization_id: &str) -> Result<Vec<Group>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM groups g WHERE g.organization_id = ?1 ORDER BY g.name",
                GROUP_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([organization_id], map_group)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Memberships --

    /// Add a member, or change the role of an existing one. One row per pair.
    pub fn add_member(
        &self,
        group_id: Uuid,
        user_id: Uuid,
        role: MembershipRole,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO memberships (group_id, user_id, role, joined_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (group_id, user_id) DO UPDATE SET role = excluded.role",
                params![group_id.to_string(), user_id.to_string(), role.as_str(), ts(&at)],
            )?;
            Ok(())
        })
    }

    /// Remove a membership unless it is the group's last admin.
    pub fn remove_member(&self, group_id: Uuid, user_id: Uuid) -> Result<RemoveMemberOutcome> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let Some(role) = query_membership_role(&tx, group_id, user_id)? else {
                return Ok(RemoveMemberOutcome::NotMember);
            };

            if role == MembershipRole::Admin {
                let admins: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM memberships WHERE group_id = ?1 AND role = 'admin'",
                    [group_id.to_string()],
                    |r| r.get(0),
                )?;
                if admins <= 1 {
                    return Ok(RemoveMemberOutcome::LastAdmin);
                }
            }

            tx.execute(
                "DELETE FROM memberships WHERE group_id = ?1 AND user_id = ?2",
                params![group_id.to_string(), user_id.to_string()],
            )?;
            tx.commit()?;
            Ok(RemoveMemberOutcome::Removed)
        })
    }

    pub fn list_members(&self, group_id: Uuid) -> Result<Vec<Membership>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT group_id, user_id, role, joined_at FROM memberships
                 WHERE group_id = ?1 ORDER BY joined_at",
            )?;
            let rows = stmt
                .query_map([group_id.to_string()], |row| {
                    Ok(Membership {
                        group_id: uuid_col(row, 0)?,
                        user_id: uuid_col(row, 1)?,
                        role: enum_col(row, 2)?,
                        joined_at: ts_col(row, 3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

const USER_COLUMNS: &str =
    "id, username, display_name, role, organization_id, status, created_at, last_seen_at";

const GROUP_COLUMNS: &str =
    "g.id, g.name, g.group_type, g.description, g.organization_id, g.created_by, g.created_at";

fn query_user(conn: &Connection, id: Uuid) -> Result<Option<User>> {
    let sql = format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS);
    let row = conn.query_row(&sql, [id.to_string()], map_user).optional()?;
    Ok(row)
}

fn query_group(conn: &Connection, id: Uuid) -> Result<Option<Group>> {
    let sql = format!("SELECT {} FROM groups g WHERE g.id = ?1", GROUP_COLUMNS);
    let row = conn.query_row(&sql, [id.to_string()], map_group).optional()?;
    Ok(row)
}

pub(crate) fn query_membership_role(
    conn: &Connection,
    group_id: Uuid,
    user_id: Uuid,
) -> Result<Option<MembershipRole>> {
    let role = conn
        .query_row(
            "SELECT role FROM memberships WHERE group_id = ?1 AND user_id = ?2",
            params![group_id.to_string(), user_id.to_string()],
            |row| enum_col(row, 0),
        )
        .optional()?;
    Ok(role)
}

fn map_user(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: uuid_col(row, 0)?,
        username: row.get(1)?,
        display_name: row.get(2)?,
        role: enum_col::<Role>(row, 3)?,
        organization_id: row.get(4)?,
        status: enum_col::<UserStatus>(row, 5)?,
        created_at: ts_col(row, 6)?,
        last_seen_at: opt_ts_col(row, 7)?,
    })
}

fn map_group(row: &Row<'_>) -> rusqlite::Result<Group> {
    Ok(Group {
        id: uuid_col(row, 0)?,
        name: row.get(1)?,
        group_type: enum_col(row, 2)?,
        description: row.get(3)?,
        organization_id: row.get(4)?,
        created_by: uuid_col(row, 5)?,
        created_at: ts_col(row, 6)?,
    })
}

// -- Column helpers --
//
// Timestamps are stored as fixed-width RFC 3339 UTC strings so that text
// ordering in SQL matches chronological ordering.

pub(crate) fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

pub(crate) fn uuid_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

pub(crate) fn opt_uuid_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| s.parse().map_err(|e| conversion_error(idx, e))).transpose()
}

pub(crate) fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

pub(crate) fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

pub(crate) fn enum_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn new_user(db: &Database, username: &str, org: &str, role: Role) -> User {
        db.create_user(&NewUser {
            id: Uuid::new_v4(),
            username: username.to_string(),
            display_name: username.to_string(),
            password_hash: "x".to_string(),
            organization_id: org.to_string(),
            role,
            created_at: Utc::now(),
        })
        .unwrap()
    }

    pub(crate) fn new_group(db: &Database, creator: &User) -> Group {
        db.create_group(&NewGroup {
            id: Uuid::new_v4(),
            name: "field-ops".to_string(),
            group_type: GroupType::Team,
            description: None,
            organization_id: creator.organization_id.clone(),
            created_by: creator.id,
            created_at: Utc::now(),
        })
        .unwrap()
    }

    #[test]
    fn first_user_of_an_organization_is_admin() {
        let db = Database::open_in_memory().unwrap();
        let first = new_user(&db, "ada", "relief-org", Role::Volunteer);
        let second = new_user(&db, "bo", "relief-org", Role::Volunteer);
        let elsewhere = new_user(&db, "cy", "other-org", Role::FieldStaff);

        assert_eq!(first.role, Role::Admin);
        assert_eq!(second.role, Role::Volunteer);
        assert_eq!(elsewhere.role, Role::Admin);
    }

    #[test]
    fn deactivated_users_are_kept() {
        let db = Database::open_in_memory().unwrap();
        let user = new_user(&db, "ada", "org", Role::Volunteer);

        assert!(db.deactivate_user(user.id).unwrap());
        let stored = db.get_user(user.id).unwrap().unwrap();
        assert_eq!(stored.status, UserStatus::Inactive);
    }

    #[test]
    fn group_creator_gets_admin_membership() {
        let db = Database::open_in_memory().unwrap();
        let admin = new_user(&db, "ada", "org", Role::Admin);
        let group = new_group(&db, &admin);

        let members = db.list_members(group.id).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].user_id, admin.id);
        assert_eq!(members[0].role, MembershipRole::Admin);
    }

    #[test]
    fn last_admin_cannot_be_removed() {
        let db = Database::open_in_memory().unwrap();
        let admin = new_user(&db, "ada", "org", Role::Admin);
        let other = new_user(&db, "bo", "org", Role::Volunteer);
        let group = new_group(&db, &admin);
        db.add_member(group.id, other.id, MembershipRole::Member, Utc::now()).unwrap();

        assert_eq!(
            db.remove_member(group.id, admin.id).unwrap(),
            RemoveMemberOutcome::LastAdmin
        );
        assert_eq!(
            db.remove_member(group.id, other.id).unwrap(),
            RemoveMemberOutcome::Removed
        );
        assert_eq!(
            db.remove_member(group.id, other.id).unwrap(),
            RemoveMemberOutcome::NotMember
        );
    }

    #[test]
    fn add_member_twice_updates_role() {
        let db = Database::open_in_memory().unwrap();
        let admin = new_user(&db, "ada", "org", Role::Admin);
        let other = new_user(&db, "bo", "org", Role::Volunteer);
        let group = new_group(&db, &admin);

        db.add_member(group.id, other.id, MembershipRole::Member, Utc::now()).unwrap();
        db.add_member(group.id, other.id, MembershipRole::Moderator, Utc::now()).unwrap();

        let (_, role) = db.access_snapshot(group.id, other.id).unwrap().unwrap();
        assert_eq!(role, Some(MembershipRole::Moderator));
        assert_eq!(db.list_members(group.id).unwrap().len(), 2);
    }
}
