use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::types::ToSql;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use uuid::Uuid;

use huddle_types::models::{DeliveryStatus, Message, Tag, TagKind};

use crate::Database;
use crate::models::{CreateOutcome, NewMessage};
use crate::queries::{enum_col, opt_ts_col, opt_uuid_col, ts, ts_col, uuid_col};

impl Database {
    // -- Messages --

    /// Persist a message, its tags and the delivery fan-out in one
    /// transaction. Fan-out targets are the group's members at this instant;
    /// the sender's own row is written already read.
    pub fn create_message(&self, new: &NewMessage) -> Result<CreateOutcome> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            if let Some(client_id) = new.client_id {
                let existing: Option<String> = tx
                    .query_row(
                        "SELECT id FROM messages WHERE sender_id = ?1 AND client_id = ?2",
                        params![new.sender_id.to_string(), client_id.to_string()],
                        |r| r.get(0),
                    )
                    .optional()?;
                if let Some(id) = existing {
                    let message = query_message(&tx, id.parse()?)?
                        .ok_or_else(|| anyhow!("Message {} vanished mid-transaction", id))?;
                    return Ok(CreateOutcome::Replayed(message));
                }
            }

            if let Some(reply_to) = new.reply_to {
                let same_group: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM messages WHERE id = ?1 AND group_id = ?2)",
                    params![reply_to.to_string(), new.group_id.to_string()],
                    |r| r.get(0),
                )?;
                if !same_group {
                    return Ok(CreateOutcome::ReplyTargetMissing);
                }
            }

            let created_at = ts(&new.created_at);
            tx.execute(
                "INSERT INTO messages (id, group_id, sender_id, content, message_type, reply_to, client_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    new.id.to_string(),
                    new.group_id.to_string(),
                    new.sender_id.to_string(),
                    new.content,
                    new.message_type.as_str(),
                    new.reply_to.map(|id| id.to_string()),
                    new.client_id.map(|id| id.to_string()),
                    created_at,
                ],
            )?;

            insert_tags(&tx, new.id, &new.tags, new.sender_id, &new.created_at)?;

            let recipients = query_member_ids(&tx, new.group_id)?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO delivery_status (message_id, user_id, delivered_at, read_at)
                     VALUES (?1, ?2, ?3, ?4)",
                )?;
                for user_id in &recipients {
                    let read_at = (*user_id == new.sender_id).then(|| created_at.clone());
                    stmt.execute(params![
                        new.id.to_string(),
                        user_id.to_string(),
                        created_at,
                        read_at,
                    ])?;
                }
            }

            let message = query_message(&tx, new.id)?
                .ok_or_else(|| anyhow!("Message {} missing after insert", new.id))?;
            tx.commit()?;

            Ok(CreateOutcome::Created {
                message,
                recipients,
            })
        })
    }

    pub fn get_message(&self, id: Uuid) -> Result<Option<Message>> {
        self.with_conn(|conn| query_message(conn, id))
    }

    /// Newest first, offset-paginated, optionally only messages after `since`.
    pub fn list_messages(
        &self,
        group_id: Uuid,
        limit: u32,
        offset: u32,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} {}
                 WHERE m.group_id = ?1 AND (?2 IS NULL OR m.created_at > ?2)
                 ORDER BY m.created_at DESC, m.id DESC
                 LIMIT ?3 OFFSET ?4",
                MESSAGE_COLUMNS, MESSAGE_FROM
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut messages = stmt
                .query_map(
                    params![group_id.to_string(), since.as_ref().map(ts), limit, offset],
                    map_message,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            attach_tags(conn, &mut messages)?;
            Ok(messages)
        })
    }

    pub fn edit_message(
        &self,
        id: Uuid,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Message>> {
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "UPDATE messages SET content = ?2, edited_at = ?3 WHERE id = ?1",
                params![id.to_string(), content, ts(&at)],
            )?;
            if n == 0 {
                return Ok(None);
            }
            query_message(conn, id)
        })
    }

    /// Delete a message; tags and delivery rows go with it.
    pub fn delete_message(&self, id: Uuid) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let n = conn.execute("DELETE FROM messages WHERE id = ?1", [id.to_string()])?;
            Ok(n == 1)
        })
    }

    /// Substring search over the given groups, newest first.
    pub fn search_messages(
        &self,
        group_ids: &[Uuid],
        needle: &str,
        tag: Option<TagKind>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Message>> {
        if group_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders = vec!["?"; group_ids.len()].join(", ");
            let mut sql = format!(
                "SELECT {} {} WHERE m.group_id IN ({}) AND instr(lower(m.content), lower(?)) > 0",
                MESSAGE_COLUMNS, MESSAGE_FROM, placeholders
            );

            let mut values: Vec<Box<dyn ToSql>> = group_ids
                .iter()
                .map(|id| Box::new(id.to_string()) as Box<dyn ToSql>)
                .collect();
            values.push(Box::new(needle.to_string()));

            if let Some(kind) = tag {
                sql.push_str(
                    " AND EXISTS (SELECT 1 FROM message_tags t WHERE t.message_id = m.id AND t.kind = ?)",
                );
                values.push(Box::new(kind.as_str()));
            }
            if let Some(from) = from {
                sql.push_str(" AND m.created_at >= ?");
                values.push(Box::new(ts(&from)));
            }
            if let Some(to) = to {
                sql.push_str(" AND m.created_at <= ?");
                values.push(Box::new(ts(&to)));
            }
            sql.push_str(" ORDER BY m.created_at DESC LIMIT ?");
            values.push(Box::new(limit));

            let mut stmt = conn.prepare(&sql)?;
            let refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
            let mut messages = stmt
                .query_map(refs.as_slice(), map_message)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            attach_tags(conn, &mut messages)?;
            Ok(messages)
        })
    }

    // -- Tags --

    /// Add tags, ignoring kinds the message already carries. Returns the
    /// message's full tag set afterwards.
    pub fn add_tags(
        &self,
        message_id: Uuid,
        tags: &[(TagKind, Option<String>)],
        created_by: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Vec<Tag>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            insert_tags(&tx, message_id, tags, created_by, &at)?;
            let all = query_tags(&tx, message_id)?;
            tx.commit()?;
            Ok(all)
        })
    }

    pub fn tags_for_message(&self, message_id: Uuid) -> Result<Vec<Tag>> {
        self.with_conn(|conn| query_tags(conn, message_id))
    }

    // -- Delivery / read state --

    pub fn message_status(&self, message_id: Uuid) -> Result<Vec<DeliveryStatus>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT message_id, user_id, delivered_at, read_at FROM delivery_status
                 WHERE message_id = ?1 ORDER BY delivered_at, user_id",
            )?;
            let rows = stmt
                .query_map([message_id.to_string()], |row| {
                    Ok(DeliveryStatus {
                        message_id: uuid_col(row, 0)?,
                        user_id: uuid_col(row, 1)?,
                        delivered_at: ts_col(row, 2)?,
                        read_at: opt_ts_col(row, 3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Set read-at for one message if it is still unset.
    ///
    /// Returns `None` when the message is not in `group_id`, otherwise
    /// whether this call performed the unread-to-read transition.
    pub fn mark_read(
        &self,
        message_id: Uuid,
        group_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<bool>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let in_group: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM messages WHERE id = ?1 AND group_id = ?2)",
                params![message_id.to_string(), group_id.to_string()],
                |r| r.get(0),
            )?;
            if !in_group {
                return Ok(None);
            }
            let n = tx.execute(
                "UPDATE delivery_status SET read_at = ?3
                 WHERE message_id = ?1 AND user_id = ?2 AND read_at IS NULL",
                params![message_id.to_string(), user_id.to_string(), ts(&at)],
            )?;
            tx.commit()?;
            Ok(Some(n == 1))
        })
    }

    /// Mark every unread message in a group read for `user_id`, skipping the
    /// user's own messages. Returns the ids that transitioned.
    pub fn mark_group_read(
        &self,
        group_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Vec<Uuid>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let ids = {
                let mut stmt = tx.prepare(
                    "UPDATE delivery_status SET read_at = ?3
                     WHERE user_id = ?2
                       AND read_at IS NULL
                       AND message_id IN (
                           SELECT id FROM messages WHERE group_id = ?1 AND sender_id != ?2
                       )
                     RETURNING message_id",
                )?;
                let ids = stmt
                    .query_map(
                        params![group_id.to_string(), user_id.to_string(), ts(&at)],
                        |row| uuid_col(row, 0),
                    )?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                ids
            };
            tx.commit()?;
            Ok(ids)
        })
    }
}

const MESSAGE_COLUMNS: &str = "m.id, m.group_id, m.sender_id, COALESCE(u.username, 'unknown'),
     m.content, m.message_type, m.reply_to, m.created_at, m.edited_at";

const MESSAGE_FROM: &str = "FROM messages m LEFT JOIN users u ON m.sender_id = u.id";

fn map_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: uuid_col(row, 0)?,
        group_id: uuid_col(row, 1)?,
        sender_id: uuid_col(row, 2)?,
        sender_username: row.get(3)?,
        content: row.get(4)?,
        message_type: enum_col(row, 5)?,
        reply_to: opt_uuid_col(row, 6)?,
        created_at: ts_col(row, 7)?,
        edited_at: opt_ts_col(row, 8)?,
        tags: vec![],
    })
}

fn query_message(conn: &Connection, id: Uuid) -> Result<Option<Message>> {
    let sql = format!("SELECT {} {} WHERE m.id = ?1", MESSAGE_COLUMNS, MESSAGE_FROM);
    let message = conn.query_row(&sql, [id.to_string()], map_message).optional()?;
    match message {
        Some(mut message) => {
            message.tags = query_tags(conn, id)?;
            Ok(Some(message))
        }
        None => Ok(None),
    }
}

fn query_member_ids(conn: &Connection, group_id: Uuid) -> Result<Vec<Uuid>> {
    let mut stmt = conn.prepare("SELECT user_id FROM memberships WHERE group_id = ?1")?;
    let ids = stmt
        .query_map([group_id.to_string()], |row| uuid_col(row, 0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn insert_tags(
    conn: &Connection,
    message_id: Uuid,
    tags: &[(TagKind, Option<String>)],
    created_by: Uuid,
    at: &DateTime<Utc>,
) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO message_tags (message_id, kind, value, created_by, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for (kind, value) in tags {
        stmt.execute(params![
            message_id.to_string(),
            kind.as_str(),
            value,
            created_by.to_string(),
            ts(at),
        ])?;
    }
    Ok(())
}

fn query_tags(conn: &Connection, message_id: Uuid) -> Result<Vec<Tag>> {
    let mut stmt = conn.prepare(
        "SELECT kind, value, created_by FROM message_tags WHERE message_id = ?1 ORDER BY id",
    )?;
    let tags = stmt
        .query_map([message_id.to_string()], |row| {
            Ok(Tag {
                kind: enum_col(row, 0)?,
                value: row.get(1)?,
                created_by: uuid_col(row, 2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(tags)
}

/// Batch-fetch tags for a page of messages (one query, not one per message).
fn attach_tags(conn: &Connection, messages: &mut [Message]) -> Result<()> {
    if messages.is_empty() {
        return Ok(());
    }

    let placeholders: Vec<String> = (1..=messages.len()).map(|i| format!("?{}", i)).collect();
    let sql = format!(
        "SELECT message_id, kind, value, created_by FROM message_tags
         WHERE message_id IN ({}) ORDER BY id",
        placeholders.join(", ")
    );

    let ids: Vec<String> = messages.iter().map(|m| m.id.to_string()).collect();
    let params: Vec<&dyn ToSql> = ids.iter().map(|id| id as &dyn ToSql).collect();

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params.as_slice(), |row| {
            Ok((
                uuid_col(row, 0)?,
                Tag {
                    kind: enum_col(row, 1)?,
                    value: row.get(2)?,
                    created_by: uuid_col(row, 3)?,
                },
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    for (message_id, tag) in rows {
        if let Some(message) = messages.iter_mut().find(|m| m.id == message_id) {
            message.tags.push(tag);
        }
    }
    Ok(())
}
