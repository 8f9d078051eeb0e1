use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::action::{ActionPayload, QueuedAction};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS offline_queue (
        id              TEXT PRIMARY KEY,
        kind            TEXT NOT NULL,
        group_id        TEXT,
        payload         TEXT NOT NULL,
        enqueued_at     TEXT NOT NULL,
        attempts        INTEGER NOT NULL DEFAULT 0,
        last_attempt_at TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_queue_group ON offline_queue(group_id, enqueued_at);
    CREATE INDEX IF NOT EXISTS idx_queue_enqueued ON offline_queue(enqueued_at);
";

const COLUMNS: &str = "id, payload, enqueued_at, attempts, last_attempt_at";

/// Client-local durable queue of actions not yet confirmed by the server.
/// Entries are addressed by id only; nothing here depends on position.
pub struct OfflineQueue {
    conn: Mutex<Connection>,
}

impl OfflineQueue {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening offline queue at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let queue = Self::init(conn)?;
        info!("Offline queue opened at {}", path.display());
        Ok(queue)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("queue lock poisoned: {}", e))?;
        f(&conn)
    }

    pub fn put(&self, action: &QueuedAction) -> Result<()> {
        let payload = serde_json::to_string(&action.payload)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO offline_queue
                 (id, kind, group_id, payload, enqueued_at, attempts, last_attempt_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    action.id.to_string(),
                    action.kind().as_str(),
                    action.payload.group_id().map(|g| g.to_string()),
                    payload,
                    ts(&action.enqueued_at),
                    action.attempts,
                    action.last_attempt_at.as_ref().map(ts),
                ],
            )?;
            Ok(())
        })?;
        debug!("Queued {} action {}", action.kind(), action.id);
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Result<Option<QueuedAction>> {
        self.with_conn(|conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {} FROM offline_queue WHERE id = ?1", COLUMNS),
                    params![id.to_string()],
                    RawEntry::from_row,
                )
                .optional()?;
            raw.map(RawEntry::decode).transpose()
        })
    }

    /// Remove exactly this entry. Returns false if it was already gone.
    pub fn delete(&self, id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM offline_queue WHERE id = ?1",
                params![id.to_string()],
            )?;
            Ok(n > 0)
        })
    }

    /// Every entry, oldest first.
    pub fn all(&self) -> Result<Vec<QueuedAction>> {
        self.select("ORDER BY enqueued_at ASC, id ASC", params![])
    }

    pub fn by_group(&self, group_id: Uuid) -> Result<Vec<QueuedAction>> {
        self.select(
            "WHERE group_id = ?1 ORDER BY enqueued_at ASC, id ASC",
            params![group_id.to_string()],
        )
    }

    /// Entries enqueued at or after `since`.
    pub fn since(&self, since: DateTime<Utc>) -> Result<Vec<QueuedAction>> {
        self.select(
            "WHERE enqueued_at >= ?1 ORDER BY enqueued_at ASC, id ASC",
            params![ts(&since)],
        )
    }

    /// Count one failed attempt. Returns the new attempt count, or `None`
    /// if the entry no longer exists.
    pub fn record_failure(&self, id: Uuid, at: DateTime<Utc>) -> Result<Option<u32>> {
        self.with_conn(|conn| {
            let attempts = conn
                .query_row(
                    "UPDATE offline_queue SET attempts = attempts + 1, last_attempt_at = ?2
                     WHERE id = ?1 RETURNING attempts",
                    params![id.to_string(), ts(&at)],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(attempts)
        })
    }

    pub fn count(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM offline_queue", [], |r| r.get(0))?;
            Ok(n as usize)
        })
    }

    fn select(&self, tail: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<QueuedAction>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {} FROM offline_queue {}", COLUMNS, tail))?;
            let rows = stmt
                .query_map(args, RawEntry::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(RawEntry::decode).collect()
        })
    }
}

struct RawEntry {
    id: String,
    payload: String,
    enqueued_at: String,
    attempts: u32,
    last_attempt_at: Option<String>,
}

impl RawEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            payload: row.get(1)?,
            enqueued_at: row.get(2)?,
            attempts: row.get(3)?,
            last_attempt_at: row.get(4)?,
        })
    }

    fn decode(self) -> Result<QueuedAction> {
        let payload: ActionPayload = serde_json::from_str(&self.payload)
            .with_context(|| format!("corrupt payload for queued action {}", self.id))?;
        Ok(QueuedAction {
            id: self.id.parse()?,
            payload,
            enqueued_at: parse_ts(&self.enqueued_at)?,
            attempts: self.attempts,
            last_attempt_at: self.last_attempt_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

// Fixed-width UTC strings, so text order is time order.
fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use huddle_types::api::CreateGroupRequest;
    use huddle_types::models::GroupType;

    fn message(group_id: Uuid, content: &str, at: DateTime<Utc>) -> QueuedAction {
        let mut action = QueuedAction::new(ActionPayload::SendMessage {
            group_id,
            content: content.into(),
            message_type: None,
            reply_to: None,
            tags: vec![],
        });
        action.enqueued_at = at;
        action
    }

    #[test]
    fn identical_actions_are_distinct_entries() {
        let queue = OfflineQueue::open_in_memory().unwrap();
        let group = Uuid::new_v4();
        let now = Utc::now();
        let a = message(group, "same", now);
        let b = message(group, "same", now);
        queue.put(&a).unwrap();
        queue.put(&b).unwrap();
        assert_eq!(queue.count().unwrap(), 2);

        assert!(queue.delete(b.id).unwrap());
        assert!(!queue.delete(b.id).unwrap());
        let left = queue.all().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, a.id);
    }

    #[test]
    fn filters_by_group_and_time() {
        let queue = OfflineQueue::open_in_memory().unwrap();
        let (g1, g2) = (Uuid::new_v4(), Uuid::new_v4());
        let t0 = Utc::now() - Duration::minutes(10);

        let old = message(g1, "old", t0);
        let new = message(g1, "new", t0 + Duration::minutes(5));
        let other = message(g2, "other", t0 + Duration::minutes(6));
        let mut group = QueuedAction::new(ActionPayload::CreateGroup(CreateGroupRequest {
            name: "Drivers".into(),
            group_type: GroupType::Team,
            description: None,
        }));
        group.enqueued_at = t0 + Duration::minutes(7);
        for action in [&other, &new, &old, &group] {
            queue.put(action).unwrap();
        }

        let ids: Vec<Uuid> = queue.by_group(g1).unwrap().iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![old.id, new.id]);

        let ids: Vec<Uuid> = queue
            .since(t0 + Duration::minutes(5))
            .unwrap()
            .iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(ids, vec![new.id, other.id, group.id]);
        assert_eq!(queue.all().unwrap()[0].id, old.id);
    }

    #[test]
    fn failures_are_counted_and_stamped() {
        let queue = OfflineQueue::open_in_memory().unwrap();
        let action = message(Uuid::new_v4(), "retry me", Utc::now());
        queue.put(&action).unwrap();

        let at = Utc::now();
        assert_eq!(queue.record_failure(action.id, at).unwrap(), Some(1));
        assert_eq!(queue.record_failure(action.id, at).unwrap(), Some(2));

        let stored = queue.get(action.id).unwrap().unwrap();
        assert_eq!(stored.attempts, 2);
        assert_eq!(
            stored.last_attempt_at.map(|t| ts(&t)),
            Some(ts(&at))
        );

        queue.delete(action.id).unwrap();
        assert_eq!(queue.record_failure(action.id, at).unwrap(), None);
    }
}
