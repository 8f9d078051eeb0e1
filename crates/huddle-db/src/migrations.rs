use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id              TEXT PRIMARY KEY,
                username        TEXT NOT NULL UNIQUE,
                display_name    TEXT NOT NULL,
                password        TEXT NOT NULL,
                role            TEXT NOT NULL,
                organization_id TEXT NOT NULL,
                status          TEXT NOT NULL DEFAULT 'active',
                created_at      TEXT NOT NULL,
                last_seen_at    TEXT
            );

            CREATE INDEX idx_users_org ON users(organization_id);

            CREATE TABLE groups (
                id              TEXT PRIMARY KEY,
                name            TEXT NOT NULL,
                group_type      TEXT NOT NULL,
                description     TEXT,
                organization_id TEXT NOT NULL,
                created_by      TEXT NOT NULL REFERENCES users(id),
                created_at      TEXT NOT NULL
            );

            CREATE TABLE memberships (
                group_id    TEXT NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
                user_id     TEXT NOT NULL REFERENCES users(id),
                role        TEXT NOT NULL,
                joined_at   TEXT NOT NULL,
                PRIMARY KEY (group_id, user_id)
            );

            CREATE INDEX idx_memberships_user ON memberships(user_id);

            CREATE TABLE messages (
                id              TEXT PRIMARY KEY,
                group_id        TEXT NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
                sender_id       TEXT NOT NULL REFERENCES users(id),
                content         TEXT NOT NULL,
                message_type    TEXT NOT NULL,
                reply_to        TEXT REFERENCES messages(id) ON DELETE SET NULL,
                client_id       TEXT,
                created_at      TEXT NOT NULL,
                edited_at       TEXT,
                UNIQUE (sender_id, client_id)
            );

            CREATE INDEX idx_messages_group ON messages(group_id, created_at);

            CREATE TABLE message_tags (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id  TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                kind        TEXT NOT NULL,
                value       TEXT,
                created_by  TEXT NOT NULL REFERENCES users(id),
                created_at  TEXT NOT NULL,
                UNIQUE (message_id, kind)
            );

            CREATE INDEX idx_message_tags_kind ON message_tags(kind);

            CREATE TABLE delivery_status (
                message_id      TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                user_id         TEXT NOT NULL REFERENCES users(id),
                delivered_at    TEXT NOT NULL,
                read_at         TEXT,
                PRIMARY KEY (message_id, user_id)
            );

            CREATE INDEX idx_delivery_unread ON delivery_status(user_id, read_at);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
