//! SQLite persistence layer.
//!
//! Stores the user directory (read for identity and role lookups), the
//! append-only message log, and notification rows.
//! Uses WAL mode for concurrent reads during writes.
//!
//! Anything that must be atomic goes through [`DbTx`], obtained from
//! [`Db::begin`]. Dropping a `DbTx` without calling `commit` rolls back.

use std::path::Path;

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Transaction};
use serde::{Deserialize, Serialize};

use crate::identity::{Identity, Role, SUPPORT_ID};
use crate::notify::NotificationKind;

/// Database handle wrapping a SQLite connection.
pub struct Db {
    conn: Connection,
}

/// A row of the user directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRow {
    pub id: String,
    pub role: Role,
    pub display_name: Option<String>,
}

/// A persisted message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    pub sender_id: Identity,
    pub receiver_id: Identity,
    pub content: String,
    /// Unix milliseconds. Never decreases in insertion order.
    pub created_at: i64,
    pub read: bool,
    /// Non-support participant of a support thread.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_msg_id: Option<String>,
    /// Account that actually issued the send (the admin behind a support reply).
    #[serde(skip)]
    pub author_id: String,
}

/// A message about to be appended.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender: Identity,
    pub receiver: Identity,
    pub thread_user_id: Option<String>,
    pub author_id: String,
    pub content: String,
    pub client_msg_id: Option<String>,
}

/// A persisted notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub content: String,
    pub user_id: Option<String>,
    pub data: serde_json::Value,
    pub is_read: bool,
    pub created_at: i64,
}

/// Conversation selector for history queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Thread {
    /// Ordinary DM between two users, either direction.
    Direct(String, String),
    /// Support conversation of one ordinary user.
    Support(String),
}

/// Bulk read-flag predicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkRead {
    /// Non-support messages to `user`, optionally only those from `from`.
    DirectTo { user: String, from: Option<String> },
    /// Support replies addressed to `user`.
    SupportTo { user: String },
    /// Messages `user` sent to support (admin side of one thread).
    SupportFrom { user: String },
}

/// Admin inbox entry: one per user with a support thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportThreadSummary {
    pub user_id: String,
    pub last_message_at: i64,
    pub unread: i64,
}

const MESSAGE_COLUMNS: &str =
    "id, sender_id, receiver_id, thread_user_id, author_id, content, created_at, is_read, client_msg_id";

const NOTIFICATION_COLUMNS: &str = "id, type, content, user_id, data_json, is_read, created_at";

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Db {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> SqlResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> SqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Make every notification insert fail, to exercise rollback paths.
    #[cfg(test)]
    pub(crate) fn fail_notification_inserts(&self) -> SqlResult<()> {
        self.conn.execute_batch(
            "CREATE TRIGGER fail_notifications BEFORE INSERT ON notifications
             BEGIN SELECT RAISE(ABORT, 'notifications unavailable'); END;",
        )
    }

    fn init(&self) -> SqlResult<()> {
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        self.conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                id           TEXT PRIMARY KEY CHECK (id <> '' AND id <> 'support'),
                role         TEXT NOT NULL,
                display_name TEXT,
                created_at   INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                sender_id      TEXT NOT NULL,
                receiver_id    TEXT NOT NULL,
                thread_user_id TEXT,
                author_id      TEXT NOT NULL,
                content        TEXT NOT NULL,
                created_at     INTEGER NOT NULL,
                is_read        INTEGER NOT NULL DEFAULT 0,
                client_msg_id  TEXT,
                CHECK (sender_id <> receiver_id)
            );

            CREATE INDEX IF NOT EXISTS idx_messages_pair_ts
                ON messages(sender_id, receiver_id, created_at);

            CREATE INDEX IF NOT EXISTS idx_messages_thread_ts
                ON messages(thread_user_id, created_at);

            CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_retry_key
                ON messages(author_id, client_msg_id) WHERE client_msg_id IS NOT NULL;

            CREATE TABLE IF NOT EXISTS notifications (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                type       TEXT NOT NULL,
                content    TEXT NOT NULL,
                user_id    TEXT,
                data_json  TEXT NOT NULL DEFAULT '{}',
                is_read    INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_notifications_user_read
                ON notifications(user_id, is_read);
            ",
        )?;
        Ok(())
    }

    /// Start an atomic unit of work.
    pub fn begin(&self) -> SqlResult<DbTx<'_>> {
        Ok(DbTx { tx: self.conn.unchecked_transaction()? })
    }

    // ── Users ──────────────────────────────────────────────────────────

    /// Create or update a directory entry. The support id is refused by the schema.
    pub fn upsert_user(&self, id: &str, role: Role, display_name: Option<&str>) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO users (id, role, display_name, created_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET role=excluded.role, display_name=excluded.display_name",
            params![id, role.as_str(), display_name, now_ms()],
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: &str) -> SqlResult<Option<UserRow>> {
        get_user(&self.conn, id)
    }

    pub fn admin_ids(&self) -> SqlResult<Vec<String>> {
        admin_ids(&self.conn)
    }

    // ── Messages ───────────────────────────────────────────────────────

    /// Messages of one thread, oldest first. `limit` keeps only the most recent N
    /// with id below `before`; page back by passing the first id of the previous page.
    pub fn thread_messages(&self, thread: &Thread, limit: Option<usize>, before: Option<i64>) -> SqlResult<Vec<Message>> {
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let before = before.unwrap_or(i64::MAX);
        let mut rows = match thread {
            Thread::Direct(a, b) => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE ((sender_id = ?1 AND receiver_id = ?2) OR (sender_id = ?2 AND receiver_id = ?1))
                       AND id < ?4
                     ORDER BY id DESC
                     LIMIT ?3"
                ))?;
                let rows = stmt.query_map(params![a, b, limit, before], map_message_row)?;
                rows.collect::<SqlResult<Vec<_>>>()?
            }
            Thread::Support(user) => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE thread_user_id = ?1 AND (sender_id = ?2 OR receiver_id = ?2)
                       AND id < ?4
                     ORDER BY id DESC
                     LIMIT ?3"
                ))?;
                let rows = stmt.query_map(params![user, SUPPORT_ID, limit, before], map_message_row)?;
                rows.collect::<SqlResult<Vec<_>>>()?
            }
        };
        // Reverse to oldest-first order
        rows.reverse();
        Ok(rows)
    }

    /// Every message visible to `user` with id greater than `after_id`, oldest first.
    /// Admins also see all support traffic.
    pub fn messages_after(
        &self,
        user: &str,
        include_support: bool,
        after_id: i64,
        limit: usize,
    ) -> SqlResult<Vec<Message>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE id > ?1
               AND (sender_id = ?2 OR receiver_id = ?2
                    OR (?3 AND (sender_id = ?4 OR receiver_id = ?4)))
             ORDER BY id ASC
             LIMIT ?5"
        ))?;
        let rows = stmt.query_map(
            params![after_id, user, include_support, SUPPORT_ID, limit as i64],
            map_message_row,
        )?;
        rows.collect()
    }

    /// Flip matching unread messages to read. Returns how many changed;
    /// a repeat call with the same predicate changes nothing.
    pub fn mark_read(&self, predicate: &MarkRead) -> SqlResult<usize> {
        let changed = match predicate {
            MarkRead::DirectTo { user, from: None } => self.conn.execute(
                "UPDATE messages SET is_read = 1
                 WHERE is_read = 0 AND receiver_id = ?1 AND sender_id <> ?2",
                params![user, SUPPORT_ID],
            )?,
            MarkRead::DirectTo { user, from: Some(from) } => self.conn.execute(
                "UPDATE messages SET is_read = 1
                 WHERE is_read = 0 AND receiver_id = ?1 AND sender_id = ?2",
                params![user, from],
            )?,
            MarkRead::SupportTo { user } => self.conn.execute(
                "UPDATE messages SET is_read = 1
                 WHERE is_read = 0 AND sender_id = ?1 AND receiver_id = ?2",
                params![SUPPORT_ID, user],
            )?,
            MarkRead::SupportFrom { user } => self.conn.execute(
                "UPDATE messages SET is_read = 1
                 WHERE is_read = 0 AND sender_id = ?1 AND receiver_id = ?2",
                params![user, SUPPORT_ID],
            )?,
        };
        Ok(changed)
    }

    /// Unread non-support messages addressed to `user`.
    pub fn count_unread_direct(&self, user: &str) -> SqlResult<i64> {
        self.conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE is_read = 0 AND receiver_id = ?1 AND sender_id <> ?2",
            params![user, SUPPORT_ID],
            |row| row.get(0),
        )
    }

    /// Unread support replies addressed to `user`.
    pub fn count_unread_support_replies(&self, user: &str) -> SqlResult<i64> {
        self.conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE is_read = 0 AND sender_id = ?1 AND receiver_id = ?2",
            params![SUPPORT_ID, user],
            |row| row.get(0),
        )
    }

    /// Unread messages in the support inbox sent by non-admin accounts.
    pub fn count_unread_support_inbox(&self) -> SqlResult<i64> {
        self.conn.query_row(
            "SELECT COUNT(*) FROM messages
             WHERE is_read = 0 AND receiver_id = ?1
               AND sender_id NOT IN (SELECT id FROM users WHERE role = 'admin')",
            params![SUPPORT_ID],
            |row| row.get(0),
        )
    }

    /// Admin inbox: one entry per user with a support thread, most recent first.
    pub fn support_threads(&self) -> SqlResult<Vec<SupportThreadSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT thread_user_id,
                    MAX(created_at),
                    SUM(CASE WHEN receiver_id = ?1 AND is_read = 0
                             AND sender_id NOT IN (SELECT id FROM users WHERE role = 'admin')
                             THEN 1 ELSE 0 END)
             FROM messages
             WHERE thread_user_id IS NOT NULL
             GROUP BY thread_user_id
             ORDER BY MAX(id) DESC",
        )?;
        let rows = stmt.query_map(params![SUPPORT_ID], |row| {
            Ok(SupportThreadSummary {
                user_id: row.get(0)?,
                last_message_at: row.get(1)?,
                unread: row.get(2)?,
            })
        })?;
        rows.collect()
    }

    // ── Notifications ──────────────────────────────────────────────────

    pub fn notifications_for(&self, user: &str, unread_only: bool, limit: usize) -> SqlResult<Vec<Notification>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications
             WHERE user_id = ?1 AND (?2 = 0 OR is_read = 0)
             ORDER BY id DESC
             LIMIT ?3"
        ))?;
        let rows = stmt.query_map(params![user, unread_only, limit as i64], map_notification_row)?;
        rows.collect()
    }

    /// Mark one notification read. Returns false if it does not belong to `user`.
    pub fn mark_notification_read(&self, id: i64, user: &str) -> SqlResult<bool> {
        let exists: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM notifications WHERE id = ?1 AND user_id = ?2",
                params![id, user],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Ok(false);
        }
        self.conn.execute(
            "UPDATE notifications SET is_read = 1 WHERE id = ?1 AND is_read = 0",
            params![id],
        )?;
        Ok(true)
    }

    pub fn mark_all_notifications_read(&self, user: &str) -> SqlResult<usize> {
        self.conn.execute(
            "UPDATE notifications SET is_read = 1 WHERE user_id = ?1 AND is_read = 0",
            params![user],
        )
    }

    pub fn count_unread_notifications(&self, user: &str) -> SqlResult<i64> {
        self.conn.query_row(
            "SELECT COUNT(*) FROM notifications WHERE user_id = ?1 AND is_read = 0",
            params![user],
            |row| row.get(0),
        )
    }
}

/// An open transaction over [`Db`].
pub struct DbTx<'a> {
    tx: Transaction<'a>,
}

impl DbTx<'_> {
    pub fn commit(self) -> SqlResult<()> {
        self.tx.commit()
    }

    pub fn get_user(&self, id: &str) -> SqlResult<Option<UserRow>> {
        get_user(&self.tx, id)
    }

    pub fn admin_ids(&self) -> SqlResult<Vec<String>> {
        admin_ids(&self.tx)
    }

    /// Previously stored message carrying the same retry key, if any.
    pub fn message_by_retry_key(&self, author_id: &str, client_msg_id: &str) -> SqlResult<Option<Message>> {
        self.tx
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE author_id = ?1 AND client_msg_id = ?2"),
                params![author_id, client_msg_id],
                map_message_row,
            )
            .optional()
    }

    /// Whether any message exists in `user`'s support thread.
    pub fn support_thread_exists(&self, user: &str) -> SqlResult<bool> {
        self.tx.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM messages WHERE thread_user_id = ?1 AND (sender_id = ?2 OR receiver_id = ?2)
             )",
            params![user, SUPPORT_ID],
            |row| row.get(0),
        )
    }

    /// Append a message with `read = false`.
    pub fn insert_message(&self, msg: &NewMessage) -> SqlResult<Message> {
        // Clamp to the previous row so created_at never runs backwards.
        let last: Option<i64> = self
            .tx
            .query_row("SELECT created_at FROM messages ORDER BY id DESC LIMIT 1", [], |row| row.get(0))
            .optional()?;
        let created_at = last.map_or(now_ms(), |last| now_ms().max(last));

        self.tx.execute(
            "INSERT INTO messages (sender_id, receiver_id, thread_user_id, author_id, content, created_at, client_msg_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                msg.sender.as_str(),
                msg.receiver.as_str(),
                msg.thread_user_id,
                msg.author_id,
                msg.content,
                created_at,
                msg.client_msg_id,
            ],
        )?;
        Ok(Message {
            id: self.tx.last_insert_rowid(),
            sender_id: msg.sender.clone(),
            receiver_id: msg.receiver.clone(),
            content: msg.content.clone(),
            created_at,
            read: false,
            thread_user_id: msg.thread_user_id.clone(),
            client_msg_id: msg.client_msg_id.clone(),
            author_id: msg.author_id.clone(),
        })
    }

    pub fn insert_notification(
        &self,
        kind: NotificationKind,
        content: &str,
        user_id: &str,
        data: &serde_json::Value,
    ) -> SqlResult<Notification> {
        let created_at = now_ms();
        let data_json = serde_json::to_string(data).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        self.tx.execute(
            "INSERT INTO notifications (type, content, user_id, data_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![kind.as_str(), content, user_id, data_json, created_at],
        )?;
        Ok(Notification {
            id: self.tx.last_insert_rowid(),
            kind,
            content: content.to_string(),
            user_id: Some(user_id.to_string()),
            data: data.clone(),
            is_read: false,
            created_at,
        })
    }
}

fn get_user(conn: &Connection, id: &str) -> SqlResult<Option<UserRow>> {
    conn.query_row(
        "SELECT id, role, display_name FROM users WHERE id = ?1",
        params![id],
        |row| {
            let role: String = row.get(1)?;
            let role = role
                .parse::<Role>()
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?;
            Ok(UserRow { id: row.get(0)?, role, display_name: row.get(2)? })
        },
    )
    .optional()
}

fn admin_ids(conn: &Connection) -> SqlResult<Vec<String>> {
    let mut stmt = conn.prepare("SELECT id FROM users WHERE role = 'admin' ORDER BY id")?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    rows.collect()
}

fn map_message_row(row: &rusqlite::Row) -> SqlResult<Message> {
    let sender: String = row.get(1)?;
    let receiver: String = row.get(2)?;
    Ok(Message {
        id: row.get(0)?,
        sender_id: Identity::from(sender),
        receiver_id: Identity::from(receiver),
        thread_user_id: row.get(3)?,
        author_id: row.get(4)?,
        content: row.get(5)?,
        created_at: row.get(6)?,
        read: row.get::<_, i64>(7)? != 0,
        client_msg_id: row.get(8)?,
    })
}

fn map_notification_row(row: &rusqlite::Row) -> SqlResult<Notification> {
    let kind: String = row.get(1)?;
    let kind = kind
        .parse::<NotificationKind>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?;
    let data_json: String = row.get(4)?;
    Ok(Notification {
        id: row.get(0)?,
        kind,
        content: row.get(2)?,
        user_id: row.get(3)?,
        data: serde_json::from_str(&data_json)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?,
        is_read: row.get::<_, i64>(5)? != 0,
        created_at: row.get(6)?,
    })
}
