//! SQLite persistence layer.
//!
//! Stores groups, group membership and group messages. Uses WAL mode for
//! concurrent reads during writes.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use hubline_sdk::protocol::{Group, GroupId, GroupMessage, Identity, MessageId};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Result as SqlResult, params};

use crate::ids;
use crate::store::{Storage, StoreResult};

/// Database handle wrapping a SQLite connection.
pub struct Db {
    conn: Connection,
}

impl Db {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> SqlResult<Self> {
        let db = Self {
            conn: Connection::open(path)?,
        };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory database.
    pub fn open_memory() -> SqlResult<Self> {
        let db = Self {
            conn: Connection::open_in_memory()?,
        };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> SqlResult<()> {
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        self.conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS groups (
                id          TEXT PRIMARY KEY,
                name        TEXT,
                created_at  INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS group_members (
                group_id    TEXT NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
                identity    TEXT NOT NULL,
                PRIMARY KEY (group_id, identity)
            );

            CREATE TABLE IF NOT EXISTS group_messages (
                id          TEXT PRIMARY KEY,
                group_id    TEXT NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
                author      TEXT NOT NULL,
                content     TEXT NOT NULL,
                edited      INTEGER NOT NULL DEFAULT 0,
                timestamp   INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_group_messages_group
                ON group_messages(group_id);
            CREATE INDEX IF NOT EXISTS idx_group_members_identity
                ON group_members(identity);
            ",
        )?;
        Ok(())
    }

    pub fn insert_group(
        &self,
        name: Option<&str>,
        members: &BTreeSet<Identity>,
    ) -> SqlResult<Group> {
        let group = Group {
            id: ids::generate(),
            name: name.map(str::to_string),
            members: members.clone(),
            created_at: now(),
        };
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO groups (id, name, created_at) VALUES (?1, ?2, ?3)",
            params![group.id, group.name, group.created_at.timestamp_millis()],
        )?;
        for member in members {
            tx.execute(
                "INSERT OR IGNORE INTO group_members (group_id, identity) VALUES (?1, ?2)",
                params![group.id, member.as_str()],
            )?;
        }
        tx.commit()?;
        Ok(group)
    }

    pub fn load_groups(&self) -> SqlResult<Vec<Group>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, created_at FROM groups ORDER BY created_at, id")?;
        let groups = stmt
            .query_map([], map_group_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        let mut stmt = self
            .conn
            .prepare("SELECT group_id, identity FROM group_members")?;
        let mut members: BTreeMap<String, BTreeSet<Identity>> = BTreeMap::new();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (group_id, identity) = row?;
            members.entry(group_id).or_default().insert(Identity::new(identity));
        }

        Ok(with_members(groups, members))
    }

    pub fn groups_for_identity(&self, identity: &Identity) -> SqlResult<Vec<Group>> {
        let mut stmt = self.conn.prepare(
            "SELECT g.id, g.name, g.created_at FROM groups g
             JOIN group_members m ON m.group_id = g.id
             WHERE m.identity = ?1
             ORDER BY g.created_at, g.id",
        )?;
        let groups = stmt
            .query_map(params![identity.as_str()], map_group_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        let mut members = BTreeMap::new();
        for group in &groups {
            members.insert(group.id.clone(), self.members_of(&group.id)?);
        }
        Ok(with_members(groups, members))
    }

    fn members_of(&self, group_id: &str) -> SqlResult<BTreeSet<Identity>> {
        let mut stmt = self
            .conn
            .prepare("SELECT identity FROM group_members WHERE group_id = ?1")?;
        let rows = stmt.query_map(params![group_id], |row| row.get::<_, String>(0))?;
        rows.map(|r| r.map(Identity::new)).collect()
    }

    pub fn add_member(&self, group_id: &str, identity: &Identity) -> SqlResult<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO group_members (group_id, identity) VALUES (?1, ?2)",
            params![group_id, identity.as_str()],
        )?;
        Ok(())
    }

    pub fn remove_member(&self, group_id: &str, identity: &Identity) -> SqlResult<()> {
        self.conn.execute(
            "DELETE FROM group_members WHERE group_id = ?1 AND identity = ?2",
            params![group_id, identity.as_str()],
        )?;
        Ok(())
    }

    pub fn insert_message(
        &self,
        group_id: &str,
        author: &Identity,
        content: &str,
    ) -> SqlResult<GroupMessage> {
        let message = GroupMessage {
            id: ids::generate(),
            group_id: group_id.to_string(),
            author: author.clone(),
            content: content.to_string(),
            edited: false,
            timestamp: now(),
        };
        self.conn.execute(
            "INSERT INTO group_messages (id, group_id, author, content, edited, timestamp)
             VALUES (?1, ?2, ?3, ?4, 0, ?5)",
            params![
                message.id,
                message.group_id,
                message.author.as_str(),
                message.content,
                message.timestamp.timestamp_millis(),
            ],
        )?;
        Ok(message)
    }

    pub fn get_message(&self, group_id: &str, message_id: &str) -> SqlResult<Option<GroupMessage>> {
        self.conn
            .query_row(
                "SELECT id, group_id, author, content, edited, timestamp
                 FROM group_messages WHERE group_id = ?1 AND id = ?2",
                params![group_id, message_id],
                map_message_row,
            )
            .optional()
    }

    pub fn update_message(
        &self,
        group_id: &str,
        message_id: &str,
        content: &str,
    ) -> SqlResult<Option<GroupMessage>> {
        let updated = self.conn.execute(
            "UPDATE group_messages SET content = ?3, edited = 1
             WHERE group_id = ?1 AND id = ?2",
            params![group_id, message_id, content],
        )?;
        if updated == 0 {
            return Ok(None);
        }
        self.get_message(group_id, message_id)
    }

    pub fn delete_message(&self, group_id: &str, message_id: &str) -> SqlResult<bool> {
        let deleted = self.conn.execute(
            "DELETE FROM group_messages WHERE group_id = ?1 AND id = ?2",
            params![group_id, message_id],
        )?;
        Ok(deleted > 0)
    }

    /// The newest `limit` messages of a group, oldest first.
    pub fn get_messages(&self, group_id: &str, limit: usize) -> SqlResult<Vec<GroupMessage>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, group_id, author, content, edited, timestamp
             FROM group_messages WHERE group_id = ?1
             ORDER BY rowid DESC LIMIT ?2",
        )?;
        let mut messages = stmt
            .query_map(params![group_id, limit as i64], map_message_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }
}

/// Millisecond-precision now, matching what round-trips through the database.
fn now() -> DateTime<Utc> {
    from_millis(Utc::now().timestamp_millis())
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn map_group_row(row: &rusqlite::Row) -> SqlResult<Group> {
    Ok(Group {
        id: row.get(0)?,
        name: row.get(1)?,
        members: BTreeSet::new(),
        created_at: from_millis(row.get(2)?),
    })
}

fn map_message_row(row: &rusqlite::Row) -> SqlResult<GroupMessage> {
    Ok(GroupMessage {
        id: row.get(0)?,
        group_id: row.get(1)?,
        author: Identity::new(row.get::<_, String>(2)?),
        content: row.get(3)?,
        edited: row.get::<_, i64>(4)? != 0,
        timestamp: from_millis(row.get(5)?),
    })
}

fn with_members(
    groups: Vec<Group>,
    mut members: BTreeMap<String, BTreeSet<Identity>>,
) -> Vec<Group> {
    groups
        .into_iter()
        .map(|mut group| {
            group.members = members.remove(&group.id).unwrap_or_default();
            group
        })
        .collect()
}

/// [`Storage`] backed by a single SQLite connection.
pub struct SqliteStore {
    db: Mutex<Db>,
}

impl SqliteStore {
    pub fn new(db: Db) -> Self {
        Self { db: Mutex::new(db) }
    }

    pub fn open<P: AsRef<Path>>(path: P) -> SqlResult<Self> {
        Db::open(path).map(Self::new)
    }

    pub fn open_memory() -> SqlResult<Self> {
        Db::open_memory().map(Self::new)
    }
}

impl Storage for SqliteStore {
    fn create_group(&self, name: Option<&str>, members: &BTreeSet<Identity>) -> StoreResult<Group> {
        Ok(self.db.lock().insert_group(name, members)?)
    }

    fn load_groups(&self) -> StoreResult<Vec<Group>> {
        Ok(self.db.lock().load_groups()?)
    }

    fn groups_for_user(&self, identity: &Identity) -> StoreResult<Vec<Group>> {
        Ok(self.db.lock().groups_for_identity(identity)?)
    }

    fn add_member(&self, group_id: &GroupId, identity: &Identity) -> StoreResult<()> {
        Ok(self.db.lock().add_member(group_id, identity)?)
    }

    fn remove_member(&self, group_id: &GroupId, identity: &Identity) -> StoreResult<()> {
        Ok(self.db.lock().remove_member(group_id, identity)?)
    }

    fn persist_message(
        &self,
        group_id: &GroupId,
        author: &Identity,
        content: &str,
    ) -> StoreResult<GroupMessage> {
        Ok(self.db.lock().insert_message(group_id, author, content)?)
    }

    fn edit_message(
        &self,
        group_id: &GroupId,
        message_id: &MessageId,
        content: &str,
    ) -> StoreResult<Option<GroupMessage>> {
        Ok(self.db.lock().update_message(group_id, message_id, content)?)
    }

    fn delete_message(&self, group_id: &GroupId, message_id: &MessageId) -> StoreResult<bool> {
        Ok(self.db.lock().delete_message(group_id, message_id)?)
    }

    fn get_message(
        &self,
        group_id: &GroupId,
        message_id: &MessageId,
    ) -> StoreResult<Option<GroupMessage>> {
        Ok(self.db.lock().get_message(group_id, message_id)?)
    }

    fn recent_messages(&self, group_id: &GroupId, limit: usize) -> StoreResult<Vec<GroupMessage>> {
        Ok(self.db.lock().get_messages(group_id, limit)?)
    }
}
