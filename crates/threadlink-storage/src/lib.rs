//! Threadlink Storage -- rusqlite wrapper for conversations and device links.
//!
//! WAL mode + busy_timeout, one connection behind a Mutex. Every method is a
//! short, self-contained transaction; callers never hold the lock across a
//! network call.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use threadlink_protocol::{now_ms, DeviceLink, HandshakeState, InboundEnvelope, LinkedDevice, ProfileUpdate};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch { expected: u32, found: u32 },
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, StorageError>;

const SCHEMA_VERSION: u32 = 1;

const FLAG_UNLINKED: &str = "was_unlinked";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadKind {
    Contact,
    Group,
}

impl ThreadKind {
    fn as_str(&self) -> &'static str {
        match self {
            ThreadKind::Contact => "contact",
            ThreadKind::Group => "group",
        }
    }
}

/// Conversation thread row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadRow {
    pub id: i64,
    pub kind: ThreadKind,
    /// Contact identity or group id.
    pub peer: String,
    /// Hidden threads are not surfaced by the UI (e.g. a linked device).
    pub hidden: bool,
    pub last_message_at: Option<i64>,
    pub handshake_state: HandshakeState,
    pub handshake_expires_at: Option<i64>,
}

/// Queued inbound envelope awaiting the receive pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundJobRow {
    pub id: i64,
    pub envelope: InboundEnvelope,
    pub enqueued_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileRow {
    pub identity: String,
    pub display_name: Option<String>,
    pub profile_key: Option<Vec<u8>>,
    pub updated_at: String,
}

/// Storage trait consumed by the routing and polling components.
pub trait Storage: Send + Sync {
    // Threads
    fn contact_thread(&self, identity: &str) -> Result<Option<ThreadRow>>;
    /// `hidden` only applies when the thread is created by this call.
    fn get_or_create_contact_thread(&self, identity: &str, hidden: bool) -> Result<ThreadRow>;
    fn get_or_create_group_thread(&self, group_id: &str) -> Result<ThreadRow>;
    fn list_group_threads(&self) -> Result<Vec<ThreadRow>>;
    /// Advance `last_message_at`; older timestamps are ignored and future
    /// ones are clamped to now.
    fn record_thread_activity(&self, thread_id: i64, timestamp_ms: i64) -> Result<()>;
    fn group_last_message_at(&self, group_id: &str) -> Result<Option<i64>>;

    // Handshakes (stored on the contact thread)
    fn handshake_state(&self, identity: &str) -> Result<HandshakeState>;
    /// Returns false if no contact thread exists for `identity`.
    fn write_handshake_state(
        &self,
        identity: &str,
        state: HandshakeState,
        expires_at: Option<i64>,
    ) -> Result<bool>;
    fn list_handshakes(&self, state: HandshakeState) -> Result<Vec<ThreadRow>>;

    // Device links
    /// Replace every persisted link whose master is `master`.
    fn replace_device_links(&self, master: &str, links: &[DeviceLink]) -> Result<()>;
    fn upsert_device_link(&self, link: &DeviceLink) -> Result<()>;
    fn delete_device_link(&self, master: &str, slave: &str) -> Result<bool>;
    fn read_all_device_links(&self) -> Result<Vec<DeviceLink>>;

    // Receive pipeline
    /// Returns `None` when an envelope with the same server hash is already queued.
    fn enqueue_inbound(&self, envelope: &InboundEnvelope) -> Result<Option<i64>>;
    fn pending_inbound(&self, limit: u32) -> Result<Vec<InboundJobRow>>;

    // Profiles
    /// Merge non-empty fields into the stored profile.
    fn write_profile(&self, identity: &str, update: &ProfileUpdate) -> Result<()>;
    fn read_profile(&self, identity: &str) -> Result<Option<ProfileRow>>;

    // Local device flags
    fn set_unlinked(&self, unlinked: bool) -> Result<()>;
    fn is_unlinked(&self) -> Result<bool>;
}

/// SQLite-backed storage.
/// Connection wrapped in Mutex for Send + Sync (rusqlite Connection is !Sync).
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    #[allow(dead_code)]
    db_path: Option<PathBuf>,
}

impl SqliteStorage {
    fn db(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    /// Open (or create) the database at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )?;

        let storage = Self {
            conn: Mutex::new(conn),
            db_path: Some(db_path.to_path_buf()),
        };

        storage.ensure_schema()?;
        Ok(storage)
    }

    /// Private in-memory database (tests, CLI dry runs).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let storage = Self {
            conn: Mutex::new(conn),
            db_path: None,
        };
        storage.ensure_schema()?;
        Ok(storage)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.db()?;
        let table_exists: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_version'",
            [],
            |row| row.get(0),
        )?;

        if !table_exists {
            conn.execute_batch(include_str!("schema_v1.sql"))?;
            tracing::debug!(version = SCHEMA_VERSION, "storage: initialised schema");
        }

        let version: u32 = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?
            .unwrap_or(0);

        if version != SCHEMA_VERSION {
            return Err(StorageError::SchemaVersionMismatch {
                expected: SCHEMA_VERSION,
                found: version,
            });
        }

        Ok(())
    }

    fn get_or_create_thread(&self, kind: ThreadKind, peer: &str, hidden: bool) -> Result<ThreadRow> {
        let conn = self.db()?;
        conn.execute(
            "INSERT INTO threads (kind, peer, hidden) VALUES (?1, ?2, ?3)
             ON CONFLICT(kind, peer) DO NOTHING",
            params![kind.as_str(), peer, hidden as i32],
        )?;
        let thread = conn.query_row(
            &format!("{THREAD_COLUMNS} WHERE kind = ?1 AND peer = ?2"),
            params![kind.as_str(), peer],
            thread_from_row,
        )??;
        Ok(thread)
    }
}

const THREAD_COLUMNS: &str = "SELECT id, kind, peer, hidden, last_message_at,
        handshake_state, handshake_expires_at FROM threads";

fn thread_from_row(row: &Row<'_>) -> rusqlite::Result<Result<ThreadRow>> {
    let kind: String = row.get(1)?;
    let state: String = row.get(5)?;
    let kind = match kind.as_str() {
        "contact" => ThreadKind::Contact,
        "group" => ThreadKind::Group,
        other => return Ok(Err(StorageError::Corrupt(format!("thread kind '{other}'")))),
    };
    let Some(handshake_state) = HandshakeState::parse(&state) else {
        return Ok(Err(StorageError::Corrupt(format!("handshake state '{state}'"))));
    };
    Ok(Ok(ThreadRow {
        id: row.get(0)?,
        kind,
        peer: row.get(2)?,
        hidden: row.get::<_, i32>(3)? != 0,
        last_message_at: row.get(4)?,
        handshake_state,
        handshake_expires_at: row.get(6)?,
    }))
}

/// Activity timestamps come from sender clocks; one ahead of ours would
/// pin the group at its busiest cadence.
fn clamp_to_now(timestamp_ms: i64) -> i64 {
    timestamp_ms.min(now_ms())
}

fn link_from_row(row: &Row<'_>) -> rusqlite::Result<DeviceLink> {
    Ok(DeviceLink::new(
        LinkedDevice {
            identity: row.get(0)?,
            signature: row.get(2)?,
        },
        LinkedDevice {
            identity: row.get(1)?,
            signature: row.get(3)?,
        },
    ))
}

fn insert_link(conn: &Connection, link: &DeviceLink) -> Result<()> {
    conn.execute(
        "INSERT INTO device_links (master, slave, master_signature, slave_signature)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(master, slave) DO UPDATE SET
           master_signature = COALESCE(excluded.master_signature, master_signature),
           slave_signature = COALESCE(excluded.slave_signature, slave_signature),
           stored_at = datetime('now')",
        params![
            link.master.identity,
            link.slave.identity,
            link.master.signature,
            link.slave.signature,
        ],
    )?;
    Ok(())
}

impl Storage for SqliteStorage {
    fn contact_thread(&self, identity: &str) -> Result<Option<ThreadRow>> {
        let conn = self.db()?;
        let row = conn
            .query_row(
                &format!("{THREAD_COLUMNS} WHERE kind = 'contact' AND peer = ?1"),
                params![identity],
                thread_from_row,
            )
            .optional()?;
        row.transpose()
    }

    fn get_or_create_contact_thread(&self, identity: &str, hidden: bool) -> Result<ThreadRow> {
        self.get_or_create_thread(ThreadKind::Contact, identity, hidden)
    }

    fn get_or_create_group_thread(&self, group_id: &str) -> Result<ThreadRow> {
        self.get_or_create_thread(ThreadKind::Group, group_id, false)
    }

    fn list_group_threads(&self) -> Result<Vec<ThreadRow>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare(&format!("{THREAD_COLUMNS} WHERE kind = 'group' ORDER BY id"))?;
        let rows = stmt.query_map([], thread_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    fn record_thread_activity(&self, thread_id: i64, timestamp_ms: i64) -> Result<()> {
        let timestamp_ms = clamp_to_now(timestamp_ms);
        let conn = self.db()?;
        conn.execute(
            "UPDATE threads SET
               last_message_at = MAX(COALESCE(last_message_at, 0), ?2),
               updated_at = datetime('now')
             WHERE id = ?1",
            params![thread_id, timestamp_ms],
        )?;
        Ok(())
    }

    fn group_last_message_at(&self, group_id: &str) -> Result<Option<i64>> {
        let conn = self.db()?;
        let ts = conn
            .query_row(
                "SELECT last_message_at FROM threads WHERE kind = 'group' AND peer = ?1",
                params![group_id],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?;
        Ok(ts.flatten())
    }

    fn handshake_state(&self, identity: &str) -> Result<HandshakeState> {
        Ok(self
            .contact_thread(identity)?
            .map(|t| t.handshake_state)
            .unwrap_or_default())
    }

    fn write_handshake_state(
        &self,
        identity: &str,
        state: HandshakeState,
        expires_at: Option<i64>,
    ) -> Result<bool> {
        let conn = self.db()?;
        let changes = conn.execute(
            "UPDATE threads SET
               handshake_state = ?2,
               handshake_expires_at = ?3,
               updated_at = datetime('now')
             WHERE kind = 'contact' AND peer = ?1",
            params![identity, state.as_str(), expires_at],
        )?;
        Ok(changes > 0)
    }

    fn list_handshakes(&self, state: HandshakeState) -> Result<Vec<ThreadRow>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare(&format!(
            "{THREAD_COLUMNS} WHERE kind = 'contact' AND handshake_state = ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![state.as_str()], thread_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    fn replace_device_links(&self, master: &str, links: &[DeviceLink]) -> Result<()> {
        let mut conn = self.db()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM device_links WHERE master = ?1", params![master])?;
        for link in links.iter().filter(|l| l.master_identity() == master) {
            insert_link(&tx, link)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn upsert_device_link(&self, link: &DeviceLink) -> Result<()> {
        let conn = self.db()?;
        insert_link(&conn, link)
    }

    fn delete_device_link(&self, master: &str, slave: &str) -> Result<bool> {
        let conn = self.db()?;
        let changes = conn.execute(
            "DELETE FROM device_links WHERE master = ?1 AND slave = ?2",
            params![master, slave],
        )?;
        Ok(changes > 0)
    }

    fn read_all_device_links(&self) -> Result<Vec<DeviceLink>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare(
            "SELECT master, slave, master_signature, slave_signature
             FROM device_links ORDER BY master, slave",
        )?;
        let rows = stmt.query_map([], link_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn enqueue_inbound(&self, envelope: &InboundEnvelope) -> Result<Option<i64>> {
        let json = serde_json::to_string(envelope)?;
        let mut conn = self.db()?;
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO inbound_jobs (source, group_id, server_hash, envelope)
             VALUES (?1, ?2, ?3, ?4)",
            params![envelope.source, envelope.group_id, envelope.server_hash, json],
        )?;
        if inserted == 0 {
            return Ok(None);
        }
        let job_id = tx.last_insert_rowid();

        // Receipt of a group message is the activity signal the poll cadence feeds on.
        if let Some(group_id) = &envelope.group_id {
            tx.execute(
                "INSERT INTO threads (kind, peer) VALUES ('group', ?1)
                 ON CONFLICT(kind, peer) DO NOTHING",
                params![group_id],
            )?;
            tx.execute(
                "UPDATE threads SET
                   last_message_at = MAX(COALESCE(last_message_at, 0), ?2),
                   updated_at = datetime('now')
                 WHERE kind = 'group' AND peer = ?1",
                params![group_id, clamp_to_now(envelope.timestamp_ms)],
            )?;
        }
        tx.commit()?;
        Ok(Some(job_id))
    }

    fn pending_inbound(&self, limit: u32) -> Result<Vec<InboundJobRow>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare(
            "SELECT id, envelope, enqueued_at FROM inbound_jobs ORDER BY id LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, json, enqueued_at) = row?;
            out.push(InboundJobRow {
                id,
                envelope: serde_json::from_str(&json)?,
                enqueued_at,
            });
        }
        Ok(out)
    }

    fn write_profile(&self, identity: &str, update: &ProfileUpdate) -> Result<()> {
        let conn = self.db()?;
        conn.execute(
            "INSERT INTO profiles (identity, display_name, profile_key)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(identity) DO UPDATE SET
               display_name = COALESCE(excluded.display_name, display_name),
               profile_key = COALESCE(excluded.profile_key, profile_key),
               updated_at = datetime('now')",
            params![identity, update.display_name, update.profile_key],
        )?;
        Ok(())
    }

    fn read_profile(&self, identity: &str) -> Result<Option<ProfileRow>> {
        let conn = self.db()?;
        let row = conn
            .query_row(
                "SELECT identity, display_name, profile_key, updated_at
                 FROM profiles WHERE identity = ?1",
                params![identity],
                |row| {
                    Ok(ProfileRow {
                        identity: row.get(0)?,
                        display_name: row.get(1)?,
                        profile_key: row.get(2)?,
                        updated_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn set_unlinked(&self, unlinked: bool) -> Result<()> {
        let conn = self.db()?;
        conn.execute(
            "INSERT INTO local_flags (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![FLAG_UNLINKED, unlinked as i32],
        )?;
        Ok(())
    }

    fn is_unlinked(&self) -> Result<bool> {
        let conn = self.db()?;
        let value = conn
            .query_row(
                "SELECT value FROM local_flags WHERE key = ?1",
                params![FLAG_UNLINKED],
                |row| row.get::<_, i32>(0),
            )
            .optional()?;
        Ok(value.unwrap_or(0) != 0)
    }
}
