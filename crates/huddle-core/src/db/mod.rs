//! Direct SQLite database access for Huddle.
//!
//! This module owns the collaboration tables (sessions, entries) and the
//! local projection of the conversation store (conversations, messages).
//! The schema is initialized idempotently on open.
//!
//! Session rows carry a `version` counter: every write goes through a
//! version-guarded UPDATE so concurrent writers (entry log vs. merge loop)
//! surface as [`Error::WriteConflict`] instead of silently losing updates.

use crate::error::{Error, Result};
use crate::types::{
    Conversation, EntryType, MeetingMemory, Message, NewConversation, NewMessage, Session,
    SessionEntry, Snapshot,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS conversation (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    channel             TEXT NOT NULL,
    subject             TEXT,
    contact_name        TEXT,
    contact_identifier  TEXT NOT NULL,
    created_at          INTEGER NOT NULL,
    updated_at          INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS message (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id  INTEGER NOT NULL REFERENCES conversation(id),
    sender_type      TEXT NOT NULL,
    direction        TEXT NOT NULL,
    channel          TEXT NOT NULL,
    body             TEXT NOT NULL,
    created_at       INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS message_conversation_idx ON message(conversation_id);

CREATE TABLE IF NOT EXISTS collaboration_session (
    id                         TEXT PRIMARY KEY,
    conversation_id            INTEGER NOT NULL REFERENCES conversation(id),
    created_by                 TEXT NOT NULL,
    is_active                  INTEGER NOT NULL DEFAULT 1,
    memory                     TEXT NOT NULL,
    latest_snapshot            TEXT,
    last_processed_message_id  INTEGER NOT NULL DEFAULT 0,
    version                    INTEGER NOT NULL DEFAULT 0,
    created_at                 INTEGER NOT NULL,
    updated_at                 INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS collab_session_conv_idx ON collaboration_session(conversation_id);
-- At most one active session per conversation, enforced at the storage layer
CREATE UNIQUE INDEX IF NOT EXISTS collab_session_active_uniq
    ON collaboration_session(conversation_id) WHERE is_active = 1;

CREATE TABLE IF NOT EXISTS collaboration_entry (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id  TEXT NOT NULL REFERENCES collaboration_session(id),
    user_id     TEXT,
    entry_type  TEXT NOT NULL,
    content     TEXT NOT NULL,
    metadata    TEXT,
    created_at  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS collab_entry_session_idx ON collaboration_entry(session_id);
";

/// Database connection wrapper.
///
/// Thread-safe via internal Mutex. All database operations acquire the lock.
pub struct Database {
    conn: Mutex<Connection>,
}

/// True when an error is a SQLite uniqueness/constraint violation (used to
/// detect a lost create-or-get race on the active-session index).
pub fn is_constraint_violation(err: &Error) -> bool {
    matches!(
        err,
        Error::Database(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

impl Database {
    /// Open database at a specific path and initialize the schema.
    pub fn open_path(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(Error::Database)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(Error::Database)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Check database connectivity
    pub fn ping(&self) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        conn.execute_batch("SELECT 1").map_err(Error::Database)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Session Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new collaboration session with empty meeting memory.
    ///
    /// Fails with a constraint violation if an active session already exists
    /// for the conversation (see `collab_session_active_uniq`).
    pub fn create_session(&self, conversation_id: i64, created_by: &str) -> Result<Session> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp_millis();
        let memory = serde_json::to_string(&MeetingMemory::default())?;

        conn.execute(
            "INSERT INTO collaboration_session
             (id, conversation_id, created_by, is_active, memory,
              last_processed_message_id, version, created_at, updated_at)
             VALUES (?1, ?2, ?3, 1, ?4, 0, 0, ?5, ?5)",
            params![id, conversation_id, created_by, memory, now],
        )?;

        Ok(Session {
            id,
            conversation_id,
            created_by: created_by.to_string(),
            is_active: true,
            memory: MeetingMemory::default(),
            latest_snapshot: None,
            last_processed_message_id: 0,
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }

    /// Get session by ID
    pub fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, created_by, is_active, memory, latest_snapshot,
                    last_processed_message_id, version, created_at, updated_at
             FROM collaboration_session WHERE id = ?1",
        )?;

        Ok(stmt
            .query_row(params![session_id], Self::map_session)
            .optional()?)
    }

    /// Get the active session for a conversation, if any
    pub fn get_active_session_for_conversation(
        &self,
        conversation_id: i64,
    ) -> Result<Option<Session>> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, created_by, is_active, memory, latest_snapshot,
                    last_processed_message_id, version, created_at, updated_at
             FROM collaboration_session
             WHERE conversation_id = ?1 AND is_active = 1
             LIMIT 1",
        )?;

        Ok(stmt
            .query_row(params![conversation_id], Self::map_session)
            .optional()?)
    }

    /// List active sessions, optionally filtered by conversation, most
    /// recently updated first.
    pub fn list_active_sessions(&self, conversation_id: Option<i64>) -> Result<Vec<Session>> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let sessions = if let Some(cid) = conversation_id {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, created_by, is_active, memory, latest_snapshot,
                        last_processed_message_id, version, created_at, updated_at
                 FROM collaboration_session
                 WHERE conversation_id = ?1 AND is_active = 1
                 ORDER BY updated_at DESC",
            )?;
            stmt.query_map(params![cid], Self::map_session)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        } else {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, created_by, is_active, memory, latest_snapshot,
                        last_processed_message_id, version, created_at, updated_at
                 FROM collaboration_session
                 WHERE is_active = 1
                 ORDER BY updated_at DESC",
            )?;
            stmt.query_map([], Self::map_session)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        };
        Ok(sessions)
    }

    /// End a session (terminal; idempotent).
    ///
    /// Bumps the version so in-flight version-guarded writes fail.
    pub fn end_session(&self, session_id: &str) -> Result<Session> {
        {
            let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
            let now = chrono::Utc::now().timestamp_millis();
            conn.execute(
                "UPDATE collaboration_session
                 SET is_active = 0, version = version + 1, updated_at = ?1
                 WHERE id = ?2 AND is_active = 1",
                params![now, session_id],
            )?;
        }
        self.get_session(session_id)?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    /// Persist a merge result: memory, cached snapshot, watermark and
    /// timestamp as one atomic, version-guarded write.
    pub fn apply_merge(
        &self,
        session_id: &str,
        expected_version: i64,
        memory: &MeetingMemory,
        snapshot: &Snapshot,
        last_processed_message_id: i64,
    ) -> Result<()> {
        let memory_json = serde_json::to_string(memory)?;
        let snapshot_json = serde_json::to_string(snapshot)?;
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let now = chrono::Utc::now().timestamp_millis();

        let updated = conn.execute(
            "UPDATE collaboration_session
             SET memory = ?1, latest_snapshot = ?2, last_processed_message_id = ?3,
                 version = version + 1, updated_at = ?4
             WHERE id = ?5 AND version = ?6 AND is_active = 1",
            params![
                memory_json,
                snapshot_json,
                last_processed_message_id,
                now,
                session_id,
                expected_version,
            ],
        )?;

        if updated == 0 {
            return Err(Error::WriteConflict(session_id.to_string()));
        }
        Ok(())
    }

    /// Persist a memory mutation from the entry log, version-guarded.
    pub fn update_memory(
        &self,
        session_id: &str,
        expected_version: i64,
        memory: &MeetingMemory,
    ) -> Result<()> {
        let memory_json = serde_json::to_string(memory)?;
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let now = chrono::Utc::now().timestamp_millis();

        let updated = conn.execute(
            "UPDATE collaboration_session
             SET memory = ?1, version = version + 1, updated_at = ?2
             WHERE id = ?3 AND version = ?4 AND is_active = 1",
            params![memory_json, now, session_id, expected_version],
        )?;

        if updated == 0 {
            return Err(Error::WriteConflict(session_id.to_string()));
        }
        Ok(())
    }

    fn map_session(row: &rusqlite::Row) -> rusqlite::Result<Session> {
        let memory_json: String = row.get(4)?;
        let memory: MeetingMemory = serde_json::from_str(&memory_json)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;
        let snapshot_json: Option<String> = row.get(5)?;
        let latest_snapshot = match snapshot_json {
            Some(json) => Some(serde_json::from_str(&json).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e))
            })?),
            None => None,
        };

        Ok(Session {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            created_by: row.get(2)?,
            is_active: row.get(3)?,
            memory,
            latest_snapshot,
            last_processed_message_id: row.get(6)?,
            version: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    /// Count active sessions (for health check)
    pub fn count_active_sessions(&self) -> Result<u32> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM collaboration_session WHERE is_active = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Entry Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Append an entry to a session's log.
    pub fn create_entry(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        entry_type: EntryType,
        content: &str,
        metadata: Option<&serde_json::Value>,
    ) -> Result<SessionEntry> {
        let metadata_json = metadata.map(serde_json::to_string).transpose()?;
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let now = chrono::Utc::now().timestamp_millis();

        conn.execute(
            "INSERT INTO collaboration_entry
             (session_id, user_id, entry_type, content, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session_id,
                user_id,
                entry_type.as_str(),
                content,
                metadata_json,
                now
            ],
        )?;

        Ok(SessionEntry {
            id: conn.last_insert_rowid(),
            session_id: session_id.to_string(),
            user_id: user_id.map(String::from),
            entry_type,
            content: content.to_string(),
            metadata: metadata.cloned(),
            created_at: now,
        })
    }

    /// List all entries for a session, most recent first.
    pub fn list_entries(&self, session_id: &str) -> Result<Vec<SessionEntry>> {
        self.entries_desc(session_id, None)
    }

    /// Get the most recent bounded window of entries, most recent first.
    pub fn recent_entries(&self, session_id: &str, limit: u32) -> Result<Vec<SessionEntry>> {
        self.entries_desc(session_id, Some(limit))
    }

    fn entries_desc(&self, session_id: &str, limit: Option<u32>) -> Result<Vec<SessionEntry>> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let query = match limit {
            Some(n) => format!(
                "SELECT id, session_id, user_id, entry_type, content, metadata, created_at
                 FROM collaboration_entry WHERE session_id = ?1
                 ORDER BY id DESC LIMIT {n}"
            ),
            None => "SELECT id, session_id, user_id, entry_type, content, metadata, created_at
                 FROM collaboration_entry WHERE session_id = ?1
                 ORDER BY id DESC"
                .to_string(),
        };
        let mut stmt = conn.prepare(&query)?;
        let entries = stmt
            .query_map(params![session_id], Self::map_entry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Highest id among manual (user-authored) entries, 0 if none.
    ///
    /// Used by the stream loop to detect new manual entries since the last
    /// successful merge without re-triggering on its own ai_snapshot rows.
    pub fn latest_manual_entry_id(&self, session_id: &str) -> Result<i64> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let id: i64 = conn.query_row(
            "SELECT COALESCE(MAX(id), 0) FROM collaboration_entry
             WHERE session_id = ?1 AND entry_type != 'ai_snapshot'",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Highest id among ai_snapshot entries, 0 if none.
    ///
    /// A manual entry id above this marks activity that postdates the last
    /// applied merge, even across stream reconnects.
    pub fn latest_snapshot_entry_id(&self, session_id: &str) -> Result<i64> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let id: i64 = conn.query_row(
            "SELECT COALESCE(MAX(id), 0) FROM collaboration_entry
             WHERE session_id = ?1 AND entry_type = 'ai_snapshot'",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    fn map_entry(row: &rusqlite::Row) -> rusqlite::Result<SessionEntry> {
        let type_str: String = row.get(3)?;
        let entry_type = EntryType::parse(&type_str)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
        let metadata_json: Option<String> = row.get(5)?;
        let metadata = match metadata_json {
            Some(json) => Some(serde_json::from_str(&json).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e))
            })?),
            None => None,
        };

        Ok(SessionEntry {
            id: row.get(0)?,
            session_id: row.get(1)?,
            user_id: row.get(2)?,
            entry_type,
            content: row.get(4)?,
            metadata,
            created_at: row.get(6)?,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Conversation Store Operations (read-only projection + fixtures)
    // ─────────────────────────────────────────────────────────────────────────

    /// Get conversation by ID
    pub fn get_conversation(&self, conversation_id: i64) -> Result<Option<Conversation>> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let mut stmt = conn.prepare(
            "SELECT id, channel, subject, contact_name, contact_identifier, created_at, updated_at
             FROM conversation WHERE id = ?1",
        )?;

        Ok(stmt
            .query_row(params![conversation_id], |row| {
                Ok(Conversation {
                    id: row.get(0)?,
                    channel: row.get(1)?,
                    subject: row.get(2)?,
                    contact_name: row.get(3)?,
                    contact_identifier: row.get(4)?,
                    created_at: row.get(5)?,
                    updated_at: row.get(6)?,
                })
            })
            .optional()?)
    }

    /// Fetch messages with id greater than the watermark, most recent first,
    /// bounded. Callers reverse the result to chronological order before use.
    /// A watermark of 0 covers the conversation's entire history.
    pub fn messages_after(
        &self,
        conversation_id: i64,
        after_id: i64,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, sender_type, direction, channel, body, created_at
             FROM message
             WHERE conversation_id = ?1 AND id > ?2
             ORDER BY id DESC LIMIT ?3",
        )?;

        let messages = stmt
            .query_map(params![conversation_id, after_id, limit], |row| {
                Ok(Message {
                    id: row.get(0)?,
                    conversation_id: row.get(1)?,
                    sender_type: row.get(2)?,
                    direction: row.get(3)?,
                    channel: row.get(4)?,
                    body: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(messages)
    }

    /// Record a conversation (ingestion / test fixtures).
    pub fn create_conversation(&self, conversation: &NewConversation) -> Result<i64> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let now = chrono::Utc::now().timestamp_millis();
        conn.execute(
            "INSERT INTO conversation
             (channel, subject, contact_name, contact_identifier, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                conversation.channel,
                conversation.subject,
                conversation.contact_name,
                conversation.contact_identifier,
                now
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Test-only: remove a conversation row, leaving any sessions that
    /// reference it orphaned. Foreign key enforcement is suspended for the
    /// delete so the orphan state can be constructed.
    #[doc(hidden)]
    pub fn delete_conversation(&self, conversation_id: i64) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        conn.execute_batch("PRAGMA foreign_keys = OFF")?;
        let result = conn.execute(
            "DELETE FROM conversation WHERE id = ?1",
            params![conversation_id],
        );
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        result?;
        Ok(())
    }

    /// Record a message (ingestion / test fixtures).
    pub fn append_message(&self, message: &NewMessage) -> Result<i64> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let now = chrono::Utc::now().timestamp_millis();
        conn.execute(
            "INSERT INTO message
             (conversation_id, sender_type, direction, channel, body, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                message.conversation_id,
                message.sender_type,
                message.direction,
                message.channel,
                message.body,
                now
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }
}
