//! Session lifecycle and entry-log service.
//!
//! Wraps the database with the domain rules the HTTP handlers rely on:
//! create-or-get semantics per conversation, terminal end, and the
//! entry log with its memory projection.

use huddle_core::db::is_constraint_violation;
use huddle_core::types::{EntryType, Session, SessionEntry};
use huddle_core::{Database, Error, Result};
use std::sync::Arc;
use tracing::{debug, info};

/// Attempts at the version-guarded memory write before giving up.
const MEMORY_WRITE_RETRIES: u32 = 3;

/// Session and entry-log operations.
pub struct SessionService {
    db: Arc<Database>,
}

impl SessionService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Create a session for a conversation, or return the existing active
    /// one. The boolean is true when a session was created.
    pub fn create_or_get(&self, conversation_id: i64, created_by: &str) -> Result<(Session, bool)> {
        if self.db.get_conversation(conversation_id)?.is_none() {
            return Err(Error::ConversationNotFound(conversation_id));
        }

        if let Some(existing) = self.db.get_active_session_for_conversation(conversation_id)? {
            return Ok((existing, false));
        }

        match self.db.create_session(conversation_id, created_by) {
            Ok(session) => {
                info!(session_id = %session.id, conversation_id, "collaboration session created");
                Ok((session, true))
            }
            // Lost a create race: another request inserted first, return theirs
            Err(err) if is_constraint_violation(&err) => {
                let existing = self
                    .db
                    .get_active_session_for_conversation(conversation_id)?
                    .ok_or(err)?;
                Ok((existing, false))
            }
            Err(err) => Err(err),
        }
    }

    /// Get a session by id.
    pub fn get(&self, session_id: &str) -> Result<Session> {
        self.db
            .get_session(session_id)?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    /// Get a session with its full entry log, most recent entries first.
    pub fn get_with_entries(&self, session_id: &str) -> Result<(Session, Vec<SessionEntry>)> {
        let session = self.get(session_id)?;
        let entries = self.db.list_entries(session_id)?;
        Ok((session, entries))
    }

    /// List active sessions, optionally scoped to one conversation.
    pub fn list_active(&self, conversation_id: Option<i64>) -> Result<Vec<Session>> {
        self.db.list_active_sessions(conversation_id)
    }

    /// End a session. Terminal and idempotent.
    pub fn end(&self, session_id: &str) -> Result<Session> {
        let session = self.db.end_session(session_id)?;
        info!(session_id = %session.id, "collaboration session ended");
        Ok(session)
    }

    /// Log a manual entry and project it into the session's meeting memory.
    ///
    /// The entry itself is append-only and lands unconditionally; the memory
    /// projection is a version-guarded write retried against concurrent
    /// merge-loop updates.
    pub fn add_entry(
        &self,
        session_id: &str,
        user_id: &str,
        entry_type: &str,
        content: &str,
        metadata: Option<&serde_json::Value>,
    ) -> Result<SessionEntry> {
        let entry_type = EntryType::parse_manual(entry_type)?;
        let content = content.trim();
        if content.is_empty() {
            return Err(Error::Validation("content must not be empty".to_string()));
        }

        let session = self.get(session_id)?;
        if !session.is_active {
            return Err(Error::SessionEnded(session_id.to_string()));
        }

        let entry =
            self.db
                .create_entry(session_id, Some(user_id), entry_type, content, metadata)?;

        let mut attempt = 0;
        loop {
            let current = self.get(session_id)?;
            if !current.is_active {
                // Ended between insert and projection; the entry stays logged
                return Ok(entry);
            }

            let mut memory = current.memory.clone();
            memory.record(entry_type, content);

            match self.db.update_memory(session_id, current.version, &memory) {
                Ok(()) => return Ok(entry),
                Err(Error::WriteConflict(_)) if attempt + 1 < MEMORY_WRITE_RETRIES => {
                    attempt += 1;
                    debug!(session_id, attempt, "memory projection conflicted, retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }
}
