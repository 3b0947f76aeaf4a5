//! Shared types for huddle-core.
//!
//! These types are used by both the database layer and the HTTP API. Wire
//! names are camelCase to match the JSON contract consumed by inbox clients.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Meeting Memory
// ─────────────────────────────────────────────────────────────────────────────

/// Cumulative meeting memory for a collaboration session.
///
/// `decisions`, `action_items` and `key_points` only grow over the lifetime of
/// a session; `open_questions` may shrink when later activity resolves a
/// question. `snapshot_count` equals the number of merge applications.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingMemory {
    #[serde(default)]
    pub decisions: Vec<String>,
    #[serde(default)]
    pub open_questions: Vec<String>,
    #[serde(default)]
    pub action_items: Vec<String>,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub snapshot_count: u32,
}

impl MeetingMemory {
    /// Project a manual entry into the matching memory bucket (list append,
    /// no de-duplication).
    pub fn record(&mut self, entry_type: EntryType, content: &str) {
        let bucket = match entry_type {
            EntryType::Decision => &mut self.decisions,
            EntryType::Question => &mut self.open_questions,
            EntryType::ActionItem => &mut self.action_items,
            EntryType::Note => &mut self.key_points,
            // ai_snapshot entries carry a serialized Snapshot, not a bucket item
            EntryType::AiSnapshot => return,
        };
        bucket.push(content.to_string());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Snapshot
// ─────────────────────────────────────────────────────────────────────────────

/// One participant's latest observed activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantSummary {
    pub name: String,
    pub last_action: String,
}

/// Transient output of one merge application.
///
/// All fields are required; a model response missing any of them is rejected
/// as malformed. `memory_update` is the model's proposed complete memory and
/// is diff-merged against the previous memory before adoption (see
/// [`crate::engine::adopt_memory`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub current_goal: String,
    pub decisions_made: Vec<String>,
    pub open_questions: Vec<String>,
    pub suggested_next_step: String,
    pub unresolved_issues: Vec<String>,
    pub participant_summary: Vec<ParticipantSummary>,
    pub new_insights: Vec<String>,
    pub memory_update: MeetingMemory,
}

// ─────────────────────────────────────────────────────────────────────────────
// Session & Entries
// ─────────────────────────────────────────────────────────────────────────────

/// One live-collaboration run scoped to a single conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub conversation_id: i64,
    pub created_by: String,
    pub is_active: bool,
    pub memory: MeetingMemory,
    pub latest_snapshot: Option<Snapshot>,
    /// Highest message id already folded into `memory` (0 = nothing yet).
    pub last_processed_message_id: i64,
    /// Optimistic-concurrency counter, bumped on every write.
    pub version: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Type of a logged session entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Decision,
    Note,
    Question,
    ActionItem,
    AiSnapshot,
}

impl EntryType {
    /// The manual (user-authored) entry types accepted by the entry log.
    pub const MANUAL: [&'static str; 4] = ["decision", "note", "question", "action_item"];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Decision => "decision",
            EntryType::Note => "note",
            EntryType::Question => "question",
            EntryType::ActionItem => "action_item",
            EntryType::AiSnapshot => "ai_snapshot",
        }
    }

    /// Parse a stored entry type string (any variant).
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "decision" => Ok(EntryType::Decision),
            "note" => Ok(EntryType::Note),
            "question" => Ok(EntryType::Question),
            "action_item" => Ok(EntryType::ActionItem),
            "ai_snapshot" => Ok(EntryType::AiSnapshot),
            other => Err(Error::Validation(format!("unknown entry type: {other}"))),
        }
    }

    /// Parse a user-supplied entry type; rejects `ai_snapshot`, which is
    /// system-generated only.
    pub fn parse_manual(s: &str) -> Result<Self> {
        match Self::parse(s) {
            Ok(t) if t.is_manual() => Ok(t),
            _ => Err(Error::Validation(format!(
                "entryType must be one of: {}",
                Self::MANUAL.join(", ")
            ))),
        }
    }

    pub fn is_manual(&self) -> bool {
        !matches!(self, EntryType::AiSnapshot)
    }
}

/// One manually or automatically logged session item. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub id: i64,
    pub session_id: String,
    /// None for system-generated entries (ai_snapshot).
    pub user_id: Option<String>,
    pub entry_type: EntryType,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
    pub created_at: i64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Conversation Store (read-only projection)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: i64,
    pub channel: String,
    pub subject: Option<String>,
    pub contact_name: Option<String>,
    pub contact_identifier: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    pub conversation_id: i64,
    pub sender_type: String,
    pub direction: String,
    pub channel: String,
    pub body: String,
    pub created_at: i64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Input Types (for creating entities)
// ─────────────────────────────────────────────────────────────────────────────

/// Input for recording a conversation (used by ingestion and test fixtures).
#[derive(Debug, Clone)]
pub struct NewConversation {
    pub channel: String,
    pub subject: Option<String>,
    pub contact_name: Option<String>,
    pub contact_identifier: String,
}

/// Input for recording a message (used by ingestion and test fixtures).
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: i64,
    pub sender_type: String,
    pub direction: String,
    pub channel: String,
    pub body: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_projects_into_buckets() {
        let mut memory = MeetingMemory::default();
        memory.record(EntryType::Decision, "Ship v2 Friday");
        memory.record(EntryType::Question, "Who owns rollout?");
        memory.record(EntryType::ActionItem, "Draft release notes");
        memory.record(EntryType::Note, "Customer prefers email");

        assert_eq!(memory.decisions, vec!["Ship v2 Friday"]);
        assert_eq!(memory.open_questions, vec!["Who owns rollout?"]);
        assert_eq!(memory.action_items, vec!["Draft release notes"]);
        assert_eq!(memory.key_points, vec!["Customer prefers email"]);
        assert_eq!(memory.snapshot_count, 0);
    }

    #[test]
    fn test_record_does_not_deduplicate() {
        let mut memory = MeetingMemory::default();
        memory.record(EntryType::Decision, "same");
        memory.record(EntryType::Decision, "same");
        assert_eq!(memory.decisions.len(), 2);
    }

    #[test]
    fn test_entry_type_parse_manual() {
        assert_eq!(
            EntryType::parse_manual("action_item").unwrap(),
            EntryType::ActionItem
        );
        assert!(EntryType::parse_manual("ai_snapshot").is_err());
        assert!(EntryType::parse_manual("bogus").is_err());
    }

    #[test]
    fn test_memory_wire_names_are_camel_case() {
        let memory = MeetingMemory {
            decisions: vec!["d".into()],
            open_questions: vec![],
            action_items: vec![],
            key_points: vec![],
            snapshot_count: 3,
        };
        let json = serde_json::to_value(&memory).unwrap();
        assert!(json.get("openQuestions").is_some());
        assert!(json.get("keyPoints").is_some());
        assert_eq!(json["snapshotCount"], 3);
    }

    #[test]
    fn test_snapshot_rejects_missing_keys() {
        let json = r#"{"currentGoal": "x", "decisionsMade": []}"#;
        assert!(serde_json::from_str::<Snapshot>(json).is_err());
    }
}
