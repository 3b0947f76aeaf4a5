//! AI merge engine.
//!
//! Folds new conversation messages and manual session entries into the
//! session's meeting memory by asking a text-generation model for a
//! structured snapshot, then diff-merging the proposed memory against the
//! previous one. Parsing is strict: a response that does not contain a
//! complete snapshot object is rejected rather than partially applied.

pub mod genai;

pub use genai::{GenerationRequest, GroqClient, TextGenerator};

use crate::error::{Error, Result};
use crate::types::{Conversation, MeetingMemory, Message, SessionEntry, Snapshot};
use std::sync::Arc;

/// Bodies longer than this are truncated before they reach the prompt.
pub const MAX_MESSAGE_CHARS: usize = 600;

const MERGE_TEMPERATURE: f32 = 0.2;
const MERGE_MAX_TOKENS: u32 = 1536;

const SNAPSHOT_SYSTEM_PROMPT: &str = "\
You are a silent meeting collaborator observing a live business conversation. \
Your job is to maintain an evolving shared understanding of the discussion.

You receive the accumulated meeting memory, the most recent manual notes \
logged by participants, and the newest conversation messages. Fold them into \
an updated picture of the meeting.

Respond with a single JSON object and nothing else, using exactly these keys:
{
  \"currentGoal\": string,
  \"decisionsMade\": string[],
  \"openQuestions\": string[],
  \"suggestedNextStep\": string,
  \"unresolvedIssues\": string[],
  \"participantSummary\": [{\"name\": string, \"lastAction\": string}],
  \"newInsights\": string[],
  \"memoryUpdate\": {
    \"decisions\": string[],
    \"openQuestions\": string[],
    \"actionItems\": string[],
    \"keyPoints\": string[],
    \"snapshotCount\": number
  }
}

memoryUpdate must carry the complete updated memory, not just additions. \
Keep every item short and concrete. Never invent facts that are not in the \
conversation or the notes.";

/// Merge engine: turns (memory, entries, messages) into a fresh [`Snapshot`].
pub struct MergeEngine {
    generator: Arc<dyn TextGenerator>,
}

impl MergeEngine {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }

    /// Run one merge application.
    ///
    /// `manual_entries` and `new_messages` are expected in chronological
    /// order. Returns the parsed snapshot; the caller decides how to adopt
    /// its `memory_update` (see [`adopt_memory`]) and when to persist.
    pub async fn merge(
        &self,
        memory: &MeetingMemory,
        manual_entries: &[SessionEntry],
        new_messages: &[Message],
        conversation: &Conversation,
    ) -> Result<Snapshot> {
        let prompt = build_prompt(memory, manual_entries, new_messages, conversation)?;
        let request = GenerationRequest {
            prompt,
            system: Some(SNAPSHOT_SYSTEM_PROMPT.to_string()),
            temperature: MERGE_TEMPERATURE,
            max_tokens: MERGE_MAX_TOKENS,
            json_object: true,
        };

        tracing::debug!(
            entries = manual_entries.len(),
            messages = new_messages.len(),
            "running merge application"
        );

        let raw = self.generator.generate(&request).await?;
        parse_snapshot(&raw)
    }
}

fn build_prompt(
    memory: &MeetingMemory,
    manual_entries: &[SessionEntry],
    new_messages: &[Message],
    conversation: &Conversation,
) -> Result<String> {
    let memory_json = serde_json::to_string_pretty(memory)?;

    let entries: Vec<serde_json::Value> = manual_entries
        .iter()
        .map(|e| {
            serde_json::json!({
                "type": e.entry_type.as_str(),
                "content": e.content,
                "createdAt": e.created_at,
            })
        })
        .collect();

    let messages: Vec<serde_json::Value> = new_messages
        .iter()
        .map(|m| {
            serde_json::json!({
                "id": m.id,
                "senderType": m.sender_type,
                "direction": m.direction,
                "channel": m.channel,
                "body": truncate_body(&m.body),
                "createdAt": m.created_at,
            })
        })
        .collect();

    Ok(format!(
        "Conversation: channel={}, subject={}, contact={} <{}>\n\n\
         Meeting memory so far:\n{}\n\n\
         Recent manual notes (chronological):\n{}\n\n\
         New conversation messages (chronological):\n{}",
        conversation.channel,
        conversation.subject.as_deref().unwrap_or("(none)"),
        conversation.contact_name.as_deref().unwrap_or("unknown"),
        conversation.contact_identifier,
        memory_json,
        serde_json::to_string_pretty(&entries)?,
        serde_json::to_string_pretty(&messages)?,
    ))
}

/// Truncate a message body at a char boundary.
fn truncate_body(body: &str) -> String {
    if body.chars().count() <= MAX_MESSAGE_CHARS {
        body.to_string()
    } else {
        let truncated: String = body.chars().take(MAX_MESSAGE_CHARS).collect();
        format!("{truncated}…")
    }
}

/// Parse a model response into a [`Snapshot`], strictly.
///
/// Reasoning models wrap output in `<think>` blocks and some add prose
/// around the JSON; strip both, then require the remaining object to
/// deserialize completely. Any missing key fails the merge.
pub fn parse_snapshot(raw: &str) -> Result<Snapshot> {
    let without_think = strip_think_blocks(raw);

    let start = without_think.find('{');
    let end = without_think.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if s < e => &without_think[s..=e],
        _ => {
            return Err(Error::MalformedModelOutput(
                "no JSON object in response".to_string(),
            ))
        }
    };

    serde_json::from_str(json).map_err(|e| Error::MalformedModelOutput(e.to_string()))
}

fn strip_think_blocks(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(open) = rest.find("<think>") {
        out.push_str(&rest[..open]);
        match rest[open..].find("</think>") {
            Some(close) => rest = &rest[open + close + "</think>".len()..],
            // Unterminated block swallows the remainder
            None => return out,
        }
    }
    out.push_str(rest);
    out
}

/// Adopt a model-proposed memory against the previous one.
///
/// Growing lists (`decisions`, `action_items`, `key_points`) take the union
/// of old and new so a forgetful model can never erase history. Open
/// questions come from the proposal as-is, since resolving a question is the
/// one legitimate removal. `snapshot_count` is owned by this function, never
/// by the model.
pub fn adopt_memory(previous: &MeetingMemory, proposed: &MeetingMemory) -> MeetingMemory {
    MeetingMemory {
        decisions: merge_additive(&previous.decisions, &proposed.decisions),
        open_questions: proposed.open_questions.clone(),
        action_items: merge_additive(&previous.action_items, &proposed.action_items),
        key_points: merge_additive(&previous.key_points, &proposed.key_points),
        snapshot_count: previous.snapshot_count + 1,
    }
}

fn merge_additive(old: &[String], new: &[String]) -> Vec<String> {
    let mut merged = old.to_vec();
    for item in new {
        if !merged.contains(item) {
            merged.push(item.clone());
        }
    }
    merged
}
