//! Live stream coordination.
//!
//! A live stream polls the conversation on a fixed cadence, runs a merge
//! application when there is new activity, and yields typed events the SSE
//! route forwards to the client. At most one live stream may be open per
//! session; [`StreamRegistry`] enforces this with a Drop-released slot.

use huddle_core::engine::{adopt_memory, MergeEngine, TextGenerator};
use huddle_core::types::{MeetingMemory, Session, Snapshot};
use huddle_core::{Database, Error, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_stream::Stream;
use tracing::{debug, warn};

// ─────────────────────────────────────────────────────────────────────────────
// Stream Events
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedPayload {
    pub session_id: String,
    pub started_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub messages_processed: usize,
    pub total_snapshots: u32,
    pub generated_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPayload {
    pub snapshot: Snapshot,
    pub memory: MeetingMemory,
    pub metadata: SnapshotMetadata,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEndedPayload {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEndPayload {
    pub reason: String,
}

/// One event on a live stream, in emission order on the wire.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Connected(ConnectedPayload),
    Snapshot(Box<SnapshotPayload>),
    Heartbeat(HeartbeatPayload),
    SessionEnded(SessionEndedPayload),
    Error(ErrorPayload),
    StreamEnd(StreamEndPayload),
}

impl StreamEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Connected(_) => "connected",
            StreamEvent::Snapshot(_) => "snapshot",
            StreamEvent::Heartbeat(_) => "heartbeat",
            StreamEvent::SessionEnded(_) => "session_ended",
            StreamEvent::Error(_) => "error",
            StreamEvent::StreamEnd(_) => "stream_end",
        }
    }

    /// JSON payload for the SSE data field.
    pub fn payload(&self) -> serde_json::Result<String> {
        match self {
            StreamEvent::Connected(p) => serde_json::to_string(p),
            StreamEvent::Snapshot(p) => serde_json::to_string(p),
            StreamEvent::Heartbeat(p) => serde_json::to_string(p),
            StreamEvent::SessionEnded(p) => serde_json::to_string(p),
            StreamEvent::Error(p) => serde_json::to_string(p),
            StreamEvent::StreamEnd(p) => serde_json::to_string(p),
        }
    }

    fn connected(session: &Session) -> Self {
        StreamEvent::Connected(ConnectedPayload {
            session_id: session.id.clone(),
            started_at: now_rfc3339(),
        })
    }

    fn heartbeat() -> Self {
        StreamEvent::Heartbeat(HeartbeatPayload {
            timestamp: now_rfc3339(),
        })
    }

    fn session_ended(reason: &str) -> Self {
        StreamEvent::SessionEnded(SessionEndedPayload {
            reason: reason.to_string(),
        })
    }

    fn error(error: impl Into<String>) -> Self {
        StreamEvent::Error(ErrorPayload {
            error: error.into(),
        })
    }

    fn stream_end(reason: &str) -> Self {
        StreamEvent::StreamEnd(StreamEndPayload {
            reason: reason.to_string(),
        })
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

// ─────────────────────────────────────────────────────────────────────────────
// Stream Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Tracks which sessions currently have a live stream open.
#[derive(Debug)]
pub struct StreamRegistry {
    active: Mutex<HashSet<String>>,
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Claim the stream slot for a session. Fails with
    /// [`Error::StreamBusy`] while another stream holds it; the returned
    /// guard releases the slot on drop.
    pub fn try_acquire(self: &Arc<Self>, session_id: &str) -> Result<StreamSlot> {
        let mut active = self.active.lock().map_err(|_| Error::LockPoisoned)?;
        if !active.insert(session_id.to_string()) {
            return Err(Error::StreamBusy(session_id.to_string()));
        }
        Ok(StreamSlot {
            registry: Arc::clone(self),
            session_id: session_id.to_string(),
        })
    }

    fn release(&self, session_id: &str) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(session_id);
        }
    }
}

/// Exclusive hold on a session's stream slot.
#[derive(Debug)]
pub struct StreamSlot {
    registry: Arc<StreamRegistry>,
    session_id: String,
}

impl Drop for StreamSlot {
    fn drop(&mut self) {
        self.registry.release(&self.session_id);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Stream Coordinator
// ─────────────────────────────────────────────────────────────────────────────

/// Tuning knobs for one live stream.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub poll_interval: Duration,
    pub max_duration: Duration,
    pub message_window: u32,
    pub entry_window: u32,
}

/// Outcome of one poll tick.
enum Tick {
    /// Emit an event and keep polling.
    Event(StreamEvent),
    /// Emit an event, then close the stream with the given reason.
    Fatal(StreamEvent, &'static str),
    /// Close the stream without emitting anything besides `stream_end`.
    Close(&'static str),
    /// Nothing to emit this tick.
    Quiet,
}

/// Drives one live stream for one session.
pub struct StreamCoordinator {
    db: Arc<Database>,
    engine: MergeEngine,
    session_id: String,
    settings: StreamSettings,
    // Held for the lifetime of the stream; dropping it frees the session slot
    _slot: StreamSlot,
}

impl StreamCoordinator {
    pub fn new(
        db: Arc<Database>,
        generator: Arc<dyn TextGenerator>,
        slot: StreamSlot,
        session_id: String,
        settings: StreamSettings,
    ) -> Self {
        Self {
            db,
            engine: MergeEngine::new(generator),
            session_id,
            settings,
            _slot: slot,
        }
    }

    /// Consume the coordinator into the event stream the SSE route serves.
    ///
    /// The first event is always `connected`; the last is always
    /// `stream_end` (possibly preceded by `session_ended`).
    pub fn into_stream(self, session: Session) -> impl Stream<Item = StreamEvent> {
        async_stream::stream! {
            yield StreamEvent::connected(&session);
            let started = Instant::now();

            loop {
                match self.tick().await {
                    Tick::Event(event) => yield event,
                    Tick::Fatal(event, reason) => {
                        yield event;
                        yield StreamEvent::stream_end(reason);
                        break;
                    }
                    Tick::Close(reason) => {
                        yield StreamEvent::stream_end(reason);
                        break;
                    }
                    Tick::Quiet => {}
                }

                tokio::time::sleep(self.settings.poll_interval).await;

                // Deadline re-checked after the sleep so no tick starts past it
                if started.elapsed() >= self.settings.max_duration {
                    yield StreamEvent::stream_end("duration limit reached");
                    break;
                }
            }
        }
    }

    async fn tick(&self) -> Tick {
        match self.tick_inner().await {
            Ok(tick) => tick,
            // Transient failure: surface it and keep polling, the watermark
            // has not moved so the next tick retries the same work
            Err(err) => {
                warn!(session_id = %self.session_id, "stream tick failed: {err}");
                Tick::Event(StreamEvent::error(err.to_string()))
            }
        }
    }

    async fn tick_inner(&self) -> Result<Tick> {
        // A missing session is treated the same as an ended one
        let Some(session) = self.db.get_session(&self.session_id)? else {
            return Ok(Tick::Fatal(
                StreamEvent::session_ended("session no longer exists"),
                "session missing",
            ));
        };
        if !session.is_active {
            return Ok(Tick::Fatal(
                StreamEvent::session_ended("session has ended"),
                "session ended",
            ));
        }

        let Some(conversation) = self.db.get_conversation(session.conversation_id)? else {
            return Ok(Tick::Close("conversation missing"));
        };

        let mut messages = self.db.messages_after(
            session.conversation_id,
            session.last_processed_message_id,
            self.settings.message_window,
        )?;
        messages.reverse(); // chronological for the prompt

        // Manual entries newer than the last applied snapshot count as
        // activity; ai_snapshot entries never re-trigger a merge
        let latest_manual = self.db.latest_manual_entry_id(&session.id)?;
        let latest_applied = self.db.latest_snapshot_entry_id(&session.id)?;
        if messages.is_empty() && latest_manual <= latest_applied {
            return Ok(Tick::Event(StreamEvent::heartbeat()));
        }

        let mut entries = self
            .db
            .recent_entries(&session.id, self.settings.entry_window)?;
        entries.retain(|e| e.entry_type.is_manual());
        entries.reverse();

        let snapshot = match self
            .engine
            .merge(&session.memory, &entries, &messages, &conversation)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(session_id = %session.id, "merge failed: {err}");
                return Ok(Tick::Event(StreamEvent::error(err.to_string())));
            }
        };

        let memory = adopt_memory(&session.memory, &snapshot.memory_update);
        let watermark = messages
            .last()
            .map(|m| m.id)
            .unwrap_or(session.last_processed_message_id);

        match self.db.apply_merge(
            &session.id,
            session.version,
            &memory,
            &snapshot,
            watermark,
        ) {
            Ok(()) => {}
            // Another writer moved the session; drop this result and let the
            // next tick merge from the fresher state
            Err(Error::WriteConflict(_)) => {
                debug!(session_id = %session.id, "merge lost a version race, skipping");
                return Ok(Tick::Quiet);
            }
            Err(err) => return Err(err),
        }

        let entry_metadata = serde_json::json!({ "messagesProcessed": messages.len() });
        let entry_content = serde_json::to_string(&snapshot)?;
        if let Err(err) = self.db.create_entry(
            &session.id,
            None,
            huddle_core::types::EntryType::AiSnapshot,
            &entry_content,
            Some(&entry_metadata),
        ) {
            warn!(session_id = %session.id, "failed to log snapshot entry: {err}");
        }

        Ok(Tick::Event(StreamEvent::Snapshot(Box::new(
            SnapshotPayload {
                metadata: SnapshotMetadata {
                    messages_processed: messages.len(),
                    total_snapshots: memory.snapshot_count,
                    generated_at: now_rfc3339(),
                },
                snapshot,
                memory,
            },
        ))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use huddle_core::engine::GenerationRequest;
    use huddle_core::types::{NewConversation, NewMessage};
    use tokio_stream::StreamExt;

    struct ScriptedGenerator {
        responses: Mutex<Vec<String>>,
    }

    impl ScriptedGenerator {
        fn new(responses: Vec<String>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into_iter().rev().collect()),
            })
        }
    }

    #[async_trait]
    impl TextGenerator for ScriptedGenerator {
        async fn generate(&self, _req: &GenerationRequest) -> Result<String> {
            self.responses
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| Error::Upstream("script exhausted".to_string()))
        }
    }

    fn snapshot_json() -> String {
        serde_json::json!({
            "currentGoal": "Agree launch date",
            "decisionsMade": ["Launch in June"],
            "openQuestions": [],
            "suggestedNextStep": "Confirm budget",
            "unresolvedIssues": [],
            "participantSummary": [],
            "newInsights": [],
            "memoryUpdate": {
                "decisions": ["Launch in June"],
                "openQuestions": [],
                "actionItems": [],
                "keyPoints": [],
                "snapshotCount": 0
            }
        })
        .to_string()
    }

    fn fixture() -> (Arc<Database>, i64, Session) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let conv_id = db
            .create_conversation(&NewConversation {
                channel: "email".to_string(),
                subject: None,
                contact_name: None,
                contact_identifier: "a@b.c".to_string(),
            })
            .unwrap();
        let session = db.create_session(conv_id, "user-1").unwrap();
        (db, conv_id, session)
    }

    fn add_message(db: &Database, conv_id: i64, body: &str) {
        db.append_message(&NewMessage {
            conversation_id: conv_id,
            sender_type: "contact".to_string(),
            direction: "inbound".to_string(),
            channel: "email".to_string(),
            body: body.to_string(),
        })
        .unwrap();
    }

    fn settings(max_ms: u64) -> StreamSettings {
        StreamSettings {
            poll_interval: Duration::from_millis(10),
            max_duration: Duration::from_millis(max_ms),
            message_window: 20,
            entry_window: 10,
        }
    }

    fn coordinator(
        db: &Arc<Database>,
        registry: &Arc<StreamRegistry>,
        generator: Arc<dyn TextGenerator>,
        session: &Session,
        max_ms: u64,
    ) -> StreamCoordinator {
        let slot = registry.try_acquire(&session.id).unwrap();
        StreamCoordinator::new(
            Arc::clone(db),
            generator,
            slot,
            session.id.clone(),
            settings(max_ms),
        )
    }

    async fn collect(coordinator: StreamCoordinator, session: Session) -> Vec<StreamEvent> {
        coordinator.into_stream(session).collect().await
    }

    #[test]
    fn test_registry_enforces_single_stream() {
        let registry = Arc::new(StreamRegistry::new());

        let slot = registry.try_acquire("s1").unwrap();
        let err = registry.try_acquire("s1").unwrap_err();
        assert!(matches!(err, Error::StreamBusy(_)));

        // Another session is unaffected
        let _other = registry.try_acquire("s2").unwrap();

        // Dropping the slot frees it
        drop(slot);
        assert!(registry.try_acquire("s1").is_ok());
    }

    #[tokio::test]
    async fn test_idle_session_heartbeats_until_duration_limit() {
        let (db, _conv_id, session) = fixture();
        let registry = Arc::new(StreamRegistry::new());
        let generator = ScriptedGenerator::new(vec![]);

        let c = coordinator(&db, &registry, generator, &session, 40);
        let events = collect(c, session).await;

        assert_eq!(events[0].name(), "connected");
        assert_eq!(events.last().unwrap().name(), "stream_end");
        assert!(events.iter().any(|e| e.name() == "heartbeat"));
        assert!(events.iter().all(|e| e.name() != "snapshot"));
    }

    #[tokio::test]
    async fn test_new_messages_produce_snapshot_and_advance_watermark() {
        let (db, conv_id, session) = fixture();
        add_message(&db, conv_id, "June works for us");
        add_message(&db, conv_id, "Budget is approved");
        add_message(&db, conv_id, "Send over the contract");
        let registry = Arc::new(StreamRegistry::new());
        let generator = ScriptedGenerator::new(vec![snapshot_json()]);

        let c = coordinator(&db, &registry, generator, &session, 50);
        let events = collect(c, session.clone()).await;

        let snapshots: Vec<_> = events.iter().filter(|e| e.name() == "snapshot").collect();
        // Exactly one merge: later ticks see no new activity and heartbeat
        assert_eq!(snapshots.len(), 1);
        assert!(events.iter().any(|e| e.name() == "heartbeat"));

        let fresh = db.get_session(&session.id).unwrap().unwrap();
        assert_eq!(fresh.last_processed_message_id, 3);
        assert_eq!(fresh.memory.snapshot_count, 1);
        assert_eq!(fresh.memory.decisions, vec!["Launch in June"]);
        assert!(fresh.latest_snapshot.is_some());

        // The merge result is logged as an ai_snapshot entry
        let entries = db.list_entries(&session.id).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry_type.as_str(), "ai_snapshot");
        assert_eq!(entries[0].metadata.as_ref().unwrap()["messagesProcessed"], 3);
    }

    #[tokio::test]
    async fn test_manual_entry_triggers_merge_without_new_messages() {
        let (db, _conv_id, session) = fixture();
        db.create_entry(
            &session.id,
            Some("user-1"),
            huddle_core::types::EntryType::Decision,
            "Launch in June",
            None,
        )
        .unwrap();
        let registry = Arc::new(StreamRegistry::new());
        let generator = ScriptedGenerator::new(vec![snapshot_json()]);

        let c = coordinator(&db, &registry, generator, &session, 50);
        let events = collect(c, session.clone()).await;

        assert_eq!(
            events.iter().filter(|e| e.name() == "snapshot").count(),
            1
        );
        let fresh = db.get_session(&session.id).unwrap().unwrap();
        assert_eq!(fresh.memory.snapshot_count, 1);
    }

    #[tokio::test]
    async fn test_malformed_output_emits_error_then_retries() {
        let (db, conv_id, session) = fixture();
        add_message(&db, conv_id, "hello");
        let registry = Arc::new(StreamRegistry::new());
        let generator =
            ScriptedGenerator::new(vec!["not a snapshot".to_string(), snapshot_json()]);

        let c = coordinator(&db, &registry, generator, &session, 60);
        let events = collect(c, session.clone()).await;

        let names: Vec<_> = events.iter().map(|e| e.name()).collect();
        let error_pos = names.iter().position(|n| *n == "error").unwrap();
        let snapshot_pos = names.iter().position(|n| *n == "snapshot").unwrap();
        assert!(error_pos < snapshot_pos);

        // Failed tick did not advance the watermark; the retry did
        let fresh = db.get_session(&session.id).unwrap().unwrap();
        assert_eq!(fresh.memory.snapshot_count, 1);
        assert!(fresh.last_processed_message_id > 0);
    }

    #[tokio::test]
    async fn test_ended_session_closes_stream() {
        let (db, _conv_id, session) = fixture();
        db.end_session(&session.id).unwrap();
        let registry = Arc::new(StreamRegistry::new());
        let generator = ScriptedGenerator::new(vec![]);

        let c = coordinator(&db, &registry, generator, &session, 500);
        let events = collect(c, session).await;

        let names: Vec<_> = events.iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["connected", "session_ended", "stream_end"]);
    }

    #[tokio::test]
    async fn test_reconnect_after_merge_heartbeats() {
        let (db, conv_id, session) = fixture();
        add_message(&db, conv_id, "hello");
        let registry = Arc::new(StreamRegistry::new());

        let generator = ScriptedGenerator::new(vec![snapshot_json()]);
        let c = coordinator(&db, &registry, generator, &session, 40);
        let first_run = collect(c, session.clone()).await;
        assert!(first_run.iter().any(|e| e.name() == "snapshot"));

        // Second connection with no new activity must not re-merge
        let fresh = db.get_session(&session.id).unwrap().unwrap();
        let generator = ScriptedGenerator::new(vec![]);
        let c = coordinator(&db, &registry, generator, &fresh, 40);
        let second_run = collect(c, fresh).await;
        assert!(second_run.iter().all(|e| e.name() != "snapshot"));
        assert!(second_run.iter().all(|e| e.name() != "error"));
        assert!(second_run.iter().any(|e| e.name() == "heartbeat"));
    }

    #[test]
    fn test_event_wire_shape() {
        let decode = |event: &StreamEvent| -> serde_json::Value {
            serde_json::from_str(&event.payload().unwrap()).unwrap()
        };

        let (_db, _conv_id, session) = fixture();
        let connected = StreamEvent::connected(&session);
        assert_eq!(connected.name(), "connected");
        let payload = decode(&connected);
        assert_eq!(payload["sessionId"], session.id);
        assert!(payload["startedAt"].is_string());

        let heartbeat = StreamEvent::heartbeat();
        assert_eq!(heartbeat.name(), "heartbeat");
        assert!(decode(&heartbeat)["timestamp"].is_string());

        let ended = StreamEvent::session_ended("session has ended");
        assert_eq!(ended.name(), "session_ended");
        assert_eq!(decode(&ended)["reason"], "session has ended");

        let error = StreamEvent::error("merge failed");
        assert_eq!(error.name(), "error");
        assert_eq!(decode(&error)["error"], "merge failed");

        let end = StreamEvent::stream_end("duration limit reached");
        assert_eq!(end.name(), "stream_end");
        assert_eq!(decode(&end)["reason"], "duration limit reached");
    }

    #[tokio::test]
    async fn test_missing_session_closes_like_ended() {
        let (db, _conv_id, session) = fixture();
        let registry = Arc::new(StreamRegistry::new());
        let generator = ScriptedGenerator::new(vec![]);

        // Slot and coordinator point at a session id that does not exist
        let slot = registry.try_acquire("ghost").unwrap();
        let c = StreamCoordinator::new(
            Arc::clone(&db),
            generator,
            slot,
            "ghost".to_string(),
            settings(500),
        );
        let events = collect(c, session).await;

        let names: Vec<_> = events.iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["connected", "session_ended", "stream_end"]);
    }

    #[tokio::test]
    async fn test_missing_conversation_closes_silently() {
        let (db, conv_id, session) = fixture();
        // No conversation row backs this session
        db.delete_conversation(conv_id).unwrap();
        let registry = Arc::new(StreamRegistry::new());
        let generator = ScriptedGenerator::new(vec![]);

        let c = coordinator(&db, &registry, generator, &session, 500);
        let events = collect(c, session).await;

        let names: Vec<_> = events.iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["connected", "stream_end"]);
    }

    #[tokio::test]
    async fn test_no_tick_starts_past_the_deadline() {
        let (db, _conv_id, session) = fixture();
        let registry = Arc::new(StreamRegistry::new());
        let generator = ScriptedGenerator::new(vec![]);

        // Deadline shorter than one poll interval: exactly one tick runs
        let slot = registry.try_acquire(&session.id).unwrap();
        let c = StreamCoordinator::new(
            Arc::clone(&db),
            generator,
            slot,
            session.id.clone(),
            StreamSettings {
                poll_interval: Duration::from_millis(30),
                max_duration: Duration::from_millis(5),
                message_window: 20,
                entry_window: 10,
            },
        );
        let events = collect(c, session).await;

        let names: Vec<_> = events.iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["connected", "heartbeat", "stream_end"]);
    }
}
