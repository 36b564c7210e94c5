//! Ingestion gateway: validate, persist as PENDING, then best-effort publish
//!
//! The store write is the acknowledgment. A failed publish never fails the
//! call; the event is made due immediately and the fallback sweep finds it.

mod transform;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::model::{ConversationEvent, NewConversationEvent, SideSignals};
use crate::queue::{publish_event, QueueTransport};
use crate::store::{Database, EventStore};

pub use transform::{is_api_format, normalize_log, speaker_for_character, NormalizedLog};

const ID_MIN_LEN: usize = 3;
const ID_MAX_LEN: usize = 255;

/// Payload submitted by the upstream backend when a session ends
#[derive(Debug, Clone, Deserialize)]
pub struct IngestRequest {
    pub conversation_id: String,
    pub user_id: String,
    #[serde(default = "default_bot_type")]
    pub bot_type: String,
    pub bot_id: String,
    #[serde(default)]
    pub bot_name: String,
    #[serde(default)]
    pub agent_tag: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(alias = "conversation_logs")]
    pub conversation_log: Value,
    #[serde(default)]
    pub raw_conversation_log: Option<Value>,
    #[serde(flatten)]
    pub signals: SideSignals,
}

fn default_bot_type() -> String {
    "companion".to_string()
}

/// An event that was persisted; `published` says whether the queue took it
#[derive(Debug, Clone)]
pub struct Accepted {
    pub event: ConversationEvent,
    pub published: bool,
}

pub struct IngestionGateway {
    db: Database,
    transport: Option<Arc<dyn QueueTransport>>,
    queue: String,
    initial_delay: Duration,
}

impl IngestionGateway {
    pub fn new(db: Database, queue: impl Into<String>) -> Self {
        Self {
            db,
            transport: None,
            queue: queue.into(),
            initial_delay: Duration::minutes(5),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn QueueTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Decode a JSON body and ingest it
    pub fn ingest_json(&self, body: &[u8]) -> Result<Accepted> {
        let request: IngestRequest = serde_json::from_slice(body)
            .map_err(|e| Error::Validation(format!("invalid payload: {}", e)))?;
        self.ingest(request)
    }

    pub fn ingest(&self, request: IngestRequest) -> Result<Accepted> {
        let event = build_event(request)?;
        let conn = self.db.connect()?;
        let store = EventStore::new(&conn);

        // Advisory; the unique index settles races between two submitters
        if store.exists(&event.conversation_id)? {
            return Err(Error::AlreadyExists(event.conversation_id));
        }

        let now = Utc::now();
        let stored = store.create(&event, now + self.initial_delay, now)?;
        tracing::info!(
            conversation_id = %stored.conversation_id,
            user_id = %stored.user_id,
            turns = stored.conversation_log.len(),
            "conversation event accepted"
        );

        let published = self.publish_or_make_due(&store, &stored)?;
        let event = if published {
            stored
        } else {
            store
                .get(&stored.conversation_id)?
                .ok_or_else(|| Error::NotFound(stored.conversation_id.clone()))?
        };
        Ok(Accepted { event, published })
    }

    /// Make a waiting event due now and notify the queue again
    pub fn republish(&self, conversation_id: &str) -> Result<Accepted> {
        let conn = self.db.connect()?;
        let store = EventStore::new(&conn);

        let event = store
            .get(conversation_id)?
            .ok_or_else(|| Error::NotFound(conversation_id.to_string()))?;
        if !store.make_due(conversation_id, Utc::now())? {
            return Err(Error::Validation(format!(
                "event {} is {} and cannot be requeued",
                conversation_id, event.status
            )));
        }

        let published = self.publish(&event);
        let event = store
            .get(conversation_id)?
            .ok_or_else(|| Error::NotFound(conversation_id.to_string()))?;
        Ok(Accepted { event, published })
    }

    fn publish_or_make_due(&self, store: &EventStore<'_>, event: &ConversationEvent) -> Result<bool> {
        if self.publish(event) {
            return Ok(true);
        }
        store.make_due(&event.conversation_id, Utc::now())?;
        Ok(false)
    }

    fn publish(&self, event: &ConversationEvent) -> bool {
        let Some(transport) = &self.transport else {
            tracing::debug!(
                conversation_id = %event.conversation_id,
                "no queue transport configured, leaving event to the sweep"
            );
            return false;
        };

        match publish_event(transport.as_ref(), &self.queue, event) {
            Ok(_) => {
                tracing::debug!(conversation_id = %event.conversation_id, queue = %self.queue, "published");
                true
            }
            Err(e) => {
                tracing::warn!(
                    conversation_id = %event.conversation_id,
                    error = %e,
                    "queue publish failed, fallback sweep will pick the event up"
                );
                false
            }
        }
    }
}

/// Validate a request and turn it into a storable event
pub fn build_event(request: IngestRequest) -> Result<NewConversationEvent> {
    check_id("conversation_id", &request.conversation_id)?;
    check_id("user_id", &request.user_id)?;
    if request.bot_id.trim().is_empty() {
        return Err(Error::Validation("bot_id must not be empty".to_string()));
    }
    if request.end_time <= request.start_time {
        return Err(Error::Validation(format!(
            "end_time {} must be after start_time {}",
            request.end_time, request.start_time
        )));
    }

    let normalized = normalize_log(&request.conversation_log, request.start_time, request.end_time)?;
    let raw_conversation_log = match request.raw_conversation_log {
        Some(raw) => Some(raw),
        None if normalized.transformed => Some(request.conversation_log),
        None => None,
    };

    Ok(NewConversationEvent {
        conversation_id: request.conversation_id,
        user_id: request.user_id,
        bot_type: request.bot_type,
        bot_id: request.bot_id,
        bot_name: request.bot_name,
        agent_tag: request.agent_tag.filter(|tag| !tag.trim().is_empty()),
        start_time: request.start_time,
        end_time: request.end_time,
        conversation_log: normalized.turns,
        raw_conversation_log,
        signals: request.signals,
    })
}

fn check_id(field: &str, value: &str) -> Result<()> {
    let len = value.chars().count();
    if (ID_MIN_LEN..=ID_MAX_LEN).contains(&len) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "{} must be {}-{} characters, got {}",
            field, ID_MIN_LEN, ID_MAX_LEN, len
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Emotion, EventStatus, QueueMessage, Speaker};
    use crate::queue::{Channel, SqliteBroker};
    use crate::store::test_support::temp_db;
    use serde_json::json;

    struct FailingTransport;

    impl QueueTransport for FailingTransport {
        fn declare(&self, _queue: &str) -> Result<()> {
            Ok(())
        }

        fn publish(&self, _queue: &str, _body: &[u8]) -> Result<()> {
            Err(Error::TransientInfra("broker unreachable".to_string()))
        }

        fn open_channel(&self, _queue: &str, _prefetch: usize) -> Result<Box<dyn Channel>> {
            Err(Error::TransientInfra("broker unreachable".to_string()))
        }
    }

    fn payload(conversation_id: &str) -> Value {
        json!({
            "conversation_id": conversation_id,
            "user_id": "user-001",
            "bot_id": "talk_movie_preference",
            "bot_name": "Pika",
            "agent_tag": "talk_movie",
            "start_time": "2024-03-01T12:00:00Z",
            "end_time": "2024-03-01T12:05:00Z",
            "conversation_logs": [
                {"character": "BOT_RESPONSE_CONVERSATION", "content": "What did you watch?"},
                {"character": "USER_RESPONSE_CONVERSATION", "content": "A space movie"}
            ],
            "session_emotion": "interesting"
        })
    }

    fn request(value: Value) -> IngestRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_payload_decodes_with_signals_and_alias() {
        let req = request(payload("conv-001"));
        assert_eq!(req.bot_type, "companion");
        assert_eq!(req.signals.session_emotion, Some(Emotion::Interesting));
        assert_eq!(req.signals.user_initiated_questions, None);

        let event = build_event(req).unwrap();
        assert_eq!(event.conversation_log.len(), 2);
        assert_eq!(event.conversation_log[1].speaker, Speaker::User);
        assert_eq!(event.duration_seconds(), 300);
        assert!(event.raw_conversation_log.is_some());
    }

    #[test]
    fn test_validation_rules() {
        assert!(matches!(
            build_event(request(payload("ab"))),
            Err(Error::Validation(_))
        ));

        let mut backwards = payload("conv-002");
        backwards["end_time"] = json!("2024-03-01T11:59:00Z");
        assert!(matches!(
            build_event(request(backwards)),
            Err(Error::Validation(_))
        ));

        let mut zero = payload("conv-003");
        zero["end_time"] = json!("2024-03-01T12:00:00Z");
        assert!(matches!(build_event(request(zero)), Err(Error::Validation(_))));

        let mut no_bot = payload("conv-004");
        no_bot["bot_id"] = json!(" ");
        assert!(matches!(build_event(request(no_bot)), Err(Error::Validation(_))));

        let mut long_user = payload("conv-005");
        long_user["user_id"] = json!("u".repeat(256));
        assert!(matches!(
            build_event(request(long_user)),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_malformed_body_is_validation_error() {
        let (_dir, db) = temp_db();
        let gateway = IngestionGateway::new(db, "conversation_events");
        let err = gateway.ingest_json(b"{\"conversation_id\": 12}").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_ingest_publishes_and_rejects_duplicates() {
        let (dir, db) = temp_db();
        let broker = Arc::new(SqliteBroker::open(&dir.path().join("broker.db"), Duration::seconds(30)).unwrap());
        let gateway = IngestionGateway::new(db, "conversation_events")
            .with_transport(broker.clone());

        let body = serde_json::to_vec(&payload("conv-010")).unwrap();
        let accepted = gateway.ingest_json(&body).unwrap();
        assert!(accepted.published);
        assert_eq!(accepted.event.status, EventStatus::Pending);
        assert!(accepted.event.next_attempt_at > Utc::now() + Duration::minutes(4));

        let mut channel = broker.open_channel("conversation_events", 1).unwrap();
        let delivery = channel.poll().unwrap().unwrap();
        let message: QueueMessage = serde_json::from_slice(&delivery.body).unwrap();
        assert_eq!(message.conversation_id, "conv-010");
        assert_eq!(message.user_id, "user-001");

        let err = gateway.ingest_json(&body).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn test_publish_failure_still_accepts_and_makes_due() {
        let (_dir, db) = temp_db();
        let gateway = IngestionGateway::new(db.clone(), "conversation_events")
            .with_transport(Arc::new(FailingTransport));

        let accepted = gateway.ingest(request(payload("conv-020"))).unwrap();
        assert!(!accepted.published);
        assert!(accepted.event.next_attempt_at <= Utc::now());

        let conn = db.connect().unwrap();
        let due = EventStore::new(&conn).fetch_due_ids(10, Utc::now()).unwrap();
        assert_eq!(due, vec!["conv-020".to_string()]);
    }

    #[test]
    fn test_republish_requires_waiting_event() {
        let (_dir, db) = temp_db();
        let gateway = IngestionGateway::new(db.clone(), "conversation_events");

        assert!(matches!(
            gateway.republish("conv-missing"),
            Err(Error::NotFound(_))
        ));

        gateway.ingest(request(payload("conv-030"))).unwrap();
        let conn = db.connect().unwrap();
        conn.execute(
            "UPDATE conversation_events SET status = 'PROCESSED' WHERE conversation_id = 'conv-030'",
            [],
        )
        .unwrap();

        assert!(matches!(
            gateway.republish("conv-030"),
            Err(Error::Validation(_))
        ));
    }
}
