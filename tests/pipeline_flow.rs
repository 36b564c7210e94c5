//! Ingestion → broker → consumer → store, end to end

use std::sync::Arc;
use std::time::Duration;

use rapport::consumer::{ConcurrentConsumer, ConsumerSettings};
use rapport::ingest::IngestionGateway;
use rapport::model::EventStatus;
use rapport::pipeline::EventProcessor;
use rapport::queue::SqliteBroker;
use rapport::scheduler::{FallbackScheduler, SchedulerSettings};
use rapport::scoring::ScoreEngine;
use rapport::store::{Database, EventStore, FriendshipStateUpdater};
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::watch;

const QUEUE: &str = "conversation_events";

struct Harness {
    dir: TempDir,
    db: Database,
    broker: Arc<SqliteBroker>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("rapport.db")).unwrap();
        let broker = Arc::new(
            SqliteBroker::open(&dir.path().join("broker.db"), chrono::Duration::seconds(30))
                .unwrap(),
        );
        Self { dir, db, broker }
    }

    fn gateway(&self) -> IngestionGateway {
        IngestionGateway::new(self.db.clone(), QUEUE)
            .with_transport(self.broker.clone())
            .with_initial_delay(chrono::Duration::zero())
    }

    fn processor(&self) -> EventProcessor {
        EventProcessor::new(self.db.clone(), ScoreEngine::default())
    }

    fn consumer(&self, workers: usize) -> Arc<ConcurrentConsumer> {
        Arc::new(ConcurrentConsumer::new(
            self.broker.clone(),
            self.processor(),
            ConsumerSettings {
                queue: QUEUE.to_string(),
                workers,
                poll_interval: Duration::from_millis(10),
                heartbeat_interval: Duration::from_millis(50),
                max_restarts: 5,
                backoff_initial: Duration::from_millis(10),
                backoff_max: Duration::from_millis(50),
                event_deadline: Some(Duration::from_secs(10)),
            },
        ))
    }

    fn status_of(&self, conversation_id: &str) -> EventStatus {
        let conn = self.db.connect().unwrap();
        EventStore::new(&conn)
            .get(conversation_id)
            .unwrap()
            .unwrap()
            .status
    }

    fn score_of(&self, user_id: &str) -> f64 {
        let conn = self.db.connect().unwrap();
        FriendshipStateUpdater::new(&conn)
            .get_status(user_id)
            .unwrap()
            .map(|s| s.friendship_score)
            .unwrap_or(0.0)
    }

    fn open_channel_ids(&self) -> Vec<String> {
        let conn = rusqlite::Connection::open(self.dir.path().join("broker.db")).unwrap();
        let mut stmt = conn
            .prepare("SELECT id FROM queue_channels WHERE closed_at IS NULL")
            .unwrap();
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        ids
    }

    async fn wait_processed(&self, ids: &[String]) -> bool {
        for _ in 0..500 {
            if ids
                .iter()
                .all(|id| self.status_of(id) == EventStatus::Processed)
            {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

/// Four alternating messages: 2 turns + 2 user messages as questions = 8.0
fn payload(conversation_id: &str, user_id: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "conversation_id": conversation_id,
        "user_id": user_id,
        "bot_id": "talk_movie_preference",
        "bot_name": "Pika",
        "start_time": "2024-03-01T12:00:00Z",
        "end_time": "2024-03-01T12:05:00Z",
        "conversation_log": [
            {"speaker": "pika", "text": "What did you watch?"},
            {"speaker": "user", "text": "A space movie"},
            {"speaker": "pika", "text": "Nice!"},
            {"speaker": "user", "text": "Have you seen it?"}
        ]
    }))
    .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ingested_events_flow_through_queue() {
    let h = Harness::new();
    let gateway = h.gateway();
    let ids: Vec<String> = (0..5).map(|i| format!("conv-flow-{}", i)).collect();
    for id in &ids {
        let accepted = gateway.ingest_json(&payload(id, "user-flow")).unwrap();
        assert!(accepted.published);
    }

    let consumer = h.consumer(3);
    let (tx, rx) = watch::channel(false);
    let running = {
        let consumer = Arc::clone(&consumer);
        tokio::spawn(async move { consumer.run(rx).await })
    };

    let done = h.wait_processed(&ids).await;
    tx.send(true).unwrap();
    let stats = running.await.unwrap().unwrap();

    assert!(done);
    assert_eq!(stats.delivered, 5);
    assert_eq!(stats.acked, 5);
    assert_eq!(h.score_of("user-flow"), 40.0);
    let depth = h.broker.depth(QUEUE).unwrap();
    assert_eq!(depth.ready + depth.unacked, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_consumer_reconnects_after_channel_loss() {
    let h = Harness::new();
    let gateway = h.gateway();
    gateway.ingest_json(&payload("conv-before", "user-reconnect")).unwrap();

    let consumer = h.consumer(2);
    let (tx, rx) = watch::channel(false);
    let running = {
        let consumer = Arc::clone(&consumer);
        tokio::spawn(async move { consumer.run(rx).await })
    };
    assert!(h.wait_processed(&["conv-before".to_string()]).await);

    // Broker-side disconnect of the live channel
    let open = h.open_channel_ids();
    assert_eq!(open.len(), 1);
    assert!(h.broker.close_channel(&open[0], "simulated disconnect").unwrap());

    gateway.ingest_json(&payload("conv-after", "user-reconnect")).unwrap();
    let done = h.wait_processed(&["conv-after".to_string()]).await;
    tx.send(true).unwrap();
    let stats = running.await.unwrap().unwrap();

    assert!(done);
    assert!(stats.restarts >= 1);
    assert_eq!(h.score_of("user-reconnect"), 16.0);
    let reopened = h.open_channel_ids();
    assert!(!reopened.contains(&open[0]));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_queue_and_sweep_race_applies_each_event_once() {
    let h = Harness::new();
    let gateway = h.gateway();
    let ids: Vec<String> = (0..8).map(|i| format!("conv-race-{}", i)).collect();
    for id in &ids {
        gateway.ingest_json(&payload(id, "user-race")).unwrap();
    }
    // Duplicate notifications for every event
    for id in &ids {
        gateway.republish(id).unwrap();
    }

    let consumer = h.consumer(4);
    let (tx, rx) = watch::channel(false);
    let running = {
        let consumer = Arc::clone(&consumer);
        tokio::spawn(async move { consumer.run(rx).await })
    };

    let scheduler = FallbackScheduler::new(
        h.processor(),
        SchedulerSettings {
            interval: Duration::from_millis(5),
            batch_size: 3,
        },
    );
    let sweeping = tokio::spawn(scheduler.run(tx.subscribe()));

    let done = h.wait_processed(&ids).await;
    tx.send(true).unwrap();
    running.await.unwrap().unwrap();
    sweeping.await.unwrap();

    assert!(done);
    assert_eq!(h.score_of("user-race"), 64.0);
    let conn = h.db.connect().unwrap();
    let counts = EventStore::new(&conn).counts().unwrap();
    assert_eq!(counts.processed, 8);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_publish_failure_is_caught_by_sweep() {
    let h = Harness::new();
    // No transport at all: the gateway leaves the event due for the sweep
    let gateway = IngestionGateway::new(h.db.clone(), QUEUE);
    let accepted = gateway
        .ingest_json(&payload("conv-orphan", "user-orphan"))
        .unwrap();
    assert!(!accepted.published);

    let scheduler = FallbackScheduler::new(h.processor(), SchedulerSettings::default());
    let stats = tokio::task::spawn_blocking(move || scheduler.sweep())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(stats.summary.processed, 1);
    assert_eq!(h.status_of("conv-orphan"), EventStatus::Processed);
    assert_eq!(h.score_of("user-orphan"), 8.0);
}
