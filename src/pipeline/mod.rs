//! The single claim → compute → apply → mark routine
//!
//! Both the queue consumer and the fallback scheduler drive events through
//! [`EventProcessor::run`]; they differ only in the [`EventSource`] they pass.
//!
//! Exactly-once effect rests on two guards:
//! - the claim is a compare-and-set on status that commits before scoring
//! - the score application and `mark_processed` commit in one IMMEDIATE
//!   transaction that first re-checks the claim token (`attempt_count`)

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::model::{
    ConversationEvent, EventStatus, FriendshipLevel, FriendshipStatus, ScoreBreakdown,
};
use crate::scoring::ScoreEngine;
use crate::store::{
    begin_immediate, Claim, Database, EventStore, FriendshipStateUpdater, RetryPolicy,
    ScoreChange, TopicChange, TopicDirectory,
};

pub const RETRY_LIMIT_EXCEEDED: &str = "RETRY_LIMIT_EXCEEDED";

/// Where the events to process come from
#[derive(Debug, Clone, Copy)]
pub enum EventSource<'a> {
    /// One event named by a queue message
    Conversation(&'a str),
    /// Up to `batch_size` due events, oldest-due first
    Due { batch_size: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    AlreadyProcessed,
    /// Terminal SKIPPED from an earlier attempt
    GaveUpEarlier,
    /// FAILED and its retry time has not arrived
    NotDue,
    ClaimedElsewhere,
    /// Claim expired and was taken over before we finished
    LostClaim,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Outcome {
    Processed {
        delta: f64,
        level: FriendshipLevel,
    },
    /// Retryable failure, back to FAILED
    Failed {
        code: String,
        retry_at: DateTime<Utc>,
    },
    /// Terminal failure, now SKIPPED
    GaveUp {
        code: String,
    },
    Skipped(SkipReason),
    Missing,
}

impl Outcome {
    /// Whether the queue message that triggered this can be acknowledged
    pub fn should_ack(&self) -> bool {
        !matches!(self, Outcome::Failed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Processed { .. } => "processed",
            Outcome::Failed { .. } => "failed",
            Outcome::GaveUp { .. } => "gave_up",
            Outcome::Skipped(_) => "skipped",
            Outcome::Missing => "missing",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessReport {
    pub results: Vec<(String, Outcome)>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReportSummary {
    pub processed: usize,
    pub failed: usize,
    pub gave_up: usize,
    pub skipped: usize,
    pub missing: usize,
}

impl ProcessReport {
    pub fn summary(&self) -> ReportSummary {
        let mut summary = ReportSummary::default();
        for (_, outcome) in &self.results {
            match outcome {
                Outcome::Processed { .. } => summary.processed += 1,
                Outcome::Failed { .. } => summary.failed += 1,
                Outcome::GaveUp { .. } => summary.gave_up += 1,
                Outcome::Skipped(_) => summary.skipped += 1,
                Outcome::Missing => summary.missing += 1,
            }
        }
        summary
    }

    /// Outcome of a single-event run
    pub fn single(&self) -> Option<&Outcome> {
        self.results.first().map(|(_, outcome)| outcome)
    }
}

#[derive(Clone)]
pub struct EventProcessor {
    db: Database,
    engine: ScoreEngine,
    retry: RetryPolicy,
    claim_lease: Duration,
}

impl EventProcessor {
    pub fn new(db: Database, engine: ScoreEngine) -> Self {
        Self {
            db,
            engine,
            retry: RetryPolicy::default(),
            claim_lease: Duration::minutes(15),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    /// Process events from `source` on a connection owned by this call.
    ///
    /// Business failures are recorded on the event and reported as outcomes;
    /// an `Err` means the store itself is unreachable.
    pub fn run(&self, source: EventSource<'_>) -> Result<ProcessReport> {
        let conn = self.db.connect()?;
        let mut report = ProcessReport::default();

        match source {
            EventSource::Conversation(conversation_id) => {
                let outcome = self.process(&conn, conversation_id)?;
                report.results.push((conversation_id.to_string(), outcome));
            }
            EventSource::Due { batch_size } => {
                let due = self.store(&conn).fetch_due_ids(batch_size, Utc::now())?;
                for conversation_id in due {
                    let outcome = self.process(&conn, &conversation_id)?;
                    report.results.push((conversation_id, outcome));
                }
            }
        }
        Ok(report)
    }

    /// Return expired claims to FAILED so they become due again
    pub fn recover_stale_claims(&self) -> Result<usize> {
        let conn = self.db.connect()?;
        self.store(&conn).recover_stale_claims(Utc::now())
    }

    fn store<'c>(&self, conn: &'c Connection) -> EventStore<'c> {
        EventStore::new(conn).with_retry(self.retry)
    }

    fn process(&self, conn: &Connection, conversation_id: &str) -> Result<Outcome> {
        let store = self.store(conn);
        let claim = match store.mark_processing(conversation_id, Utc::now(), self.claim_lease) {
            Ok(claim) => claim,
            // Not ours and unreadable; whoever claims it next records the skip
            Err(e @ Error::Validation(_)) => {
                tracing::warn!(conversation_id, error = %e, "unclaimed event is unreadable");
                return Ok(Outcome::GaveUp {
                    code: e.code().to_string(),
                });
            }
            Err(e) => return Err(e),
        };

        let event = match claim {
            None => {
                tracing::warn!(conversation_id, "event not found");
                return Ok(Outcome::Missing);
            }
            Some(Claim::Rejected(event)) => {
                let reason = match event.status {
                    EventStatus::Processed => SkipReason::AlreadyProcessed,
                    EventStatus::Skipped => SkipReason::GaveUpEarlier,
                    EventStatus::Failed => SkipReason::NotDue,
                    EventStatus::Pending | EventStatus::Processing => SkipReason::ClaimedElsewhere,
                };
                tracing::debug!(conversation_id, reason = ?reason, "event not claimed");
                return Ok(Outcome::Skipped(reason));
            }
            Some(Claim::Unreadable { id, attempt, reason }) => {
                tracing::error!(conversation_id, attempt, error = %reason, "claimed event is unreadable, skipping");
                let error = Error::Validation(reason);
                store.mark_unreadable(id, attempt, &error.to_string(), Utc::now())?;
                return Ok(Outcome::GaveUp {
                    code: error.code().to_string(),
                });
            }
            Some(Claim::Acquired(event)) => event,
        };
        let attempt = event.attempt_count;

        // Scoring may call out to the analyzer; no transaction is open here
        let (delta, breakdown) =
            self.engine
                .compute(&event.conversation_id, &event.conversation_log, &event.signals);

        match self.finalize(conn, &event, delta, breakdown) {
            Ok(Some(status)) => {
                tracing::info!(
                    conversation_id,
                    user_id = %event.user_id,
                    attempt,
                    delta,
                    score = status.friendship_score,
                    level = %status.friendship_level,
                    "event processed"
                );
                Ok(Outcome::Processed {
                    delta,
                    level: status.friendship_level,
                })
            }
            Ok(None) => {
                tracing::warn!(conversation_id, attempt, "claim lost before commit, changes discarded");
                Ok(Outcome::Skipped(SkipReason::LostClaim))
            }
            // The finalize transaction was dropped, so nothing was applied
            Err(e) => self.record_failure(&store, &event, e),
        }
    }

    /// Apply the score and mark processed atomically. `None` when the claim
    /// token no longer matches; the transaction is rolled back.
    fn finalize(
        &self,
        conn: &Connection,
        event: &ConversationEvent,
        delta: f64,
        mut breakdown: ScoreBreakdown,
    ) -> Result<Option<FriendshipStatus>> {
        let now = Utc::now();
        let tx = begin_immediate(conn)?;
        let store = self.store(&tx);

        let still_ours = store.get_by_id(event.id)?.is_some_and(|current| {
            current.status == EventStatus::Processing
                && current.attempt_count == event.attempt_count
        });
        if !still_ours {
            return Ok(None);
        }

        let updater = FriendshipStateUpdater::new(&tx);
        let topic = match event.agent_tag.as_deref() {
            Some(agent_tag) => {
                let level = updater
                    .get_status(&event.user_id)?
                    .map(|s| s.friendship_level)
                    .unwrap_or_default();
                let topic = TopicDirectory::new(&tx).resolve(agent_tag, level)?;
                if topic.is_none() {
                    tracing::debug!(
                        conversation_id = %event.conversation_id,
                        agent_tag,
                        "no topic for agent, applying plain score change"
                    );
                }
                topic
            }
            None => None,
        };
        breakdown.topic_id = topic.clone();

        let change = ScoreChange {
            delta,
            topic: topic.map(|topic_id| TopicChange {
                topic_id,
                agent_used: event.bot_id.clone(),
                turns: u64::from(breakdown.total_turns),
            }),
            emotion: Some(breakdown.session_emotion),
            at: now,
        };
        let status = updater.apply(&event.user_id, &change)?;

        if !store.mark_processed(
            event.id,
            event.attempt_count,
            delta,
            status.friendship_level,
            &breakdown,
            now,
        )? {
            return Ok(None);
        }
        tx.commit()?;
        Ok(Some(status))
    }

    fn record_failure(
        &self,
        store: &EventStore<'_>,
        event: &ConversationEvent,
        err: Error,
    ) -> Result<Outcome> {
        let conversation_id = event.conversation_id.as_str();
        let attempt = event.attempt_count;
        if err.is_infra() {
            // Claim lease recovery returns the event once the store is back
            tracing::error!(conversation_id, attempt, error = %err, "store unavailable during processing");
            return Err(err);
        }

        let now = Utc::now();
        let details = err.to_string();
        let give_up_code = if !err.is_retryable() {
            Some(err.code())
        } else if self.retry.is_exhausted(attempt) {
            Some(RETRY_LIMIT_EXCEEDED)
        } else {
            None
        };

        if let Some(code) = give_up_code {
            tracing::error!(conversation_id, attempt, code, error = %err, "event failed permanently");
            return Ok(if store.mark_skipped(event.id, attempt, code, &details, now)? {
                Outcome::GaveUp {
                    code: code.to_string(),
                }
            } else {
                Outcome::Skipped(SkipReason::LostClaim)
            });
        }

        match store.mark_failed(event.id, attempt, err.code(), &details, now)? {
            Some(retry_at) => {
                tracing::warn!(
                    conversation_id,
                    attempt,
                    code = err.code(),
                    error = %err,
                    retry_at = %retry_at,
                    "event failed, retry scheduled"
                );
                Ok(Outcome::Failed {
                    code: err.code().to_string(),
                    retry_at,
                })
            }
            None => Ok(Outcome::Skipped(SkipReason::LostClaim)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Emotion, SideSignals};
    use crate::store::test_support::{sample_event, t0, temp_db};
    use crate::store::fmt_time;
    use std::sync::{Arc, Barrier};

    fn processor(db: &Database) -> EventProcessor {
        EventProcessor::new(db.clone(), ScoreEngine::default())
    }

    fn ingest(db: &Database, conversation_id: &str, user_id: &str) {
        let conn = db.connect().unwrap();
        EventStore::new(&conn)
            .create(&sample_event(conversation_id, user_id), t0(), t0())
            .unwrap();
    }

    fn score_of(db: &Database, user_id: &str) -> f64 {
        let conn = db.connect().unwrap();
        FriendshipStateUpdater::new(&conn)
            .get_status(user_id)
            .unwrap()
            .map(|s| s.friendship_score)
            .unwrap_or(0.0)
    }

    #[test]
    fn test_process_single_event() {
        let (_dir, db) = temp_db();
        ingest(&db, "conv-001", "user-1");

        let report = processor(&db).run(EventSource::Conversation("conv-001")).unwrap();
        // 2 exchanges + 2 user messages x 3
        assert_eq!(
            report.single(),
            Some(&Outcome::Processed {
                delta: 8.0,
                level: FriendshipLevel::Stranger
            })
        );
        assert_eq!(score_of(&db, "user-1"), 8.0);

        let conn = db.connect().unwrap();
        let event = EventStore::new(&conn).get("conv-001").unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Processed);
        assert_eq!(event.attempt_count, 1);
        assert_eq!(event.friendship_score_change, Some(8.0));
        assert_eq!(event.new_friendship_level, Some(FriendshipLevel::Stranger));
        let details = event.score_calculation_details.unwrap();
        assert_eq!(details.total_turns, 2);
        assert_eq!(details.total_exchange_score, 8.0);
    }

    #[test]
    fn test_second_run_is_idempotent() {
        let (_dir, db) = temp_db();
        ingest(&db, "conv-001", "user-1");
        let processor = processor(&db);

        processor.run(EventSource::Conversation("conv-001")).unwrap();
        let again = processor.run(EventSource::Conversation("conv-001")).unwrap();
        assert_eq!(
            again.single(),
            Some(&Outcome::Skipped(SkipReason::AlreadyProcessed))
        );
        assert!(again.single().unwrap().should_ack());
        assert_eq!(score_of(&db, "user-1"), 8.0);
    }

    #[test]
    fn test_queue_and_sweep_race_applies_once() {
        let (_dir, db) = temp_db();
        for i in 0..5 {
            ingest(&db, &format!("conv-{:03}", i), "user-1");
        }
        let processor = processor(&db);
        let barrier = Arc::new(Barrier::new(2));

        let queue_side = {
            let processor = processor.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                let mut processed = 0;
                for i in 0..5 {
                    let id = format!("conv-{:03}", i);
                    let report = processor.run(EventSource::Conversation(&id)).unwrap();
                    processed += report.summary().processed;
                }
                processed
            })
        };
        let sweep_side = {
            let processor = processor.clone();
            std::thread::spawn(move || {
                barrier.wait();
                processor
                    .run(EventSource::Due { batch_size: 20 })
                    .unwrap()
                    .summary()
                    .processed
            })
        };

        let total = queue_side.join().unwrap() + sweep_side.join().unwrap();
        assert_eq!(total, 5);
        assert_eq!(score_of(&db, "user-1"), 40.0);

        let conn = db.connect().unwrap();
        assert_eq!(EventStore::new(&conn).counts().unwrap().processed, 5);
    }

    #[test]
    fn test_due_sweep_skips_future_events() {
        let (_dir, db) = temp_db();
        ingest(&db, "conv-now", "user-1");
        {
            let conn = db.connect().unwrap();
            EventStore::new(&conn)
                .create(
                    &sample_event("conv-later", "user-1"),
                    Utc::now() + Duration::hours(1),
                    t0(),
                )
                .unwrap();
        }

        let report = processor(&db).run(EventSource::Due { batch_size: 20 }).unwrap();
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].0, "conv-now");

        // The queue path does not wait for the grace window
        let report = processor(&db).run(EventSource::Conversation("conv-later")).unwrap();
        assert_eq!(report.summary().processed, 1);
    }

    #[test]
    fn test_missing_event() {
        let (_dir, db) = temp_db();
        let report = processor(&db).run(EventSource::Conversation("conv-404")).unwrap();
        assert_eq!(report.single(), Some(&Outcome::Missing));
        assert!(report.single().unwrap().should_ack());
    }

    #[test]
    fn test_topic_routing() {
        let (_dir, db) = temp_db();
        {
            let conn = db.connect().unwrap();
            TopicDirectory::new(&conn)
                .set("agent_movie_talk", None, "movie")
                .unwrap();
            let mut event = sample_event("conv-001", "user-1");
            event.agent_tag = Some("agent_movie_talk".to_string());
            event.signals = SideSignals {
                user_initiated_questions: Some(1),
                session_emotion: Some(Emotion::Interesting),
                new_memories_count: None,
            };
            EventStore::new(&conn).create(&event, t0(), t0()).unwrap();
        }

        processor(&db).run(EventSource::Conversation("conv-001")).unwrap();

        let conn = db.connect().unwrap();
        let status = FriendshipStateUpdater::new(&conn)
            .get_status("user-1")
            .unwrap()
            .unwrap();
        // 2 turns + 3 + 15
        assert_eq!(status.friendship_score, 20.0);
        assert_eq!(status.last_emotion, Some(Emotion::Interesting));
        let movie = &status.topic_metrics["movie"];
        assert_eq!(movie.score, 20.0);
        assert_eq!(movie.turns, 2);
        assert!(movie.agents_used.contains("talk_movie_preference"));

        let event = EventStore::new(&conn).get("conv-001").unwrap().unwrap();
        assert_eq!(
            event.score_calculation_details.unwrap().topic_id.as_deref(),
            Some("movie")
        );
    }

    fn corrupt_status(db: &Database, user_id: &str) {
        let conn = db.connect().unwrap();
        conn.execute(
            "INSERT INTO friendship_status (user_id, topic_metrics, created_at, updated_at)
             VALUES (?1, 'not json', ?2, ?2)",
            rusqlite::params![user_id, fmt_time(&t0())],
        )
        .unwrap();
    }

    #[test]
    fn test_failure_rolls_back_and_schedules_retry() {
        let (_dir, db) = temp_db();
        ingest(&db, "conv-001", "user-bad");
        corrupt_status(&db, "user-bad");

        let before = Utc::now();
        let report = processor(&db).run(EventSource::Conversation("conv-001")).unwrap();
        let Some(Outcome::Failed { code, retry_at }) = report.single().cloned() else {
            panic!("expected failure, got {:?}", report);
        };
        assert_eq!(code, "JSON_ERROR");
        assert!(retry_at >= before + Duration::hours(6));
        assert!(!report.single().unwrap().should_ack());

        let conn = db.connect().unwrap();
        let event = EventStore::new(&conn).get("conv-001").unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Failed);
        assert_eq!(event.error_code.as_deref(), Some("JSON_ERROR"));
        assert!(event.friendship_score_change.is_none());

        // Nothing from the failed attempt reached the status row
        let raw: String = conn
            .query_row(
                "SELECT topic_metrics FROM friendship_status WHERE user_id = 'user-bad'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(raw, "not json");

        // A redelivery before the retry time is a no-op
        let again = processor(&db).run(EventSource::Conversation("conv-001")).unwrap();
        assert_eq!(again.single(), Some(&Outcome::Skipped(SkipReason::NotDue)));
    }

    #[test]
    fn test_retry_ceiling_gives_up() {
        let (_dir, db) = temp_db();
        ingest(&db, "conv-001", "user-bad");
        corrupt_status(&db, "user-bad");

        let processor = processor(&db).with_retry(RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        });
        let report = processor.run(EventSource::Conversation("conv-001")).unwrap();
        assert_eq!(
            report.single(),
            Some(&Outcome::GaveUp {
                code: RETRY_LIMIT_EXCEEDED.to_string()
            })
        );

        let conn = db.connect().unwrap();
        let event = EventStore::new(&conn).get("conv-001").unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Skipped);
        assert!(EventStore::new(&conn).fetch_due(10, Utc::now()).unwrap().is_empty());
    }

    #[test]
    fn test_unreadable_event_is_skipped() {
        let (_dir, db) = temp_db();
        ingest(&db, "conv-001", "user-1");
        {
            let conn = db.connect().unwrap();
            conn.execute(
                "UPDATE conversation_events SET conversation_log = '{broken' WHERE conversation_id = 'conv-001'",
                [],
            )
            .unwrap();
        }

        let report = processor(&db).run(EventSource::Due { batch_size: 5 }).unwrap();
        assert_eq!(report.summary().gave_up, 1);

        let conn = db.connect().unwrap();
        let (status, code): (String, String) = conn
            .query_row(
                "SELECT status, error_code FROM conversation_events WHERE conversation_id = 'conv-001'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(status, "SKIPPED");
        assert_eq!(code, "VALIDATION_ERROR");
    }

    #[test]
    fn test_corrupt_signals_skip_instead_of_looping() {
        let (_dir, db) = temp_db();
        ingest(&db, "conv-001", "user-1");
        {
            let conn = db.connect().unwrap();
            conn.execute(
                "UPDATE conversation_events SET signals = 'not json' WHERE conversation_id = 'conv-001'",
                [],
            )
            .unwrap();
        }

        let processor = processor(&db)
            .with_retry(RetryPolicy {
                max_attempts: 1,
                ..RetryPolicy::default()
            })
            .with_claim_lease(Duration::zero());
        for _ in 0..3 {
            processor.run(EventSource::Due { batch_size: 5 }).unwrap();
            processor.recover_stale_claims().unwrap();
        }

        let conn = db.connect().unwrap();
        let (status, code, attempts): (String, String, u32) = conn
            .query_row(
                "SELECT status, error_code, attempt_count FROM conversation_events
                 WHERE conversation_id = 'conv-001'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(status, "SKIPPED");
        assert_eq!(code, "VALIDATION_ERROR");
        assert_eq!(attempts, 1);
    }

    #[test]
    fn test_stale_claim_recovered_and_reprocessed() {
        let (_dir, db) = temp_db();
        ingest(&db, "conv-001", "user-1");
        {
            // Worker claimed then died
            let conn = db.connect().unwrap();
            EventStore::new(&conn)
                .mark_processing("conv-001", Utc::now() - Duration::hours(1), Duration::minutes(15))
                .unwrap();
        }

        let processor = processor(&db);
        assert_eq!(processor.recover_stale_claims().unwrap(), 1);
        let report = processor.run(EventSource::Due { batch_size: 5 }).unwrap();
        assert_eq!(report.summary().processed, 1);

        let conn = db.connect().unwrap();
        let event = EventStore::new(&conn).get("conv-001").unwrap().unwrap();
        assert_eq!(event.attempt_count, 2);
        assert_eq!(score_of(&db, "user-1"), 8.0);
    }
}
