//! Conversation event persistence and the processing state machine

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{fmt_time, parse_opt_time, parse_time};
use crate::error::{is_unique_violation, Error, Result};
use crate::model::{
    ConversationEvent, EventCounts, EventStatus, FriendshipLevel, NewConversationEvent,
    ScoreBreakdown, SideSignals, Turn,
};

const EVENT_COLUMNS: &str = "id, conversation_id, user_id, bot_type, bot_id, bot_name, agent_tag, \
     start_time, end_time, duration_seconds, conversation_log, raw_conversation_log, signals, \
     status, attempt_count, next_attempt_at, processed_at, error_code, error_details, \
     friendship_score_change, new_friendship_level, score_calculation_details, \
     created_at, updated_at";

/// Cooldown applied when an attempt fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,
    /// Upper bound of the uniform random spread added to `delay`
    pub jitter: Duration,
    /// Attempts after which a failure becomes terminal
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::hours(6),
            jitter: Duration::zero(),
            max_attempts: 10,
        }
    }
}

impl RetryPolicy {
    pub fn retry_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let jitter_ms = self.jitter.num_milliseconds();
        if jitter_ms <= 0 {
            return now + self.delay;
        }
        let spread = rand::thread_rng().gen_range(0..=jitter_ms);
        now + self.delay + Duration::milliseconds(spread)
    }

    pub fn is_exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }
}

/// Result of a claim attempt
#[derive(Debug, Clone)]
pub enum Claim {
    /// This caller now owns the event; `attempt_count` is the claim token
    Acquired(ConversationEvent),
    /// Someone else holds it or it is not eligible; carries the current row
    Rejected(ConversationEvent),
    /// Claimed, but the stored row does not decode
    Unreadable { id: i64, attempt: u32, reason: String },
}

pub struct EventStore<'c> {
    conn: &'c Connection,
    retry: RetryPolicy,
}

impl<'c> EventStore<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self {
            conn,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    // ============================================
    // CREATE & LOOKUP
    // ============================================

    /// Insert a PENDING event; the uniqueness constraint is the final dedup authority
    pub fn create(
        &self,
        event: &NewConversationEvent,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ConversationEvent> {
        let log = serde_json::to_string(&event.conversation_log)?;
        let raw = event
            .raw_conversation_log
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let signals = serde_json::to_string(&event.signals)?;
        let now_s = fmt_time(&now);

        let result = self.conn.execute(
            "INSERT INTO conversation_events
                (conversation_id, user_id, bot_type, bot_id, bot_name, agent_tag,
                 start_time, end_time, duration_seconds, conversation_log, raw_conversation_log,
                 signals, status, attempt_count, next_attempt_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 'PENDING', 0, ?13, ?14, ?14)",
            params![
                event.conversation_id,
                event.user_id,
                event.bot_type,
                event.bot_id,
                event.bot_name,
                event.agent_tag,
                fmt_time(&event.start_time),
                fmt_time(&event.end_time),
                event.duration_seconds(),
                log,
                raw,
                signals,
                fmt_time(&next_attempt_at),
                now_s,
            ],
        );

        match result {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(Error::AlreadyExists(event.conversation_id.clone()))
            }
            Err(e) => return Err(e.into()),
        }

        let id = self.conn.last_insert_rowid();
        self.get_by_id(id)?
            .ok_or_else(|| Error::Unexpected(format!("event {} vanished after insert", id)))
    }

    pub fn exists(&self, conversation_id: &str) -> Result<bool> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM conversation_events WHERE conversation_id = ?",
                params![conversation_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn get(&self, conversation_id: &str) -> Result<Option<ConversationEvent>> {
        self.query_one(
            &format!(
                "SELECT {} FROM conversation_events WHERE conversation_id = ?",
                EVENT_COLUMNS
            ),
            conversation_id,
        )
    }

    pub fn get_by_id(&self, id: i64) -> Result<Option<ConversationEvent>> {
        self.query_one(
            &format!("SELECT {} FROM conversation_events WHERE id = ?", EVENT_COLUMNS),
            id,
        )
    }

    fn query_one<P: rusqlite::ToSql>(&self, sql: &str, key: P) -> Result<Option<ConversationEvent>> {
        let row = self
            .conn
            .query_row(sql, params![key], EventRow::from_row)
            .optional()?;
        row.map(EventRow::into_event).transpose()
    }

    /// PENDING or FAILED events whose `next_attempt_at` has passed, oldest-due first
    pub fn fetch_due(&self, batch_size: usize, now: DateTime<Utc>) -> Result<Vec<ConversationEvent>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM conversation_events
             WHERE status IN ('PENDING', 'FAILED') AND next_attempt_at <= ?1
             ORDER BY next_attempt_at ASC, id ASC
             LIMIT ?2",
            EVENT_COLUMNS
        ))?;
        let rows = stmt
            .query_map(
                params![fmt_time(&now), usize_to_i64_saturating(batch_size)],
                EventRow::from_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(EventRow::into_event).collect()
    }

    /// Keys of [`fetch_due`](Self::fetch_due) without decoding the rows
    pub fn fetch_due_ids(&self, batch_size: usize, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT conversation_id FROM conversation_events
             WHERE status IN ('PENDING', 'FAILED') AND next_attempt_at <= ?1
             ORDER BY next_attempt_at ASC, id ASC
             LIMIT ?2",
        )?;
        let ids = stmt
            .query_map(
                params![fmt_time(&now), usize_to_i64_saturating(batch_size)],
                |row| row.get(0),
            )?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    /// Most recent events first, optionally filtered by status
    pub fn list(&self, status: Option<EventStatus>, limit: usize) -> Result<Vec<ConversationEvent>> {
        let limit = usize_to_i64_saturating(limit);
        let rows = match status {
            Some(status) => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {} FROM conversation_events WHERE status = ?1 ORDER BY id DESC LIMIT ?2",
                    EVENT_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![status.as_str(), limit], EventRow::from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {} FROM conversation_events ORDER BY id DESC LIMIT ?1",
                    EVENT_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![limit], EventRow::from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            }
        };
        rows.into_iter().map(EventRow::into_event).collect()
    }

    pub fn counts(&self) -> Result<EventCounts> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM conversation_events GROUP BY status")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut counts = EventCounts::default();
        for (status, n) in rows {
            let n = u64::try_from(n).unwrap_or(0);
            match status.parse::<EventStatus>()? {
                EventStatus::Pending => counts.pending = n,
                EventStatus::Processing => counts.processing = n,
                EventStatus::Processed => counts.processed = n,
                EventStatus::Failed => counts.failed = n,
                EventStatus::Skipped => counts.skipped = n,
            }
        }
        Ok(counts)
    }

    // ============================================
    // STATE TRANSITIONS
    // ============================================

    /// Claim an event for processing.
    ///
    /// A single compare-and-set UPDATE: only PENDING events, or FAILED events
    /// whose retry time has arrived, move to PROCESSING. The winner's
    /// `attempt_count` is incremented and `next_attempt_at` becomes the claim
    /// lease deadline. Returns `None` when the event does not exist.
    pub fn mark_processing(
        &self,
        conversation_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<Claim>> {
        let now_s = fmt_time(&now);
        let claimed: Option<(i64, u32)> = self
            .conn
            .query_row(
                "UPDATE conversation_events
                 SET status = 'PROCESSING',
                     attempt_count = attempt_count + 1,
                     next_attempt_at = ?1,
                     updated_at = ?2
                 WHERE conversation_id = ?3
                   AND (status = 'PENDING' OR (status = 'FAILED' AND next_attempt_at <= ?2))
                 RETURNING id, attempt_count",
                params![fmt_time(&(now + lease)), now_s, conversation_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let event = match (self.get(conversation_id), claimed) {
            (Ok(Some(event)), _) => event,
            (Ok(None), _) => return Ok(None),
            (Err(Error::Validation(reason)), Some((id, attempt))) => {
                return Ok(Some(Claim::Unreadable { id, attempt, reason }));
            }
            (Err(e), _) => return Err(e),
        };
        Ok(Some(match claimed {
            Some(_) => Claim::Acquired(event),
            None => Claim::Rejected(event),
        }))
    }

    /// Terminal success. Applies only while the caller still holds the claim
    /// identified by `attempt`; returns false when the claim was lost.
    pub fn mark_processed(
        &self,
        id: i64,
        attempt: u32,
        score_change: f64,
        level: FriendshipLevel,
        details: &ScoreBreakdown,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let details = serde_json::to_string(details)?;
        let changed = self.conn.execute(
            "UPDATE conversation_events
             SET status = 'PROCESSED',
                 processed_at = ?1,
                 next_attempt_at = ?1,
                 error_code = NULL,
                 error_details = NULL,
                 friendship_score_change = ?2,
                 new_friendship_level = ?3,
                 score_calculation_details = ?4,
                 updated_at = ?1
             WHERE id = ?5 AND status = 'PROCESSING' AND attempt_count = ?6",
            params![fmt_time(&now), score_change, level.as_str(), details, id, attempt],
        )?;
        Ok(changed == 1)
    }

    /// Back to FAILED with `next_attempt_at = now + retry delay`.
    /// Returns the scheduled retry time, or `None` when the claim was lost.
    pub fn mark_failed(
        &self,
        id: i64,
        attempt: u32,
        code: &str,
        details: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let retry_at = self.retry.retry_at(now);
        let changed = self.conn.execute(
            "UPDATE conversation_events
             SET status = 'FAILED',
                 next_attempt_at = ?1,
                 error_code = ?2,
                 error_details = ?3,
                 updated_at = ?4
             WHERE id = ?5 AND status = 'PROCESSING' AND attempt_count = ?6",
            params![fmt_time(&retry_at), code, details, fmt_time(&now), id, attempt],
        )?;
        Ok((changed == 1).then_some(retry_at))
    }

    /// Terminal give-up; the event is never picked up again
    pub fn mark_skipped(
        &self,
        id: i64,
        attempt: u32,
        code: &str,
        details: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE conversation_events
             SET status = 'SKIPPED',
                 error_code = ?1,
                 error_details = ?2,
                 updated_at = ?3
             WHERE id = ?4 AND status = 'PROCESSING' AND attempt_count = ?5",
            params![code, details, fmt_time(&now), id, attempt],
        )?;
        Ok(changed == 1)
    }

    /// Give up on a claimed event whose stored row no longer decodes
    pub fn mark_unreadable(
        &self,
        id: i64,
        attempt: u32,
        details: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE conversation_events
             SET status = 'SKIPPED',
                 error_code = 'VALIDATION_ERROR',
                 error_details = ?1,
                 updated_at = ?2
             WHERE id = ?3 AND status = 'PROCESSING' AND attempt_count = ?4",
            params![details, fmt_time(&now), id, attempt],
        )?;
        Ok(changed == 1)
    }

    /// Return PROCESSING events whose claim lease expired to FAILED, due now
    pub fn recover_stale_claims(&self, now: DateTime<Utc>) -> Result<usize> {
        let now_s = fmt_time(&now);
        let changed = self.conn.execute(
            "UPDATE conversation_events
             SET status = 'FAILED',
                 error_code = 'CLAIM_EXPIRED',
                 error_details = 'claim lease expired before completion',
                 next_attempt_at = ?1,
                 updated_at = ?1
             WHERE status = 'PROCESSING' AND next_attempt_at <= ?1",
            params![now_s],
        )?;
        Ok(changed)
    }

    /// Pull a waiting event's retry time forward to `now`
    pub fn make_due(&self, conversation_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let now_s = fmt_time(&now);
        let changed = self.conn.execute(
            "UPDATE conversation_events
             SET next_attempt_at = ?1, updated_at = ?1
             WHERE conversation_id = ?2 AND status IN ('PENDING', 'FAILED')",
            params![now_s, conversation_id],
        )?;
        Ok(changed == 1)
    }
}

fn usize_to_i64_saturating(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

// ============================================
// ROW TYPES
// ============================================

struct EventRow {
    id: i64,
    conversation_id: String,
    user_id: String,
    bot_type: String,
    bot_id: String,
    bot_name: String,
    agent_tag: Option<String>,
    start_time: String,
    end_time: String,
    duration_seconds: i64,
    conversation_log: String,
    raw_conversation_log: Option<String>,
    signals: Option<String>,
    status: String,
    attempt_count: u32,
    next_attempt_at: String,
    processed_at: Option<String>,
    error_code: Option<String>,
    error_details: Option<String>,
    friendship_score_change: Option<f64>,
    new_friendship_level: Option<String>,
    score_calculation_details: Option<String>,
    created_at: String,
    updated_at: String,
}

impl EventRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            user_id: row.get(2)?,
            bot_type: row.get(3)?,
            bot_id: row.get(4)?,
            bot_name: row.get(5)?,
            agent_tag: row.get(6)?,
            start_time: row.get(7)?,
            end_time: row.get(8)?,
            duration_seconds: row.get(9)?,
            conversation_log: row.get(10)?,
            raw_conversation_log: row.get(11)?,
            signals: row.get(12)?,
            status: row.get(13)?,
            attempt_count: row.get(14)?,
            next_attempt_at: row.get(15)?,
            processed_at: row.get(16)?,
            error_code: row.get(17)?,
            error_details: row.get(18)?,
            friendship_score_change: row.get(19)?,
            new_friendship_level: row.get(20)?,
            score_calculation_details: row.get(21)?,
            created_at: row.get(22)?,
            updated_at: row.get(23)?,
        })
    }

    /// Any column that fails to decode makes the whole row a validation error
    fn into_event(self) -> Result<ConversationEvent> {
        let conversation_id = self.conversation_id.clone();
        self.decode().map_err(|e| match e {
            Error::Validation(_) => e,
            other => Error::Validation(format!(
                "stored row of {} does not decode: {}",
                conversation_id, other
            )),
        })
    }

    fn decode(self) -> Result<ConversationEvent> {
        let conversation_log: Vec<Turn> = serde_json::from_str(&self.conversation_log)?;
        let raw_conversation_log = self
            .raw_conversation_log
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let signals: SideSignals = match self.signals.as_deref() {
            Some(s) => serde_json::from_str(s)?,
            None => SideSignals::default(),
        };
        let score_calculation_details: Option<ScoreBreakdown> = self
            .score_calculation_details
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let new_friendship_level = self
            .new_friendship_level
            .as_deref()
            .map(str::parse::<FriendshipLevel>)
            .transpose()?;

        Ok(ConversationEvent {
            id: self.id,
            conversation_id: self.conversation_id,
            user_id: self.user_id,
            bot_type: self.bot_type,
            bot_id: self.bot_id,
            bot_name: self.bot_name,
            agent_tag: self.agent_tag,
            start_time: parse_time(&self.start_time)?,
            end_time: parse_time(&self.end_time)?,
            duration_seconds: self.duration_seconds,
            conversation_log,
            raw_conversation_log,
            signals,
            status: self.status.parse()?,
            attempt_count: self.attempt_count,
            next_attempt_at: parse_time(&self.next_attempt_at)?,
            processed_at: parse_opt_time(self.processed_at)?,
            error_code: self.error_code,
            error_details: self.error_details,
            friendship_score_change: self.friendship_score_change,
            new_friendship_level,
            score_calculation_details,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::{sample_event, t0, temp_db};
    use std::sync::{Arc, Barrier};

    fn lease() -> Duration {
        Duration::minutes(15)
    }

    fn claim_token(claim: Option<Claim>) -> (i64, u32) {
        match claim {
            Some(Claim::Acquired(e)) => (e.id, e.attempt_count),
            other => panic!("expected acquired claim, got {:?}", other),
        }
    }

    #[test]
    fn test_create_and_get() {
        let (_dir, db) = temp_db();
        let conn = db.connect().unwrap();
        let store = EventStore::new(&conn);

        let created = store.create(&sample_event("conv-001", "user-1"), t0(), t0()).unwrap();
        assert_eq!(created.status, EventStatus::Pending);
        assert_eq!(created.attempt_count, 0);
        assert_eq!(created.duration_seconds, 300);
        assert_eq!(created.conversation_log.len(), 4);

        let fetched = store.get("conv-001").unwrap().unwrap();
        assert_eq!(fetched.id, created.id);
        assert!(store.exists("conv-001").unwrap());
        assert!(store.get("conv-404").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_conversation_id_rejected() {
        let (_dir, db) = temp_db();
        let conn = db.connect().unwrap();
        let store = EventStore::new(&conn);

        store.create(&sample_event("conv-001", "user-1"), t0(), t0()).unwrap();
        let err = store
            .create(&sample_event("conv-001", "user-2"), t0(), t0())
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(id) if id == "conv-001"));
    }

    #[test]
    fn test_fetch_due_orders_and_bounds() {
        let (_dir, db) = temp_db();
        let conn = db.connect().unwrap();
        let store = EventStore::new(&conn);

        store
            .create(&sample_event("conv-late", "u-1"), t0() + Duration::minutes(3), t0())
            .unwrap();
        store
            .create(&sample_event("conv-early", "u-1"), t0() + Duration::minutes(1), t0())
            .unwrap();
        store
            .create(&sample_event("conv-future", "u-1"), t0() + Duration::hours(1), t0())
            .unwrap();

        let now = t0() + Duration::minutes(5);
        let due = store.fetch_due(10, now).unwrap();
        let ids: Vec<_> = due.iter().map(|e| e.conversation_id.as_str()).collect();
        assert_eq!(ids, vec!["conv-early", "conv-late"]);

        let bounded = store.fetch_due(1, now).unwrap();
        assert_eq!(bounded.len(), 1);
        assert_eq!(bounded[0].conversation_id, "conv-early");
        assert_eq!(store.fetch_due_ids(10, now).unwrap(), vec!["conv-early", "conv-late"]);
    }

    #[test]
    fn test_failed_retry_is_exactly_six_hours() {
        let (_dir, db) = temp_db();
        let conn = db.connect().unwrap();
        let store = EventStore::new(&conn);
        store.create(&sample_event("conv-001", "u-1"), t0(), t0()).unwrap();

        let (id, attempt) = claim_token(store.mark_processing("conv-001", t0(), lease()).unwrap());
        let retry_at = store
            .mark_failed(id, attempt, "UNEXPECTED_ERROR", "boom", t0())
            .unwrap()
            .unwrap();
        assert_eq!(retry_at, t0() + Duration::hours(6));

        let event = store.get("conv-001").unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Failed);
        assert_eq!(event.next_attempt_at, t0() + Duration::hours(6));
        assert_eq!(event.error_code.as_deref(), Some("UNEXPECTED_ERROR"));

        let just_before = t0() + Duration::hours(6) - Duration::seconds(1);
        assert!(store.fetch_due(10, just_before).unwrap().is_empty());
        assert_eq!(store.fetch_due(10, t0() + Duration::hours(6)).unwrap().len(), 1);
        assert_eq!(store.fetch_due(10, t0() + Duration::hours(7)).unwrap().len(), 1);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            delay: Duration::hours(6),
            jitter: Duration::minutes(10),
            max_attempts: 3,
        };
        for _ in 0..50 {
            let at = policy.retry_at(t0());
            assert!(at >= t0() + Duration::hours(6));
            assert!(at <= t0() + Duration::hours(6) + Duration::minutes(10));
        }
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
    }

    #[test]
    fn test_second_claim_observes_first() {
        let (_dir, db) = temp_db();
        let conn = db.connect().unwrap();
        let store = EventStore::new(&conn);
        store.create(&sample_event("conv-001", "u-1"), t0(), t0()).unwrap();

        let (_, attempt) = claim_token(store.mark_processing("conv-001", t0(), lease()).unwrap());
        assert_eq!(attempt, 1);

        match store.mark_processing("conv-001", t0(), lease()).unwrap() {
            Some(Claim::Rejected(event)) => {
                assert_eq!(event.status, EventStatus::Processing);
                assert_eq!(event.attempt_count, 1);
            }
            other => panic!("expected rejected claim, got {:?}", other),
        }
        assert!(store.mark_processing("conv-404", t0(), lease()).unwrap().is_none());
    }

    #[test]
    fn test_concurrent_claims_have_one_winner() {
        let (_dir, db) = temp_db();
        {
            let conn = db.connect().unwrap();
            EventStore::new(&conn)
                .create(&sample_event("conv-race", "u-1"), t0(), t0())
                .unwrap();
        }

        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let db = db.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    let conn = db.connect().unwrap();
                    barrier.wait();
                    let claim = EventStore::new(&conn)
                        .mark_processing("conv-race", t0(), Duration::minutes(15))
                        .unwrap();
                    matches!(claim, Some(Claim::Acquired(_)))
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);

        let conn = db.connect().unwrap();
        let event = EventStore::new(&conn).get("conv-race").unwrap().unwrap();
        assert_eq!(event.attempt_count, 1);
        assert_eq!(event.status, EventStatus::Processing);
    }

    #[test]
    fn test_failed_event_claimable_only_when_due() {
        let (_dir, db) = temp_db();
        let conn = db.connect().unwrap();
        let store = EventStore::new(&conn);
        store.create(&sample_event("conv-001", "u-1"), t0(), t0()).unwrap();

        let (id, attempt) = claim_token(store.mark_processing("conv-001", t0(), lease()).unwrap());
        store.mark_failed(id, attempt, "X", "y", t0()).unwrap();

        let early = t0() + Duration::hours(1);
        assert!(matches!(
            store.mark_processing("conv-001", early, lease()).unwrap(),
            Some(Claim::Rejected(_))
        ));

        let due = t0() + Duration::hours(6);
        let (_, attempt) = claim_token(store.mark_processing("conv-001", due, lease()).unwrap());
        assert_eq!(attempt, 2);
    }

    #[test]
    fn test_stale_attempt_cannot_finalize() {
        let (_dir, db) = temp_db();
        let conn = db.connect().unwrap();
        let store = EventStore::new(&conn);
        store.create(&sample_event("conv-001", "u-1"), t0(), t0()).unwrap();

        let (id, first) = claim_token(store.mark_processing("conv-001", t0(), lease()).unwrap());
        // Lease expires, another worker re-claims
        let later = t0() + Duration::minutes(20);
        assert_eq!(store.recover_stale_claims(later).unwrap(), 1);
        let (_, second) = claim_token(store.mark_processing("conv-001", later, lease()).unwrap());
        assert_eq!(second, first + 1);

        let details = ScoreBreakdown::default();
        assert!(!store
            .mark_processed(id, first, 1.0, FriendshipLevel::Stranger, &details, later)
            .unwrap());
        assert!(store.mark_failed(id, first, "X", "y", later).unwrap().is_none());
        assert!(store
            .mark_processed(id, second, 1.0, FriendshipLevel::Stranger, &details, later)
            .unwrap());

        let event = store.get("conv-001").unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Processed);
        assert_eq!(event.processed_at, Some(later));
        assert!(event.error_code.is_none());
    }

    #[test]
    fn test_unreadable_requires_claim_token() {
        let (_dir, db) = temp_db();
        let conn = db.connect().unwrap();
        let store = EventStore::new(&conn);
        store.create(&sample_event("conv-001", "user-001"), t0(), t0()).unwrap();
        conn.execute(
            "UPDATE conversation_events SET signals = '{broken' WHERE conversation_id = 'conv-001'",
            [],
        )
        .unwrap();

        let Some(Claim::Unreadable { id, attempt, reason }) =
            store.mark_processing("conv-001", t0(), lease()).unwrap()
        else {
            panic!("expected unreadable claim");
        };
        assert_eq!(attempt, 1);
        assert!(reason.contains("conv-001"));

        // A caller holding an older token cannot skip the live claim
        assert!(!store.mark_unreadable(id, attempt - 1, "stale", t0()).unwrap());
        assert!(store.mark_unreadable(id, attempt, "corrupt", t0()).unwrap());
        assert!(!store.mark_unreadable(id, attempt, "again", t0()).unwrap());
    }

    #[test]
    fn test_recover_ignores_live_claims() {
        let (_dir, db) = temp_db();
        let conn = db.connect().unwrap();
        let store = EventStore::new(&conn);
        store.create(&sample_event("conv-001", "u-1"), t0(), t0()).unwrap();
        store.mark_processing("conv-001", t0(), lease()).unwrap();

        assert_eq!(store.recover_stale_claims(t0() + Duration::minutes(5)).unwrap(), 0);
        let recovered_at = t0() + Duration::minutes(15);
        assert_eq!(store.recover_stale_claims(recovered_at).unwrap(), 1);

        let event = store.get("conv-001").unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Failed);
        assert_eq!(event.error_code.as_deref(), Some("CLAIM_EXPIRED"));
        assert_eq!(event.next_attempt_at, recovered_at);
    }

    #[test]
    fn test_make_due_and_counts() {
        let (_dir, db) = temp_db();
        let conn = db.connect().unwrap();
        let store = EventStore::new(&conn);
        store
            .create(&sample_event("conv-001", "u-1"), t0() + Duration::hours(1), t0())
            .unwrap();
        store
            .create(&sample_event("conv-002", "u-1"), t0() + Duration::hours(1), t0())
            .unwrap();

        assert!(store.fetch_due(10, t0()).unwrap().is_empty());
        assert!(store.make_due("conv-001", t0()).unwrap());
        assert_eq!(store.fetch_due(10, t0()).unwrap().len(), 1);

        let (id, attempt) = claim_token(store.mark_processing("conv-002", t0(), lease()).unwrap());
        store.mark_skipped(id, attempt, "RETRY_LIMIT_EXCEEDED", "gave up", t0()).unwrap();
        assert!(!store.make_due("conv-002", t0()).unwrap());

        let counts = store.counts().unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.skipped, 1);
        assert_eq!(store.list(Some(EventStatus::Skipped), 10).unwrap().len(), 1);
        assert_eq!(store.list(None, 10).unwrap().len(), 2);
    }
}
