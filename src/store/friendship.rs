//! Relationship state mutations
//!
//! Every change to `friendship_status` goes through [`FriendshipStateUpdater::apply`]:
//! load-or-create, add the delta, recompute the level, rewrite topic metrics
//! as a fresh map. Callers that do not already hold a transaction use the
//! `apply_score_change` / `update_topic_metrics` entry points, which wrap the
//! read-modify-write in an IMMEDIATE transaction.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{begin_immediate, fmt_time, parse_opt_time, parse_time};
use crate::error::{Error, Result};
use crate::model::{Emotion, FriendshipLevel, FriendshipStatus, TopicMetric, TopicMetrics};

const TOPIC_ACQUAINTANCE_SCORE: f64 = 50.0;
const TOPIC_FRIEND_SCORE: f64 = 150.0;

/// Per-topic part of a score change
#[derive(Debug, Clone, PartialEq)]
pub struct TopicChange {
    pub topic_id: String,
    pub agent_used: String,
    pub turns: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreChange {
    pub delta: f64,
    pub topic: Option<TopicChange>,
    pub emotion: Option<Emotion>,
    pub at: DateTime<Utc>,
}

impl ScoreChange {
    pub fn plain(delta: f64, at: DateTime<Utc>) -> Self {
        Self {
            delta,
            topic: None,
            emotion: None,
            at,
        }
    }
}

pub struct FriendshipStateUpdater<'c> {
    conn: &'c Connection,
}

impl<'c> FriendshipStateUpdater<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn get_status(&self, user_id: &str) -> Result<Option<FriendshipStatus>> {
        let row = self
            .conn
            .query_row(
                "SELECT user_id, friendship_score, friendship_level, last_interaction_date,
                        streak_day, last_emotion, last_followup_topic, topic_metrics, updated_at
                 FROM friendship_status WHERE user_id = ?",
                params![user_id],
                StatusRow::from_row,
            )
            .optional()?;
        row.map(StatusRow::into_status).transpose()
    }

    /// Add `delta` to the user's score and commit
    pub fn apply_score_change(&self, user_id: &str, delta: f64) -> Result<FriendshipStatus> {
        self.apply_committed(user_id, &ScoreChange::plain(delta, Utc::now()))
    }

    /// Same as [`apply_score_change`](Self::apply_score_change) plus the topic's metrics
    pub fn update_topic_metrics(
        &self,
        user_id: &str,
        topic_id: &str,
        delta: f64,
        agent_used: &str,
        turns_delta: u64,
    ) -> Result<FriendshipStatus> {
        let change = ScoreChange {
            delta,
            topic: Some(TopicChange {
                topic_id: topic_id.to_string(),
                agent_used: agent_used.to_string(),
                turns: turns_delta,
            }),
            emotion: None,
            at: Utc::now(),
        };
        self.apply_committed(user_id, &change)
    }

    /// Run [`apply`](Self::apply) in its own IMMEDIATE transaction
    pub fn apply_committed(&self, user_id: &str, change: &ScoreChange) -> Result<FriendshipStatus> {
        let tx = begin_immediate(self.conn)?;
        let status = FriendshipStateUpdater::new(&tx).apply(user_id, change)?;
        tx.commit()?;
        Ok(status)
    }

    /// Apply a score change. The caller must hold a write transaction on the
    /// connection; nothing is committed here.
    pub fn apply(&self, user_id: &str, change: &ScoreChange) -> Result<FriendshipStatus> {
        if !change.delta.is_finite() {
            return Err(Error::Validation(format!(
                "score delta for {} is not finite",
                user_id
            )));
        }

        let at_s = fmt_time(&change.at);
        self.conn.execute(
            "INSERT OR IGNORE INTO friendship_status (user_id, created_at, updated_at)
             VALUES (?1, ?2, ?2)",
            params![user_id, at_s],
        )?;
        let current = self
            .get_status(user_id)?
            .ok_or_else(|| Error::Unexpected(format!("status row for {} missing", user_id)))?;

        let next = next_status(current, change);

        self.conn.execute(
            "UPDATE friendship_status
             SET friendship_score = ?1,
                 friendship_level = ?2,
                 last_interaction_date = ?3,
                 streak_day = ?4,
                 last_emotion = ?5,
                 topic_metrics = ?6,
                 updated_at = ?7
             WHERE user_id = ?8",
            params![
                next.friendship_score,
                next.friendship_level.as_str(),
                next.last_interaction_date.as_ref().map(fmt_time),
                next.streak_day,
                next.last_emotion.map(|e| e.as_str()),
                serde_json::to_string(&next.topic_metrics)?,
                fmt_time(&next.updated_at),
                user_id,
            ],
        )?;
        Ok(next)
    }
}

// ============================================
// PURE STATE TRANSITION
// ============================================

fn next_status(current: FriendshipStatus, change: &ScoreChange) -> FriendshipStatus {
    let friendship_score = (current.friendship_score + change.delta).max(0.0);
    let friendship_level = FriendshipLevel::from_score(friendship_score);

    let (streak_day, last_interaction_date) = next_streak(&current, change.at);

    let topic_metrics = match &change.topic {
        Some(topic) => with_topic_update(&current.topic_metrics, topic, change, friendship_level),
        None => current.topic_metrics.clone(),
    };

    FriendshipStatus {
        user_id: current.user_id,
        friendship_score,
        friendship_level,
        last_interaction_date,
        streak_day,
        last_emotion: change.emotion.or(current.last_emotion),
        last_followup_topic: current.last_followup_topic,
        topic_metrics,
        updated_at: change.at,
    }
}

/// Consecutive UTC days with at least one interaction
fn next_streak(current: &FriendshipStatus, at: DateTime<Utc>) -> (u32, Option<DateTime<Utc>>) {
    let Some(last) = current.last_interaction_date else {
        return (1, Some(at));
    };
    let (last_day, day) = (last.date_naive(), at.date_naive());
    if day < last_day {
        // Late event for an earlier day
        return (current.streak_day.max(1), Some(last));
    }
    let streak = match (day - last_day).num_days() {
        0 => current.streak_day.max(1),
        1 => current.streak_day.saturating_add(1),
        _ => 1,
    };
    (streak, Some(at.max(last)))
}

/// Build a new metrics map with one topic updated
fn with_topic_update(
    metrics: &TopicMetrics,
    topic: &TopicChange,
    change: &ScoreChange,
    user_level: FriendshipLevel,
) -> TopicMetrics {
    let mut next = metrics.clone();
    let previous = metrics.get(&topic.topic_id).cloned().unwrap_or_default();

    let score = (previous.score + change.delta).max(0.0);
    let mut agents_used = previous.agents_used;
    agents_used.insert(topic.agent_used.clone());

    next.insert(
        topic.topic_id.clone(),
        TopicMetric {
            score,
            turns: previous.turns.saturating_add(topic.turns),
            level: topic_level(previous.level, score, user_level),
            last_date: Some(change.at),
            agents_used,
        },
    );
    next
}

/// Topic level ratchet gated by the user's overall level
pub(crate) fn topic_level(
    current: FriendshipLevel,
    topic_score: f64,
    user_level: FriendshipLevel,
) -> FriendshipLevel {
    if topic_score >= TOPIC_FRIEND_SCORE && user_level >= FriendshipLevel::Friend {
        FriendshipLevel::Friend
    } else if current == FriendshipLevel::Friend {
        FriendshipLevel::Friend
    } else if topic_score >= TOPIC_ACQUAINTANCE_SCORE && user_level >= FriendshipLevel::Acquaintance
    {
        FriendshipLevel::Acquaintance
    } else if topic_score < TOPIC_ACQUAINTANCE_SCORE {
        FriendshipLevel::Stranger
    } else {
        current
    }
}

// ============================================
// ROW TYPES
// ============================================

struct StatusRow {
    user_id: String,
    friendship_score: f64,
    friendship_level: String,
    last_interaction_date: Option<String>,
    streak_day: u32,
    last_emotion: Option<String>,
    last_followup_topic: Option<String>,
    topic_metrics: String,
    updated_at: String,
}

impl StatusRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            user_id: row.get(0)?,
            friendship_score: row.get(1)?,
            friendship_level: row.get(2)?,
            last_interaction_date: row.get(3)?,
            streak_day: row.get(4)?,
            last_emotion: row.get(5)?,
            last_followup_topic: row.get(6)?,
            topic_metrics: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn into_status(self) -> Result<FriendshipStatus> {
        let stored_level: FriendshipLevel = self.friendship_level.parse()?;
        let derived = FriendshipLevel::from_score(self.friendship_score);
        if stored_level != derived {
            tracing::warn!(
                user_id = %self.user_id,
                stored = %stored_level,
                derived = %derived,
                "stored friendship level disagrees with score, using derived level"
            );
        }
        Ok(FriendshipStatus {
            friendship_score: self.friendship_score,
            friendship_level: derived,
            last_interaction_date: parse_opt_time(self.last_interaction_date)?,
            streak_day: self.streak_day,
            last_emotion: self.last_emotion.as_deref().map(Emotion::parse_lenient),
            last_followup_topic: self.last_followup_topic,
            topic_metrics: serde_json::from_str(&self.topic_metrics)?,
            updated_at: parse_time(&self.updated_at)?,
            user_id: self.user_id,
        })
    }
}
