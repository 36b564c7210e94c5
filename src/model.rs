//! Domain types shared by ingestion, scoring and the store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

// ============================================
// CONVERSATION CONTENT
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    #[serde(alias = "pika", alias = "bot", alias = "PIKA", alias = "BOT", alias = "COMPANION")]
    Companion,
    #[serde(alias = "USER")]
    User,
}

impl Speaker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Speaker::Companion => "companion",
            Speaker::User => "user",
        }
    }
}

/// One message of a conversation log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub speaker: Speaker,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<u32>,
}

impl Turn {
    pub fn new(speaker: Speaker, text: impl Into<String>) -> Self {
        Self {
            speaker,
            text: text.into(),
            timestamp: None,
            turn_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Emotion {
    Interesting,
    Boring,
    #[default]
    Neutral,
    Angry,
    Happy,
    Sad,
}

impl Emotion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Emotion::Interesting => "interesting",
            Emotion::Boring => "boring",
            Emotion::Neutral => "neutral",
            Emotion::Angry => "angry",
            Emotion::Happy => "happy",
            Emotion::Sad => "sad",
        }
    }

    /// Case-insensitive; anything unrecognised is neutral
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "interesting" => Emotion::Interesting,
            "boring" => Emotion::Boring,
            "angry" => Emotion::Angry,
            "happy" => Emotion::Happy,
            "sad" => Emotion::Sad,
            _ => Emotion::Neutral,
        }
    }
}

impl From<String> for Emotion {
    fn from(value: String) -> Self {
        Emotion::parse_lenient(&value)
    }
}

impl From<Emotion> for String {
    fn from(value: Emotion) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content-analysis signals; `None` means the signal is absent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SideSignals {
    #[serde(default)]
    pub user_initiated_questions: Option<u32>,
    #[serde(default)]
    pub session_emotion: Option<Emotion>,
    #[serde(default)]
    pub new_memories_count: Option<u32>,
}

impl SideSignals {
    /// Both emotion and question count carry non-default values
    pub fn is_complete(&self) -> bool {
        let emotion_known = matches!(self.session_emotion, Some(e) if e != Emotion::Neutral);
        let questions_known = matches!(self.user_initiated_questions, Some(q) if q > 0);
        emotion_known && questions_known
    }
}

// ============================================
// EVENTS
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Pending,
    Processing,
    Processed,
    Failed,
    Skipped,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "PENDING",
            EventStatus::Processing => "PROCESSING",
            EventStatus::Processed => "PROCESSED",
            EventStatus::Failed => "FAILED",
            EventStatus::Skipped => "SKIPPED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Processed | EventStatus::Skipped)
    }
}

impl FromStr for EventStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(EventStatus::Pending),
            "PROCESSING" => Ok(EventStatus::Processing),
            "PROCESSED" => Ok(EventStatus::Processed),
            "FAILED" => Ok(EventStatus::Failed),
            "SKIPPED" => Ok(EventStatus::Skipped),
            other => Err(Error::Validation(format!("unknown event status '{}'", other))),
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated event ready to be persisted
#[derive(Debug, Clone)]
pub struct NewConversationEvent {
    pub conversation_id: String,
    pub user_id: String,
    pub bot_type: String,
    pub bot_id: String,
    pub bot_name: String,
    pub agent_tag: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub conversation_log: Vec<Turn>,
    pub raw_conversation_log: Option<serde_json::Value>,
    pub signals: SideSignals,
}

impl NewConversationEvent {
    pub fn duration_seconds(&self) -> i64 {
        (self.end_time - self.start_time).num_seconds()
    }
}

/// Persisted conversation event and its processing state
#[derive(Debug, Clone, Serialize)]
pub struct ConversationEvent {
    pub id: i64,
    pub conversation_id: String,
    pub user_id: String,
    pub bot_type: String,
    pub bot_id: String,
    pub bot_name: String,
    pub agent_tag: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_seconds: i64,
    pub conversation_log: Vec<Turn>,
    pub raw_conversation_log: Option<serde_json::Value>,
    pub signals: SideSignals,
    pub status: EventStatus,
    pub attempt_count: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error_code: Option<String>,
    pub error_details: Option<String>,
    pub friendship_score_change: Option<f64>,
    pub new_friendship_level: Option<FriendshipLevel>,
    pub score_calculation_details: Option<ScoreBreakdown>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-status event counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventCounts {
    pub pending: u64,
    pub processing: u64,
    pub processed: u64,
    pub failed: u64,
    pub skipped: u64,
}

// ============================================
// RELATIONSHIP STATE
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum FriendshipLevel {
    #[default]
    #[serde(rename = "PHASE1_STRANGER")]
    Stranger,
    #[serde(rename = "PHASE2_ACQUAINTANCE")]
    Acquaintance,
    #[serde(rename = "PHASE3_FRIEND")]
    Friend,
}

impl FriendshipLevel {
    pub const ACQUAINTANCE_THRESHOLD: f64 = 500.0;
    pub const FRIEND_THRESHOLD: f64 = 3000.0;

    pub fn from_score(score: f64) -> Self {
        if score >= Self::FRIEND_THRESHOLD {
            FriendshipLevel::Friend
        } else if score >= Self::ACQUAINTANCE_THRESHOLD {
            FriendshipLevel::Acquaintance
        } else {
            FriendshipLevel::Stranger
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FriendshipLevel::Stranger => "PHASE1_STRANGER",
            FriendshipLevel::Acquaintance => "PHASE2_ACQUAINTANCE",
            FriendshipLevel::Friend => "PHASE3_FRIEND",
        }
    }
}

impl FromStr for FriendshipLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PHASE1_STRANGER" | "L1" | "STRANGER" => Ok(FriendshipLevel::Stranger),
            "PHASE2_ACQUAINTANCE" | "L2" | "ACQUAINTANCE" => Ok(FriendshipLevel::Acquaintance),
            "PHASE3_FRIEND" | "L3" | "FRIEND" => Ok(FriendshipLevel::Friend),
            other => Err(Error::Validation(format!(
                "unknown friendship level '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for FriendshipLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accumulated relationship within one topic
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TopicMetric {
    pub score: f64,
    pub turns: u64,
    pub level: FriendshipLevel,
    pub last_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub agents_used: BTreeSet<String>,
}

pub type TopicMetrics = BTreeMap<String, TopicMetric>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FriendshipStatus {
    pub user_id: String,
    pub friendship_score: f64,
    pub friendship_level: FriendshipLevel,
    pub last_interaction_date: Option<DateTime<Utc>>,
    pub streak_day: u32,
    pub last_emotion: Option<Emotion>,
    pub last_followup_topic: Option<String>,
    pub topic_metrics: TopicMetrics,
    pub updated_at: DateTime<Utc>,
}

// ============================================
// SCORING OUTPUT
// ============================================

/// Audit record of one score computation
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub total_turns: u32,
    pub base_score: f64,
    pub user_initiated_questions: u32,
    pub engagement_bonus: f64,
    pub session_emotion: Emotion,
    pub emotion_bonus: f64,
    pub new_memories_count: u32,
    pub memory_bonus: f64,
    pub raw_total: f64,
    pub total_exchange_score: f64,
    pub analyzer_invoked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_id: Option<String>,
}

// ============================================
// QUEUE PAYLOAD
// ============================================

/// Notification that an event is ready; the store stays authoritative
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub conversation_id: String,
    pub user_id: String,
    pub bot_id: String,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueMessage {
    pub fn for_event(event: &ConversationEvent) -> Self {
        Self {
            conversation_id: event.conversation_id.clone(),
            user_id: event.user_id.clone(),
            bot_id: event.bot_id.clone(),
            enqueued_at: Utc::now(),
        }
    }
}
