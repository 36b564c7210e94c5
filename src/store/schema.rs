//! SQLite schema definition
//!
//! Timestamps are RFC 3339 UTC text with fixed microsecond precision so that
//! lexical comparison in SQL matches chronological order.

pub const SCHEMA: &str = r#"
-- ============================================
-- CONVERSATION EVENTS
-- ============================================

-- One row per reported session, plus its processing state machine
CREATE TABLE IF NOT EXISTS conversation_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id TEXT NOT NULL UNIQUE,  -- Upstream id, immutable
    user_id TEXT NOT NULL,
    bot_type TEXT NOT NULL,
    bot_id TEXT NOT NULL,                  -- Companion agent id
    bot_name TEXT NOT NULL,
    agent_tag TEXT,                        -- Optional topic hint
    start_time TEXT NOT NULL,
    end_time TEXT NOT NULL,
    duration_seconds INTEGER NOT NULL,
    conversation_log TEXT NOT NULL,        -- JSON: [{speaker, text, timestamp, turn_id}]
    raw_conversation_log TEXT,             -- JSON: payload before normalisation
    signals TEXT,                          -- JSON: caller-supplied side signals

    status TEXT NOT NULL DEFAULT 'PENDING', -- PENDING | PROCESSING | PROCESSED | FAILED | SKIPPED
    attempt_count INTEGER NOT NULL DEFAULT 0,
    next_attempt_at TEXT NOT NULL,         -- Earliest re-pickup; claim lease while PROCESSING
    processed_at TEXT,
    error_code TEXT,
    error_details TEXT,

    friendship_score_change REAL,
    new_friendship_level TEXT,
    score_calculation_details TEXT,        -- JSON breakdown, replaced wholesale

    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- ============================================
-- RELATIONSHIP STATE
-- ============================================

CREATE TABLE IF NOT EXISTS friendship_status (
    user_id TEXT PRIMARY KEY,
    friendship_score REAL NOT NULL DEFAULT 0,
    friendship_level TEXT NOT NULL DEFAULT 'PHASE1_STRANGER', -- Derived from score
    last_interaction_date TEXT,
    streak_day INTEGER NOT NULL DEFAULT 0,
    last_emotion TEXT,
    last_followup_topic TEXT,
    topic_metrics TEXT NOT NULL DEFAULT '{}', -- JSON: {topic_id: {score, turns, level, last_date, agents_used}}
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Companion agent -> topic mapping used to route per-topic metrics
CREATE TABLE IF NOT EXISTS agent_topics (
    id INTEGER PRIMARY KEY,
    agent_id TEXT NOT NULL,
    friendship_level TEXT NOT NULL DEFAULT '', -- '' applies to every level
    topic_id TEXT NOT NULL,
    UNIQUE(agent_id, friendship_level)
);

-- ============================================
-- INDEXES
-- ============================================

CREATE INDEX IF NOT EXISTS idx_events_due ON conversation_events(status, next_attempt_at);
CREATE INDEX IF NOT EXISTS idx_events_user ON conversation_events(user_id);
CREATE INDEX IF NOT EXISTS idx_agent_topics_agent ON agent_topics(agent_id);
"#;
