//! SQLite-backed message broker
//!
//! Messages live in their own database file. A channel is a row in
//! `queue_channels`; delivering a message binds it to the channel under a
//! per-channel delivery tag. Closing a channel, explicitly or because its
//! heartbeat went stale, returns its unacked messages to the queue flagged
//! as redelivered.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

use super::{Channel, Delivery, QueueTransport};
use crate::error::{Error, Result};
use crate::store::{begin_immediate, fmt_time};

const BROKER_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS queues (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS queue_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    queue TEXT NOT NULL,
    body BLOB NOT NULL,
    state TEXT NOT NULL DEFAULT 'ready',   -- ready | unacked
    channel_id TEXT,                       -- Set while unacked
    delivery_tag INTEGER,                  -- Set while unacked
    redelivered INTEGER NOT NULL DEFAULT 0,
    delivery_count INTEGER NOT NULL DEFAULT 0,
    published_at TEXT NOT NULL,
    delivered_at TEXT,
    FOREIGN KEY(queue) REFERENCES queues(name)
);

CREATE TABLE IF NOT EXISTS queue_channels (
    id TEXT PRIMARY KEY,                   -- UUID
    queue TEXT NOT NULL,
    prefetch INTEGER NOT NULL,
    next_tag INTEGER NOT NULL DEFAULT 1,
    opened_at TEXT NOT NULL,
    heartbeat_at TEXT NOT NULL,
    closed_at TEXT,
    close_reason TEXT
);

CREATE INDEX IF NOT EXISTS idx_queue_messages_ready ON queue_messages(queue, state, id);
CREATE INDEX IF NOT EXISTS idx_queue_messages_channel ON queue_messages(channel_id, delivery_tag);
"#;

const BUSY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub ready: u64,
    pub unacked: u64,
}

#[derive(Debug, Clone)]
pub struct SqliteBroker {
    path: PathBuf,
    channel_timeout: Duration,
}

impl SqliteBroker {
    pub fn open(path: &Path, channel_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let broker = Self {
            path: path.to_path_buf(),
            channel_timeout,
        };
        let conn = broker.connect()?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch(BROKER_SCHEMA)?;
        Ok(broker)
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path).map_err(|e| {
            Error::TransientInfra(format!("broker {}: {}", self.path.display(), e))
        })?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    /// Close a channel from the broker side, as a dropped connection would
    pub fn close_channel(&self, channel_id: &str, reason: &str) -> Result<bool> {
        let conn = self.connect()?;
        let tx = begin_immediate(&conn)?;
        let closed = close_channel_in(&tx, channel_id, reason, Utc::now())?;
        tx.commit()?;
        Ok(closed)
    }

    /// Close channels whose heartbeat is older than the timeout
    pub fn reap_expired_channels(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.connect()?;
        let tx = begin_immediate(&conn)?;
        let reaped = reap_expired_in(&tx, now - self.channel_timeout, now)?;
        tx.commit()?;
        Ok(reaped)
    }

    pub fn depth(&self, queue: &str) -> Result<QueueDepth> {
        let conn = self.connect()?;
        let (ready, unacked): (i64, i64) = conn.query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN state = 'ready' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN state = 'unacked' THEN 1 ELSE 0 END), 0)
             FROM queue_messages WHERE queue = ?",
            params![queue],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(QueueDepth {
            ready: u64::try_from(ready).unwrap_or(0),
            unacked: u64::try_from(unacked).unwrap_or(0),
        })
    }

    pub fn is_channel_open(&self, channel_id: &str) -> Result<bool> {
        let conn = self.connect()?;
        channel_open_in(&conn, channel_id)
    }
}

impl QueueTransport for SqliteBroker {
    fn declare(&self, queue: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT OR IGNORE INTO queues (name, created_at) VALUES (?1, ?2)",
            params![queue, fmt_time(&Utc::now())],
        )?;
        Ok(())
    }

    fn publish(&self, queue: &str, body: &[u8]) -> Result<()> {
        let conn = self.connect()?;
        let declared = conn
            .query_row("SELECT 1 FROM queues WHERE name = ?", params![queue], |_| Ok(()))
            .optional()?;
        if declared.is_none() {
            return Err(Error::NotFound(format!("queue '{}' is not declared", queue)));
        }
        conn.execute(
            "INSERT INTO queue_messages (queue, body, published_at) VALUES (?1, ?2, ?3)",
            params![queue, body, fmt_time(&Utc::now())],
        )?;
        Ok(())
    }

    fn open_channel(&self, queue: &str, prefetch: usize) -> Result<Box<dyn Channel>> {
        Ok(Box::new(SqliteChannel::open(self, queue, prefetch)?))
    }
}

// ============================================
// CHANNEL
// ============================================

pub struct SqliteChannel {
    conn: Connection,
    id: String,
    queue: String,
    prefetch: i64,
    channel_timeout: Duration,
}

impl SqliteChannel {
    fn open(broker: &SqliteBroker, queue: &str, prefetch: usize) -> Result<Self> {
        let conn = broker.connect()?;
        let id = uuid::Uuid::new_v4().to_string();
        let now = fmt_time(&Utc::now());
        conn.execute(
            "INSERT INTO queue_channels (id, queue, prefetch, opened_at, heartbeat_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![id, queue, i64::try_from(prefetch.max(1)).unwrap_or(i64::MAX), now],
        )?;
        tracing::debug!(channel_id = %id, queue, prefetch, "channel opened");
        Ok(Self {
            conn,
            id,
            queue: queue.to_string(),
            prefetch: i64::try_from(prefetch.max(1)).unwrap_or(i64::MAX),
            channel_timeout: broker.channel_timeout,
        })
    }

    fn ensure_open(&self, conn: &Connection) -> Result<()> {
        if channel_open_in(conn, &self.id)? {
            Ok(())
        } else {
            Err(Error::ChannelClosed(self.id.clone()))
        }
    }

    /// Settle one delivery. `requeue = None` acks, `Some(_)` nacks.
    fn settle(&mut self, tag: u64, requeue: Option<bool>) -> Result<()> {
        let tag_i = i64::try_from(tag).unwrap_or(i64::MAX);
        let now = Utc::now();
        let tx = begin_immediate(&self.conn)?;
        self.ensure_open(&tx)?;

        let changed = match requeue {
            None | Some(false) => tx.execute(
                "DELETE FROM queue_messages
                 WHERE channel_id = ?1 AND delivery_tag = ?2 AND state = 'unacked'",
                params![self.id, tag_i],
            )?,
            Some(true) => tx.execute(
                "UPDATE queue_messages
                 SET state = 'ready', channel_id = NULL, delivery_tag = NULL, redelivered = 1
                 WHERE channel_id = ?1 AND delivery_tag = ?2 AND state = 'unacked'",
                params![self.id, tag_i],
            )?,
        };

        if changed == 0 {
            // Unknown tag is a protocol error that kills the channel
            close_channel_in(&tx, &self.id, "unknown delivery tag", now)?;
            tx.commit()?;
            return Err(Error::ChannelClosed(format!(
                "{}: unknown delivery tag {}",
                self.id, tag
            )));
        }

        touch(&tx, &self.id, now)?;
        tx.commit()?;
        Ok(())
    }
}

impl Channel for SqliteChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn poll(&mut self) -> Result<Option<Delivery>> {
        let now = Utc::now();
        let tx = begin_immediate(&self.conn)?;
        reap_expired_in(&tx, now - self.channel_timeout, now)?;
        self.ensure_open(&tx)?;
        touch(&tx, &self.id, now)?;

        let in_flight: i64 = tx.query_row(
            "SELECT COUNT(*) FROM queue_messages WHERE channel_id = ?1 AND state = 'unacked'",
            params![self.id],
            |row| row.get(0),
        )?;
        if in_flight >= self.prefetch {
            tx.commit()?;
            return Ok(None);
        }

        let next: Option<(i64, Vec<u8>, bool)> = tx
            .query_row(
                "SELECT id, body, redelivered FROM queue_messages
                 WHERE queue = ?1 AND state = 'ready'
                 ORDER BY id ASC LIMIT 1",
                params![self.queue],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((message_id, body, redelivered)) = next else {
            tx.commit()?;
            return Ok(None);
        };

        let tag: i64 = tx.query_row(
            "UPDATE queue_channels SET next_tag = next_tag + 1 WHERE id = ?1
             RETURNING next_tag - 1",
            params![self.id],
            |row| row.get(0),
        )?;
        tx.execute(
            "UPDATE queue_messages
             SET state = 'unacked', channel_id = ?1, delivery_tag = ?2,
                 delivery_count = delivery_count + 1, delivered_at = ?3
             WHERE id = ?4",
            params![self.id, tag, fmt_time(&now), message_id],
        )?;
        tx.commit()?;

        Ok(Some(Delivery {
            tag: u64::try_from(tag).unwrap_or(0),
            redelivered,
            body,
        }))
    }

    fn ack(&mut self, tag: u64) -> Result<()> {
        self.settle(tag, None)
    }

    fn nack(&mut self, tag: u64, requeue: bool) -> Result<()> {
        self.settle(tag, Some(requeue))
    }

    fn heartbeat(&mut self) -> Result<()> {
        let now = Utc::now();
        let tx = begin_immediate(&self.conn)?;
        reap_expired_in(&tx, now - self.channel_timeout, now)?;
        self.ensure_open(&tx)?;
        touch(&tx, &self.id, now)?;
        tx.commit()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let tx = begin_immediate(&self.conn)?;
        close_channel_in(&tx, &self.id, "closed by client", Utc::now())?;
        tx.commit()?;
        Ok(())
    }
}

// ============================================
// SHARED STATEMENTS
// ============================================

fn channel_open_in(conn: &Connection, channel_id: &str) -> Result<bool> {
    let closed: Option<Option<String>> = conn
        .query_row(
            "SELECT closed_at FROM queue_channels WHERE id = ?",
            params![channel_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(matches!(closed, Some(None)))
}

fn touch(conn: &Connection, channel_id: &str, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE queue_channels SET heartbeat_at = ?1 WHERE id = ?2",
        params![fmt_time(&now), channel_id],
    )?;
    Ok(())
}

/// Mark closed and return its unacked messages to the queue
fn close_channel_in(
    conn: &Connection,
    channel_id: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE queue_channels SET closed_at = ?1, close_reason = ?2
         WHERE id = ?3 AND closed_at IS NULL",
        params![fmt_time(&now), reason, channel_id],
    )?;
    let requeued = conn.execute(
        "UPDATE queue_messages
         SET state = 'ready', channel_id = NULL, delivery_tag = NULL, redelivered = 1
         WHERE channel_id = ?1 AND state = 'unacked'",
        params![channel_id],
    )?;
    if changed > 0 {
        tracing::warn!(channel_id, reason, requeued, "channel closed");
    }
    Ok(changed > 0)
}

fn reap_expired_in(conn: &Connection, stale_before: DateTime<Utc>, now: DateTime<Utc>) -> Result<usize> {
    let mut stmt = conn.prepare(
        "SELECT id FROM queue_channels WHERE closed_at IS NULL AND heartbeat_at < ?1",
    )?;
    let expired = stmt
        .query_map(params![fmt_time(&stale_before)], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for channel_id in &expired {
        close_channel_in(conn, channel_id, "heartbeat timeout", now)?;
    }
    Ok(expired.len())
}
