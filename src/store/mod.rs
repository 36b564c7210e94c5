//! Relational store for conversation events and relationship state
//!
//! `Database` is a handle to the SQLite file; every worker opens its own
//! `Connection` through [`Database::connect`] and never shares it. The
//! accessors (`EventStore`, `FriendshipStateUpdater`, `TopicDirectory`)
//! borrow a connection, so they work the same on a plain connection and on
//! an open transaction.

mod events;
mod friendship;
mod schema;
mod topics;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

pub use events::{Claim, EventStore, RetryPolicy};
pub use friendship::{FriendshipStateUpdater, ScoreChange, TopicChange};
pub use schema::SCHEMA;
pub use topics::{AgentTopic, TopicDirectory};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct Database {
    path: PathBuf,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Self {
            path: path.to_path_buf(),
        };
        let conn = db.connect()?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(db)
    }

    /// Fresh connection for one worker
    pub fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path).map_err(|e| {
            Error::TransientInfra(format!("open {}: {}", self.path.display(), e))
        })?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }
}

/// Write transaction that takes the database lock up front
pub fn begin_immediate(conn: &Connection) -> Result<Transaction<'_>> {
    Ok(Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?)
}

// ============================================
// TIME ENCODING
// ============================================

pub fn fmt_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Unexpected(format!("bad timestamp '{}': {}", value, e)))
}

pub fn parse_opt_time(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_time).transpose()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_text_sorts_chronologically() {
        let a = test_support::t0();
        let b = a + chrono::Duration::milliseconds(1);
        let c = a + chrono::Duration::hours(6);
        assert!(fmt_time(&a) < fmt_time(&b));
        assert!(fmt_time(&b) < fmt_time(&c));
        assert_eq!(parse_time(&fmt_time(&a)).unwrap(), a);
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("rapport.db");
        let db = Database::open(&path).unwrap();
        assert!(path.exists());
        let conn = db.connect().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM conversation_events", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
