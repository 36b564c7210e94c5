//! Ingest command implementation

use anyhow::{Context, Result};
use std::io::Read;

use crate::config::Config;
use crate::store::Database;

use super::opt_time;

pub fn run(config: &Config, db: Database, source: &str) -> Result<()> {
    let body = if source == "-" {
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .context("failed to read payload from stdin")?;
        buf
    } else {
        std::fs::read(source).with_context(|| format!("failed to read {}", source))?
    };

    let accepted = super::gateway(config, db).ingest_json(&body)?;
    let event = &accepted.event;

    println!("Accepted conversation '{}'", event.conversation_id);
    println!("  User:          {}", event.user_id);
    println!("  Bot:           {} ({})", event.bot_id, event.bot_type);
    println!("  Duration:      {}s", event.duration_seconds);
    println!("  Messages:      {}", event.conversation_log.len());
    println!("  Status:        {}", event.status);
    println!("  Next attempt:  {}", opt_time(Some(&event.next_attempt_at)));
    println!(
        "  Queue:         {}",
        if accepted.published {
            "published"
        } else {
            "not published, left to the fallback sweep"
        }
    );
    Ok(())
}
