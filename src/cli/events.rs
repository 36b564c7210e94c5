//! Event inspection commands

use anyhow::Result;

use crate::model::EventStatus;
use crate::store::{Database, EventStore};

use super::{opt_time, short_time, truncate};

pub fn list(db: &Database, status: Option<String>, limit: usize) -> Result<()> {
    let status = status.map(|s| s.parse::<EventStatus>()).transpose()?;
    let conn = db.connect()?;
    let store = EventStore::new(&conn);
    let events = store.list(status, limit)?;

    if events.is_empty() {
        println!("No events found. Run 'rapport ingest' first.");
        return Ok(());
    }

    println!(
        "{:<12} {:<28} {:<14} {:<11} {:<8} {:<12} {}",
        "Created", "Conversation", "User", "Status", "Attempts", "Next", "Error"
    );
    println!("{}", "-".repeat(105));

    for event in events {
        let next = if event.status.is_terminal() {
            "-".to_string()
        } else {
            short_time(&event.next_attempt_at)
        };
        println!(
            "{:<12} {:<28} {:<14} {:<11} {:<8} {:<12} {}",
            short_time(&event.created_at),
            truncate(&event.conversation_id, 28),
            truncate(&event.user_id, 14),
            event.status.as_str(),
            event.attempt_count,
            next,
            event.error_code.as_deref().unwrap_or("-"),
        );
    }

    let counts = store.counts()?;
    println!(
        "\npending {} | processing {} | processed {} | failed {} | skipped {}",
        counts.pending, counts.processing, counts.processed, counts.failed, counts.skipped
    );
    Ok(())
}

pub fn show(db: &Database, conversation_id: &str) -> Result<()> {
    let conn = db.connect()?;
    let event = match EventStore::new(&conn).get(conversation_id)? {
        Some(e) => e,
        None => {
            println!("Event '{}' not found.", conversation_id);
            return Ok(());
        }
    };

    println!("\n{}", "=".repeat(80));
    println!("Conversation: {}", event.conversation_id);
    println!("User: {} | Bot: {} ({})", event.user_id, event.bot_id, event.bot_name);
    if let Some(tag) = &event.agent_tag {
        println!("Agent tag: {}", tag);
    }
    println!(
        "Session: {} -> {} ({}s, {} messages)",
        opt_time(Some(&event.start_time)),
        opt_time(Some(&event.end_time)),
        event.duration_seconds,
        event.conversation_log.len()
    );
    println!("{}", "=".repeat(80));

    println!("Status:       {}", event.status);
    println!("Attempts:     {}", event.attempt_count);
    println!("Next attempt: {}", opt_time(Some(&event.next_attempt_at)));
    println!("Processed at: {}", opt_time(event.processed_at.as_ref()));
    if let Some(code) = &event.error_code {
        println!(
            "Error:        {} {}",
            code,
            event.error_details.as_deref().unwrap_or("")
        );
    }

    if let Some(delta) = event.friendship_score_change {
        println!("Score change: +{:.1}", delta);
    }
    if let Some(level) = event.new_friendship_level {
        println!("Level after:  {}", level);
    }

    if let Some(b) = &event.score_calculation_details {
        println!("\nBreakdown:");
        println!("  turns {:>4}             -> {:>7.1}", b.total_turns, b.base_score);
        println!(
            "  questions {:>4}         -> {:>7.1}",
            b.user_initiated_questions, b.engagement_bonus
        );
        println!(
            "  emotion {:<12}    -> {:>7.1}",
            b.session_emotion.as_str(),
            b.emotion_bonus
        );
        println!("  memories {:>4}          -> {:>7.1}", b.new_memories_count, b.memory_bonus);
        println!("  total (raw {:.1})       -> {:>7.1}", b.raw_total, b.total_exchange_score);
        if let Some(topic) = &b.topic_id {
            println!("  topic: {}", topic);
        }
        if b.analyzer_invoked {
            println!("  (content analyzer consulted)");
        }
    }
    Ok(())
}
