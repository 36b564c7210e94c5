//! Agent topic mapping commands

use anyhow::Result;

use crate::model::FriendshipLevel;
use crate::store::{Database, TopicDirectory};

pub fn set(db: &Database, agent_id: &str, topic_id: &str, level: Option<String>) -> Result<()> {
    let level = level.map(|l| l.parse::<FriendshipLevel>()).transpose()?;
    let conn = db.connect()?;
    TopicDirectory::new(&conn).set(agent_id, level, topic_id)?;
    println!(
        "Agent '{}' maps to topic '{}' ({})",
        agent_id,
        topic_id,
        level.map(|l| l.as_str()).unwrap_or("any level")
    );
    Ok(())
}

pub fn remove(db: &Database, agent_id: &str, level: Option<String>) -> Result<()> {
    let level = level.map(|l| l.parse::<FriendshipLevel>()).transpose()?;
    let conn = db.connect()?;
    if TopicDirectory::new(&conn).remove(agent_id, level)? {
        println!("Mapping removed.");
    } else {
        println!("No mapping for agent '{}'.", agent_id);
    }
    Ok(())
}

pub fn list(db: &Database) -> Result<()> {
    let conn = db.connect()?;
    let topics = TopicDirectory::new(&conn).list()?;
    if topics.is_empty() {
        println!("No topic mappings. Add one with 'rapport topic set'.");
        return Ok(());
    }

    println!("{:<30} {:<22} {}", "Agent", "Level", "Topic");
    println!("{}", "-".repeat(75));
    for t in topics {
        println!(
            "{:<30} {:<22} {}",
            t.agent_id,
            t.friendship_level.map(|l| l.as_str()).unwrap_or("*"),
            t.topic_id
        );
    }
    Ok(())
}
