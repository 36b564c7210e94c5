//! Status command implementation

use anyhow::Result;

use crate::store::{Database, FriendshipStateUpdater};

use super::{opt_time, truncate};

pub fn run(db: &Database, user_id: &str) -> Result<()> {
    let conn = db.connect()?;
    let status = match FriendshipStateUpdater::new(&conn).get_status(user_id)? {
        Some(s) => s,
        None => {
            println!("No relationship record for user '{}'.", user_id);
            return Ok(());
        }
    };

    println!("User:             {}", status.user_id);
    println!("Score:            {:.1}", status.friendship_score);
    println!("Level:            {}", status.friendship_level);
    println!("Streak:           {} day(s)", status.streak_day);
    println!(
        "Last interaction: {}",
        opt_time(status.last_interaction_date.as_ref())
    );
    println!(
        "Last emotion:     {}",
        status
            .last_emotion
            .map(|e| e.as_str())
            .unwrap_or("-")
    );
    if let Some(topic) = &status.last_followup_topic {
        println!("Follow-up topic:  {}", topic);
    }

    if status.topic_metrics.is_empty() {
        return Ok(());
    }

    println!(
        "\n{:<24} {:>8} {:>6} {:<20} {}",
        "Topic", "Score", "Turns", "Level", "Agents"
    );
    println!("{}", "-".repeat(85));
    for (topic_id, metric) in &status.topic_metrics {
        let agents: Vec<&str> = metric.agents_used.iter().map(String::as_str).collect();
        println!(
            "{:<24} {:>8.1} {:>6} {:<20} {}",
            truncate(topic_id, 24),
            metric.score,
            metric.turns,
            metric.level.as_str(),
            agents.join(", ")
        );
    }
    Ok(())
}
