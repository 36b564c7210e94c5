//! Requeue command implementation

use anyhow::Result;

use crate::config::Config;
use crate::store::Database;

pub fn run(config: &Config, db: Database, conversation_id: &str) -> Result<()> {
    let accepted = super::gateway(config, db).republish(conversation_id)?;
    if accepted.published {
        println!("Event '{}' is due now and was republished.", conversation_id);
    } else {
        println!(
            "Event '{}' is due now; the queue was unavailable, the sweep will pick it up.",
            conversation_id
        );
    }
    Ok(())
}
