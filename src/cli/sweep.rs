//! Sweep command implementation

use anyhow::Result;

use crate::config::Config;
use crate::scheduler::{FallbackScheduler, SchedulerSettings};
use crate::store::Database;

pub fn run(config: &Config, db: Database, batch: Option<usize>) -> Result<()> {
    let mut settings = SchedulerSettings::from_config(config);
    if let Some(batch) = batch {
        settings.batch_size = batch.max(1);
    }

    let scheduler = FallbackScheduler::new(super::processor(config, db), settings);
    let stats = scheduler.sweep()?;
    let summary = stats.summary;

    println!("Sweep complete (batch size {})", settings.batch_size);
    println!("  Recovered claims: {}", stats.recovered);
    println!("  Processed:        {}", summary.processed);
    println!("  Failed:           {}", summary.failed);
    println!("  Gave up:          {}", summary.gave_up);
    println!("  Skipped:          {}", summary.skipped);
    println!("  Missing:          {}", summary.missing);
    Ok(())
}
