//! Fallback sweep over the event store
//!
//! Independent of the queue: every tick returns expired claims to FAILED,
//! then drives due events through the same [`EventProcessor`] the consumer
//! uses. Errors are logged and the loop keeps going.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::pipeline::{EventProcessor, EventSource, ReportSummary};

#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    pub interval: Duration,
    pub batch_size: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            batch_size: 20,
        }
    }
}

impl SchedulerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: Duration::from_secs(config.scheduler.interval_secs.max(1)),
            batch_size: config.scheduler.batch_size.max(1),
        }
    }
}

/// Result of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    pub recovered: usize,
    pub summary: ReportSummary,
}

pub struct FallbackScheduler {
    processor: EventProcessor,
    settings: SchedulerSettings,
}

impl FallbackScheduler {
    pub fn new(processor: EventProcessor, settings: SchedulerSettings) -> Self {
        Self {
            processor,
            settings,
        }
    }

    /// One pass: recover stale claims, then process a batch of due events
    pub fn sweep(&self) -> Result<SweepStats> {
        let recovered = self.processor.recover_stale_claims()?;
        if recovered > 0 {
            tracing::warn!(recovered, "returned expired claims to FAILED");
        }

        let report = self.processor.run(EventSource::Due {
            batch_size: self.settings.batch_size,
        })?;
        Ok(SweepStats {
            recovered,
            summary: report.summary(),
        })
    }

    /// Tick until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            interval_secs = self.settings.interval.as_secs(),
            batch_size = self.settings.batch_size,
            "fallback scheduler starting"
        );

        let scheduler = std::sync::Arc::new(self);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let sweeper = std::sync::Arc::clone(&scheduler);
            let result = tokio::task::spawn_blocking(move || sweeper.sweep())
                .await
                .map_err(|e| Error::Unexpected(format!("sweep task join error: {}", e)))
                .and_then(|r| r);

            match result {
                Ok(stats) if stats.summary == ReportSummary::default() => {
                    tracing::trace!("sweep found nothing due");
                }
                Ok(stats) => {
                    tracing::info!(
                        processed = stats.summary.processed,
                        failed = stats.summary.failed,
                        gave_up = stats.summary.gave_up,
                        skipped = stats.summary.skipped,
                        "fallback sweep finished"
                    );
                }
                Err(e) => {
                    tracing::error!(error = %e, code = e.code(), "fallback sweep failed");
                }
            }
        }

        tracing::info!("fallback scheduler stopped");
    }
}
