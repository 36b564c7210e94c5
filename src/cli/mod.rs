//! Command implementations for the `rapport` binary

pub mod events;
pub mod ingest;
pub mod requeue;
pub mod serve;
pub mod status;
pub mod sweep;
pub mod topic;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::config::Config;
use crate::ingest::IngestionGateway;
use crate::pipeline::EventProcessor;
use crate::queue::SqliteBroker;
use crate::scoring::{HttpContentAnalyzer, ScoreEngine};
use crate::store::Database;

/// Processor wired with the configured analyzer, retry policy and lease
pub fn processor(config: &Config, db: Database) -> EventProcessor {
    let analyzer = HttpContentAnalyzer::from_config(&config.analysis);
    let engine = if analyzer.is_enabled() {
        ScoreEngine::new(Arc::new(analyzer))
    } else {
        ScoreEngine::default()
    };
    EventProcessor::new(db, engine)
        .with_retry(config.retry_policy())
        .with_claim_lease(config.claim_lease())
}

pub fn open_broker(config: &Config) -> Result<SqliteBroker> {
    let path = config.queue_path();
    SqliteBroker::open(&path, config.channel_timeout())
        .with_context(|| format!("failed to open queue broker at {}", path.display()))
}

/// Gateway publishing to the broker; without a broker events wait for the sweep
pub fn gateway(config: &Config, db: Database) -> IngestionGateway {
    let gateway = IngestionGateway::new(db, config.queue.name.clone())
        .with_initial_delay(config.ingest_delay());
    match open_broker(config) {
        Ok(broker) => gateway.with_transport(Arc::new(broker)),
        Err(e) => {
            tracing::warn!(error = %e, "queue broker unavailable, events will wait for the sweep");
            gateway
        }
    }
}

pub(crate) fn short_time(time: &DateTime<Utc>) -> String {
    time.format("%m-%d %H:%M").to_string()
}

pub(crate) fn opt_time(time: Option<&DateTime<Utc>>) -> String {
    time.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

pub(crate) fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let cut: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    } else {
        text.to_string()
    }
}
