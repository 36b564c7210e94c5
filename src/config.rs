//! Configuration management with YAML support

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::store::RetryPolicy;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub consumer: ConsumerConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub analysis: AnalysisConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: String,
}

/// Durable queue (broker file) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_path")]
    pub path: String,

    #[serde(default = "default_queue_name")]
    pub name: String,

    /// Health-check cadence for the consumer's channel
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Channels silent for longer than this are closed by the broker
    #[serde(default = "default_channel_timeout_secs")]
    pub channel_timeout_secs: u64,

    /// Delay between polls when the queue is empty
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Pool size; also the channel prefetch
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Consecutive failed reconnects before giving up
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Hard per-event deadline; 0 disables
    #[serde(default = "default_event_deadline_secs")]
    pub event_deadline_secs: u64,
}

/// Fallback sweep configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How long a claim may stay PROCESSING before it is recovered
    #[serde(default = "default_claim_lease_secs")]
    pub claim_lease_secs: u64,
}

/// Retry cooldown for failed events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_delay_secs")]
    pub delay_secs: u64,

    #[serde(default)]
    pub jitter_secs: u64,

    /// 0 means unlimited
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

/// Ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Grace window before the fallback sweep picks up a new event
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,
}

/// Content-analysis endpoints; an absent URL disables that signal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default)]
    pub questions_url: Option<String>,

    #[serde(default)]
    pub emotion_url: Option<String>,

    #[serde(default)]
    pub memories_url: Option<String>,

    #[serde(default = "default_analysis_timeout_secs")]
    pub timeout_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_database_path() -> String {
    "~/.local/share/rapport/rapport.db".to_string()
}

fn default_queue_path() -> String {
    "~/.local/share/rapport/broker.db".to_string()
}

fn default_queue_name() -> String {
    "conversation_events".to_string()
}

fn default_heartbeat_secs() -> u64 {
    10
}

fn default_channel_timeout_secs() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_workers() -> usize {
    4
}

fn default_max_restarts() -> u32 {
    20
}

fn default_backoff_initial_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_event_deadline_secs() -> u64 {
    120
}

fn default_enabled() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    10
}

fn default_batch_size() -> usize {
    20
}

fn default_claim_lease_secs() -> u64 {
    900
}

fn default_retry_delay_secs() -> u64 {
    6 * 60 * 60
}

fn default_max_attempts() -> u32 {
    10
}

fn default_initial_delay_secs() -> u64 {
    300
}

fn default_analysis_timeout_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: default_queue_path(),
            name: default_queue_name(),
            heartbeat_secs: default_heartbeat_secs(),
            channel_timeout_secs: default_channel_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_restarts: default_max_restarts(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            event_deadline_secs: default_event_deadline_secs(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_interval_secs(),
            batch_size: default_batch_size(),
            claim_lease_secs: default_claim_lease_secs(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            delay_secs: default_retry_delay_secs(),
            jitter_secs: 0,
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: default_initial_delay_secs(),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            questions_url: None,
            emotion_url: None,
            memories_url: None,
            timeout_secs: default_analysis_timeout_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    /// Searches in order:
    /// 1. Provided path
    /// 2. ./rapport.yaml (current directory)
    /// 3. ~/.config/rapport/rapport.yaml
    pub fn load(path: &str) -> Result<Self> {
        let search_paths = vec![
            shellexpand::tilde(path).to_string(),
            "rapport.yaml".to_string(),
            shellexpand::tilde("~/.config/rapport/rapport.yaml").to_string(),
        ];

        for search_path in &search_paths {
            if std::path::Path::new(search_path).exists() {
                let content = std::fs::read_to_string(search_path)?;
                let config: Config = serde_yaml::from_str(&content)?;
                return Ok(config);
            }
        }

        // No config file found, use defaults
        Ok(Config::default())
    }

    /// Get the database path, expanding ~ to home directory
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.database.path).to_string())
    }

    /// Get the broker file path, expanding ~ to home directory
    pub fn queue_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.queue.path).to_string())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            delay: secs(self.retry.delay_secs),
            jitter: secs(self.retry.jitter_secs),
            max_attempts: self.retry.max_attempts,
        }
    }

    pub fn claim_lease(&self) -> chrono::Duration {
        secs(self.scheduler.claim_lease_secs)
    }

    pub fn channel_timeout(&self) -> chrono::Duration {
        secs(self.queue.channel_timeout_secs)
    }

    pub fn ingest_delay(&self) -> chrono::Duration {
        secs(self.ingest.initial_delay_secs)
    }

    pub fn event_deadline(&self) -> Option<Duration> {
        (self.consumer.event_deadline_secs > 0)
            .then(|| Duration::from_secs(self.consumer.event_deadline_secs))
    }
}

fn secs(value: u64) -> chrono::Duration {
    let value = i64::try_from(value).unwrap_or(i64::MAX).min(i64::MAX / 1_000);
    chrono::Duration::seconds(value)
}
