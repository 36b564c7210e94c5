pub mod cli;
pub mod config;
pub mod consumer;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod queue;
pub mod scheduler;
pub mod scoring;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};
