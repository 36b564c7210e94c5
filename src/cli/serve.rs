//! Serve command: queue consumer plus fallback scheduler until Ctrl-C

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;

use crate::config::Config;
use crate::consumer::{ConcurrentConsumer, ConsumerSettings};
use crate::queue::QueueTransport;
use crate::scheduler::{FallbackScheduler, SchedulerSettings};
use crate::store::Database;

pub fn run(config: &Config, db: Database) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(serve(config, db))
}

async fn serve(config: &Config, db: Database) -> Result<()> {
    let broker: Arc<dyn QueueTransport> = Arc::new(super::open_broker(config)?);
    let processor = super::processor(config, db);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = if config.scheduler.enabled {
        let scheduler = FallbackScheduler::new(
            processor.clone(),
            SchedulerSettings::from_config(config),
        );
        Some(tokio::spawn(scheduler.run(shutdown_rx.clone())))
    } else {
        tracing::warn!("fallback scheduler disabled; events missed by the queue will wait");
        None
    };

    let consumer = ConcurrentConsumer::new(broker, processor, ConsumerSettings::from_config(config));
    let consuming = consumer.run(shutdown_rx);
    tokio::pin!(consuming);

    let result = tokio::select! {
        result = &mut consuming => result,
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => tracing::info!("shutdown requested"),
                Err(e) => tracing::warn!(error = %e, "cannot listen for Ctrl-C, shutting down"),
            }
            let _ = shutdown_tx.send(true);
            consuming.await
        }
    };

    let _ = shutdown_tx.send(true);
    if let Some(task) = scheduler {
        task.await.context("fallback scheduler task failed")?;
    }

    let stats = result.context("queue consumer stopped")?;
    println!(
        "Stopped: {} delivered, {} acked, {} requeued, {} timed out, {} abandoned, {} restarts",
        stats.delivered,
        stats.acked,
        stats.requeued,
        stats.timed_out,
        stats.abandoned,
        stats.restarts
    );
    Ok(())
}
