//! The core Crawler implementation.
//!
//! This module defines the `Crawler` struct, which wires the parse workers to
//! the collector, runs them until the inbound fetch channel closes and then
//! shuts the pipelines down.

use crate::builder::CrawlerConfig;
use crate::context::ContextPool;
use crate::pipeline::Pipeline;
use crate::state::CrawlerState;
use super::Fetched;
use anyhow::{Context, Result};
use futures_util::future::join_all;
use kanal::{AsyncReceiver, bounded_async};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, error, info, trace, warn};

/// Runs downloaded fetches through the spiders' rules and the pipelines.
pub struct Crawler {
    pipelines: Vec<Box<dyn Pipeline>>,
    config: CrawlerConfig,
    state: Arc<CrawlerState>,
}

impl Crawler {
    pub(crate) fn new(pipelines: Vec<Box<dyn Pipeline>>, config: CrawlerConfig) -> Self {
        Crawler {
            pipelines,
            config,
            state: CrawlerState::new(),
        }
    }

    /// Returns the shared stage counters, e.g. to wait for the crawl to go idle.
    pub fn state(&self) -> Arc<CrawlerState> {
        Arc::clone(&self.state)
    }

    /// Parses every fetch received on `fetched_rx` until the channel closes.
    ///
    /// Per-fetch failures never end the run; they are logged and carried in
    /// the collected batch. The pipelines are closed once everything sent
    /// before the channel closed has been collected.
    pub async fn run(self, fetched_rx: AsyncReceiver<Fetched>) -> Result<()> {
        info!(
            "Crawler starting with configuration: parser_workers={}, max_concurrent_pipelines={}",
            self.config.parser_workers, self.config.max_concurrent_pipelines
        );

        let Crawler {
            pipelines,
            config,
            state,
        } = self;
        let pipelines = Arc::new(pipelines);

        trace!(
            "Creating collected channel with capacity: {}",
            config.channel_capacity
        );
        let (collected_tx, collected_rx) = bounded_async(config.channel_capacity);

        trace!("Spawning parse workers");
        let worker_task = super::spawn_worker_task(
            ContextPool::global(),
            Arc::clone(&state),
            fetched_rx,
            collected_tx,
            config.parser_workers,
        );

        trace!("Spawning collector task");
        let collector_task = super::spawn_collector_task(
            Arc::clone(&state),
            collected_rx,
            Arc::clone(&pipelines),
            config.max_concurrent_pipelines,
        );

        worker_task.await.context("parse worker coordinator failed")?;
        debug!("Parse workers finished, draining the collector");

        match tokio::time::timeout(config.shutdown_timeout, collector_task).await {
            Ok(joined) => joined.context("collector task failed")?,
            Err(_) => warn!(
                "Collector did not finish within {}s, {} batches abandoned",
                config.shutdown_timeout.as_secs(),
                state.collecting_batches.load(Ordering::SeqCst)
            ),
        }

        info!("Closing pipelines...");
        let closing = join_all(pipelines.iter().map(|p| p.close())).await;
        for (pipeline, result) in pipelines.iter().zip(closing) {
            if let Err(e) = result {
                error!("Pipeline '{}' failed to close: {}", pipeline.name(), e);
            }
        }
        for entry in state.spiders.iter() {
            let stats = entry.value();
            info!(
                "Spider '{}' finished. Stats: dispatches={}, records_emitted={}, files_emitted={}, requests_enqueued={}, fetch_failures={}",
                entry.key(),
                stats.dispatches.load(Ordering::SeqCst),
                stats.records_emitted.load(Ordering::SeqCst),
                stats.files_emitted.load(Ordering::SeqCst),
                stats.requests_enqueued.load(Ordering::SeqCst),
                stats.fetch_failures.load(Ordering::SeqCst)
            );
            debug!("Final statistics for '{}':\n{}", entry.key(), stats);
        }
        info!("Crawl finished.");
        Ok(())
    }
}
