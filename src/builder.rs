//! # Builder Module
//!
//! Provides the `CrawlerBuilder`, a fluent API for configuring the worker
//! side of a crawl: how many parse workers run rule code, how many batches
//! go through the pipelines at once, and where the outputs end up.
//!
//! ## Example
//!
//! ```rust,ignore
//! use spider_context::CrawlerBuilder;
//! use spider_context::pipeline::MemoryPipeline;
//!
//! let sink = MemoryPipeline::new();
//! let crawler = CrawlerBuilder::new()
//!     .parser_workers(4)
//!     .max_concurrent_pipelines(2)
//!     .add_pipeline(sink.clone())
//!     .build()?;
//!
//! let (fetched_tx, fetched_rx) = kanal::bounded_async(64);
//! tokio::spawn(crawler.run(fetched_rx));
//! ```

use crate::crawler::Crawler;
use crate::error::SpiderError;
use crate::pipeline::Pipeline;
use std::time::Duration;
use tracing::warn;

/// Configuration for the crawler's concurrency settings.
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    /// The number of workers running rule code.
    pub parser_workers: usize,
    /// The maximum number of batches processed by the pipelines at once.
    pub max_concurrent_pipelines: usize,
    /// The capacity of the channel between the workers and the collector.
    pub channel_capacity: usize,
    /// How long shutdown waits for the collector to drain.
    pub shutdown_timeout: Duration,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        CrawlerConfig {
            parser_workers: num_cpus::get().clamp(4, 16),
            max_concurrent_pipelines: num_cpus::get().min(8),
            channel_capacity: 1000,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Default)]
pub struct CrawlerBuilder {
    crawler_config: CrawlerConfig,
    pipelines: Vec<Box<dyn Pipeline>>,
}

impl CrawlerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of workers running rule code.
    pub fn parser_workers(mut self, workers: usize) -> Self {
        self.crawler_config.parser_workers = workers;
        self
    }

    /// Sets the maximum number of concurrent pipelines.
    pub fn max_concurrent_pipelines(mut self, limit: usize) -> Self {
        self.crawler_config.max_concurrent_pipelines = limit;
        self
    }

    /// Sets the capacity of the channel between workers and collector.
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.crawler_config.channel_capacity = capacity;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.crawler_config.shutdown_timeout = timeout;
        self
    }

    /// Adds a pipeline; outputs pass through pipelines in insertion order.
    pub fn add_pipeline<P: Pipeline>(mut self, pipeline: P) -> Self {
        self.pipelines.push(Box::new(pipeline));
        self
    }

    /// Validates the configuration and builds the `Crawler`.
    pub fn build(self) -> Result<Crawler, SpiderError> {
        if self.crawler_config.parser_workers == 0 {
            return Err(SpiderError::ConfigurationError(
                "parser_workers must be greater than 0.".to_string(),
            ));
        }
        if self.crawler_config.max_concurrent_pipelines == 0 {
            return Err(SpiderError::ConfigurationError(
                "max_concurrent_pipelines must be greater than 0.".to_string(),
            ));
        }
        if self.crawler_config.channel_capacity == 0 {
            return Err(SpiderError::ConfigurationError(
                "channel_capacity must be greater than 0.".to_string(),
            ));
        }
        if self.pipelines.is_empty() {
            warn!("No pipelines configured; emitted records and files will be discarded");
        }
        Ok(Crawler::new(self.pipelines, self.crawler_config))
    }
}
