//! Module for tracking the operational state of the crawl workers.
//!
//! `CrawlerState` counts the work currently in flight in each stage:
//! - fetches whose context is being parsed by a rule;
//! - drained batches waiting for or running through the pipelines.
//!
//! The crawler consults it to decide when all stages have gone quiet. It also
//! remembers the statistics of every spider seen, so they can be reported
//! when the run ends.

use crate::spider::Spider;
use crate::stats::StatCollector;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Represents the shared state of the crawler's worker stages.
#[derive(Debug, Default)]
pub struct CrawlerState {
    /// The number of fetches currently being parsed.
    pub parsing_fetches: AtomicUsize,
    /// The number of drained batches not yet through the pipelines.
    pub collecting_batches: AtomicUsize,
    /// Statistics of every spider a fetch was parsed for, by name.
    pub spiders: DashMap<String, Arc<StatCollector>>,
}

impl CrawlerState {
    /// Creates a new, atomically reference-counted `CrawlerState`.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Checks if every worker stage is idle.
    pub fn is_idle(&self) -> bool {
        self.parsing_fetches.load(Ordering::SeqCst) == 0
            && self.collecting_batches.load(Ordering::SeqCst) == 0
    }

    /// Registers a spider whose statistics are reported at the end of the run.
    pub fn observe(&self, spider: &Spider) {
        if !self.spiders.contains_key(spider.name()) {
            self.spiders
                .insert(spider.name().to_string(), Arc::clone(spider.stats()));
        }
    }
}
