//! # Statistics Module
//!
//! Collects counters describing what scrape contexts did during a crawl.
//!
//! ## Overview
//!
//! The `StatCollector` is shared by a spider and every context bound to it.
//! All counters are atomics so emission from helper threads never contends
//! on a lock. Locally recovered conditions (rule misses, transcoding
//! fallbacks, dropped requests) are counted here as well as logged, which
//! makes them observable from tests and from the host application.
//!
//! ## Key Metrics Tracked
//!
//! - **Context Metrics**: acquired, released, dispatched, root fallbacks
//! - **Output Metrics**: records and files emitted, bytes materialized
//! - **Queue Metrics**: requests enqueued and dropped
//! - **Failure Metrics**: rule misses, transcoding fallbacks, fetch failures
//! - **Response Metrics**: status code distribution
//!
//! ## Example
//!
//! ```rust,ignore
//! use spider_context::StatCollector;
//!
//! let stats = StatCollector::new();
//! println!("{}", stats.to_json_string_pretty()?);
//! println!("{}", stats.to_markdown_string());
//! ```

use crate::error::SpiderError;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

// A point-in-time copy of the counters, used by every presentation method.
struct StatsSnapshot {
    contexts_acquired: usize,
    contexts_released: usize,
    dispatches: usize,
    root_fallbacks: usize,
    rule_misses: usize,
    records_emitted: usize,
    files_emitted: usize,
    bytes_materialized: usize,
    requests_enqueued: usize,
    requests_dropped: usize,
    transcode_fallbacks: usize,
    fetch_failures: usize,
    batches_collected: usize,
    response_status_counts: HashMap<u16, usize>,
    elapsed_duration: Duration,
}

impl StatsSnapshot {
    fn formatted_duration(&self) -> String {
        format!("{:?}", self.elapsed_duration)
    }

    fn per_second(&self, count: usize) -> f64 {
        let total_seconds = self.elapsed_duration.as_secs();
        if total_seconds > 0 {
            count as f64 / total_seconds as f64
        } else {
            0.0
        }
    }

    fn formatted_bytes(&self) -> String {
        const KB: usize = 1024;
        const MB: usize = 1024 * KB;
        const GB: usize = 1024 * MB;

        if self.bytes_materialized >= GB {
            format!("{:.2} GB", self.bytes_materialized as f64 / GB as f64)
        } else if self.bytes_materialized >= MB {
            format!("{:.2} MB", self.bytes_materialized as f64 / MB as f64)
        } else if self.bytes_materialized >= KB {
            format!("{:.2} KB", self.bytes_materialized as f64 / KB as f64)
        } else {
            format!("{} B", self.bytes_materialized)
        }
    }
}

/// Collects and stores statistics about scrape context activity.
#[derive(Debug, serde::Serialize)]
pub struct StatCollector {
    #[serde(skip)]
    pub start_time: Instant,

    pub contexts_acquired: AtomicUsize,
    pub contexts_released: AtomicUsize,
    pub dispatches: AtomicUsize,
    pub root_fallbacks: AtomicUsize,
    pub rule_misses: AtomicUsize,

    pub records_emitted: AtomicUsize,
    pub files_emitted: AtomicUsize,
    pub bytes_materialized: AtomicUsize,

    pub requests_enqueued: AtomicUsize,
    pub requests_dropped: AtomicUsize,

    pub transcode_fallbacks: AtomicUsize,
    pub fetch_failures: AtomicUsize,
    pub batches_collected: AtomicUsize,

    pub response_status_counts: Arc<dashmap::DashMap<u16, usize>>,
}

impl StatCollector {
    /// Creates a new `StatCollector` with all counters initialized to zero.
    pub fn new() -> Self {
        StatCollector {
            start_time: Instant::now(),
            contexts_acquired: AtomicUsize::new(0),
            contexts_released: AtomicUsize::new(0),
            dispatches: AtomicUsize::new(0),
            root_fallbacks: AtomicUsize::new(0),
            rule_misses: AtomicUsize::new(0),
            records_emitted: AtomicUsize::new(0),
            files_emitted: AtomicUsize::new(0),
            bytes_materialized: AtomicUsize::new(0),
            requests_enqueued: AtomicUsize::new(0),
            requests_dropped: AtomicUsize::new(0),
            transcode_fallbacks: AtomicUsize::new(0),
            fetch_failures: AtomicUsize::new(0),
            batches_collected: AtomicUsize::new(0),
            response_status_counts: Arc::new(dashmap::DashMap::new()),
        }
    }

    fn snapshot(&self) -> StatsSnapshot {
        let mut status_counts: HashMap<u16, usize> = HashMap::new();
        for entry in self.response_status_counts.iter() {
            let (key, value) = entry.pair();
            status_counts.insert(*key, *value);
        }

        StatsSnapshot {
            contexts_acquired: self.contexts_acquired.load(Ordering::SeqCst),
            contexts_released: self.contexts_released.load(Ordering::SeqCst),
            dispatches: self.dispatches.load(Ordering::SeqCst),
            root_fallbacks: self.root_fallbacks.load(Ordering::SeqCst),
            rule_misses: self.rule_misses.load(Ordering::SeqCst),
            records_emitted: self.records_emitted.load(Ordering::SeqCst),
            files_emitted: self.files_emitted.load(Ordering::SeqCst),
            bytes_materialized: self.bytes_materialized.load(Ordering::SeqCst),
            requests_enqueued: self.requests_enqueued.load(Ordering::SeqCst),
            requests_dropped: self.requests_dropped.load(Ordering::SeqCst),
            transcode_fallbacks: self.transcode_fallbacks.load(Ordering::SeqCst),
            fetch_failures: self.fetch_failures.load(Ordering::SeqCst),
            batches_collected: self.batches_collected.load(Ordering::SeqCst),
            response_status_counts: status_counts,
            elapsed_duration: self.start_time.elapsed(),
        }
    }

    pub(crate) fn increment_contexts_acquired(&self) {
        self.contexts_acquired.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_contexts_released(&self) {
        self.contexts_released.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_dispatches(&self) {
        self.dispatches.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_root_fallbacks(&self) {
        self.root_fallbacks.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_rule_misses(&self) {
        self.rule_misses.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_records_emitted(&self) {
        self.records_emitted.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_files_emitted(&self) {
        self.files_emitted.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn add_bytes_materialized(&self, bytes: usize) {
        self.bytes_materialized.fetch_add(bytes, Ordering::SeqCst);
    }

    pub(crate) fn increment_requests_enqueued(&self) {
        self.requests_enqueued.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_requests_dropped(&self) {
        self.requests_dropped.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_transcode_fallbacks(&self) {
        self.transcode_fallbacks.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_fetch_failures(&self) {
        self.fetch_failures.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_batches_collected(&self) {
        self.batches_collected.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_response_status(&self, status_code: u16) {
        *self.response_status_counts.entry(status_code).or_insert(0) += 1;
    }

    pub fn to_json_string(&self) -> Result<String, SpiderError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_json_string_pretty(&self) -> Result<String, SpiderError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Exports the current statistics to a Markdown formatted string.
    pub fn to_markdown_string(&self) -> String {
        let snapshot = self.snapshot();

        let status_codes_list: String = snapshot
            .response_status_counts
            .iter()
            .map(|(code, count)| format!("- **{}**: {}", code, count))
            .collect::<Vec<String>>()
            .join("\n");
        let status_codes_output = if status_codes_list.is_empty() {
            "N/A".to_string()
        } else {
            status_codes_list
        };

        format!(
            r#"# Scrape Statistics Report

- **Duration**: {}
- **Average Speed**: {:.2} dispatch/s, {:.2} record/s

## Contexts
| Metric         | Count |
|----------------|-------|
| Acquired       | {}     |
| Released       | {}     |
| Dispatched     | {}     |
| Root Fallbacks | {}     |
| Rule Misses    | {}     |

## Output
| Metric       | Count |
|--------------|-------|
| Records      | {}     |
| Files        | {}     |
| Materialized | {}     |
| Batches      | {}     |

## Queue
| Metric   | Count |
|----------|-------|
| Enqueued | {}     |
| Dropped  | {}     |

## Failures
| Metric              | Count |
|---------------------|-------|
| Transcode Fallbacks | {}     |
| Fetch Failures      | {}     |

## Status Codes
{}
"#,
            snapshot.formatted_duration(),
            snapshot.per_second(snapshot.dispatches),
            snapshot.per_second(snapshot.records_emitted),
            snapshot.contexts_acquired,
            snapshot.contexts_released,
            snapshot.dispatches,
            snapshot.root_fallbacks,
            snapshot.rule_misses,
            snapshot.records_emitted,
            snapshot.files_emitted,
            snapshot.formatted_bytes(),
            snapshot.batches_collected,
            snapshot.requests_enqueued,
            snapshot.requests_dropped,
            snapshot.transcode_fallbacks,
            snapshot.fetch_failures,
            status_codes_output
        )
    }
}

impl Default for StatCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StatCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();

        writeln!(f, "\nScrape Statistics")?;
        writeln!(f, "-----------------")?;
        writeln!(f, "  duration : {}", snapshot.formatted_duration())?;
        writeln!(
            f,
            "  contexts : acquired: {}, released: {}, dispatched: {}, root: {}, misses: {}",
            snapshot.contexts_acquired,
            snapshot.contexts_released,
            snapshot.dispatches,
            snapshot.root_fallbacks,
            snapshot.rule_misses
        )?;
        writeln!(
            f,
            "  output   : records: {}, files: {}, materialized: {}, batches: {}",
            snapshot.records_emitted,
            snapshot.files_emitted,
            snapshot.formatted_bytes(),
            snapshot.batches_collected
        )?;
        writeln!(
            f,
            "  queue    : enqueued: {}, dropped: {}",
            snapshot.requests_enqueued, snapshot.requests_dropped
        )?;
        writeln!(
            f,
            "  failures : transcode: {}, fetch: {}",
            snapshot.transcode_fallbacks, snapshot.fetch_failures
        )?;

        let status_string = if snapshot.response_status_counts.is_empty() {
            "none".to_string()
        } else {
            snapshot
                .response_status_counts
                .iter()
                .map(|(code, count)| format!("{}: {}", code, count))
                .collect::<Vec<String>>()
                .join(", ")
        };

        writeln!(f, "  status   : {}\n", status_string)
    }
}
