//! # Scheduler Module
//!
//! The submission queue new requests are pushed onto by scrape contexts.
//!
//! ## Overview
//!
//! The `Scheduler` holds prepared requests until the downloader collaborator
//! pops them. It is shared by every context of a spider, so all of its
//! operations take `&self` and are lock-free or internally synchronized.
//!
//! ## Key Responsibilities
//!
//! - **Request Queue Management**: a FIFO of pending requests
//! - **Duplicate Detection**: visited fingerprints are remembered in an LRU
//!   cache; requests marked `reloadable` bypass the check
//! - **Backpressure**: pushes beyond the pending limit are rejected
//! - **Shutdown**: once shut down, pushes are rejected and pops drain what
//!   is left
//!
//! ## Example
//!
//! ```rust,ignore
//! use spider_context::Scheduler;
//! use spider_context::request::Request;
//!
//! let scheduler = Scheduler::new();
//! let mut request = Request::new("https://example.com", "root");
//! request.prepare()?;
//! scheduler.push(request)?;
//!
//! while let Some(request) = scheduler.pop() {
//!     // hand to the downloader
//! }
//! ```

use crate::error::SpiderError;
use crate::request::Request;
use crossbeam::queue::SegQueue;
use moka::sync::Cache;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::{debug, info, trace, warn};

const DEFAULT_MAX_PENDING_REQUESTS: usize = 10_000;
const DEFAULT_VISITED_CAPACITY: u64 = 100_000;

pub struct Scheduler {
    request_queue: SegQueue<Request>,
    visited_urls: Cache<String, bool>,
    pending_requests: AtomicUsize,
    is_shutting_down: AtomicBool,
    max_pending_requests: usize,
}

impl Scheduler {
    /// Creates a scheduler with the default pending limit.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_PENDING_REQUESTS)
    }

    /// Creates a scheduler that holds at most `max_pending_requests` requests.
    pub fn with_capacity(max_pending_requests: usize) -> Self {
        Scheduler {
            request_queue: SegQueue::new(),
            visited_urls: Cache::builder()
                .max_capacity(DEFAULT_VISITED_CAPACITY)
                .build(),
            pending_requests: AtomicUsize::new(0),
            is_shutting_down: AtomicBool::new(false),
            max_pending_requests,
        }
    }

    /// Enqueues a prepared request, returning whether it was queued.
    ///
    /// A request whose fingerprint was already pushed is skipped unless it is
    /// `reloadable`.
    pub fn push(&self, request: Request) -> Result<bool, SpiderError> {
        if self.is_shutting_down.load(Ordering::SeqCst) {
            debug!("Scheduler is shutting down, rejecting request: {}", request.url);
            return Err(SpiderError::GeneralError(
                "Scheduler is shutting down, request rejected.".into(),
            ));
        }

        let fingerprint = request.fingerprint();
        if !request.reloadable && self.has_been_visited(&fingerprint) {
            trace!("Request already visited, skipping: {}", request.url);
            return Ok(false);
        }

        let current_pending = self.pending_requests.load(Ordering::SeqCst);
        if current_pending >= self.max_pending_requests {
            warn!(
                "Maximum pending requests reached ({}), request dropped due to backpressure: {}",
                self.max_pending_requests, request.url
            );
            return Err(SpiderError::GeneralError(
                "Scheduler at maximum capacity, request dropped due to backpressure.".into(),
            ));
        }

        trace!("Enqueuing request: {}", request.url);
        self.visited_urls.insert(fingerprint, true);
        self.request_queue.push(request);
        self.pending_requests.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    /// Takes the oldest pending request.
    pub fn pop(&self) -> Option<Request> {
        let request = self.request_queue.pop()?;
        self.pending_requests.fetch_sub(1, Ordering::SeqCst);
        Some(request)
    }

    /// Marks a fingerprint as visited without enqueuing anything.
    pub fn mark_as_visited(&self, fingerprint: String) {
        trace!("Marking URL fingerprint as visited: {}", fingerprint);
        self.visited_urls.insert(fingerprint, true);
    }

    pub fn has_been_visited(&self, fingerprint: &str) -> bool {
        self.visited_urls.contains_key(fingerprint)
    }

    /// Stops accepting new requests.
    pub fn shutdown(&self) {
        if !self.is_shutting_down.swap(true, Ordering::SeqCst) {
            info!(
                "Scheduler shutting down with {} pending requests remaining.",
                self.len()
            );
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    /// Returns the number of pending requests in the scheduler.
    #[inline]
    pub fn len(&self) -> usize {
        self.pending_requests.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prepared(url: &str) -> Request {
        let mut request = Request::new(url, "list");
        request.prepare().unwrap();
        request
    }

    #[test]
    fn fifo_order() {
        let scheduler = Scheduler::new();
        scheduler.push(prepared("http://x.test/1")).unwrap();
        scheduler.push(prepared("http://x.test/2")).unwrap();

        assert_eq!(scheduler.len(), 2);
        assert_eq!(scheduler.pop().unwrap().url, "http://x.test/1");
        assert_eq!(scheduler.pop().unwrap().url, "http://x.test/2");
        assert!(scheduler.pop().is_none());
        assert!(scheduler.is_empty());
    }

    #[test]
    fn duplicates_are_skipped_unless_reloadable() {
        let scheduler = Scheduler::new();
        assert!(scheduler.push(prepared("http://x.test/a")).unwrap());
        assert!(!scheduler.push(prepared("http://x.test/a")).unwrap());
        assert_eq!(scheduler.len(), 1);

        let mut again = prepared("http://x.test/a");
        again.reloadable = true;
        assert!(scheduler.push(again).unwrap());
        assert_eq!(scheduler.len(), 2);
    }

    #[test]
    fn capacity_and_shutdown_reject() {
        let scheduler = Scheduler::with_capacity(1);
        scheduler.push(prepared("http://x.test/1")).unwrap();
        assert!(scheduler.push(prepared("http://x.test/2")).is_err());

        scheduler.shutdown();
        assert!(scheduler.is_shutting_down());
        assert!(scheduler.push(prepared("http://x.test/3")).is_err());
        assert!(scheduler.pop().is_some());
    }
}
