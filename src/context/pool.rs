//! Recycling of context output buffers.
//!
//! Contexts are created and discarded at the rate of fetches, so the
//! allocations worth keeping (the record and file buffers) are recycled
//! through a lock-free free list. Acquire binds fresh per-fetch state to a
//! recycled buffer pair; release drops that state and truncates the buffers
//! before they go back on the list.

use super::ScrapeContext;
use super::emit::Outputs;
use crate::request::Request;
use crate::spider::Spider;
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use std::sync::{Arc, LazyLock};
use tracing::{debug, trace};

static GLOBAL_POOL: LazyLock<ContextPool> = LazyLock::new(ContextPool::new);

/// A free list of context buffers, safe to share across workers.
#[derive(Default)]
pub struct ContextPool {
    free: SegQueue<Arc<Mutex<Outputs>>>,
}

impl ContextPool {
    pub fn new() -> Self {
        ContextPool {
            free: SegQueue::new(),
        }
    }

    /// The process-wide pool used by [`acquire`] and [`release`].
    pub fn global() -> &'static ContextPool {
        &GLOBAL_POOL
    }

    /// Binds `request` of `spider` to a recycled (or new) context.
    ///
    /// The returned context has no response, no cached views and empty
    /// output buffers.
    pub fn acquire(&self, spider: &Arc<Spider>, request: Request) -> ScrapeContext {
        let outputs = self.free.pop().unwrap_or_default();
        trace!("Context acquired for {} (spider '{}')", request.url, spider.name());
        spider.stats().increment_contexts_acquired();
        ScrapeContext::bind(Arc::clone(spider), request, outputs)
    }

    /// Returns a context's buffers to the pool.
    ///
    /// Everything bound to the cycle is dropped here. Buffers still shared
    /// with a live [`Emitter`](super::Emitter) are abandoned to it and a
    /// fresh pair is pooled instead.
    pub fn release(&self, ctx: ScrapeContext) {
        let ScrapeContext {
            spider, mut outputs, ..
        } = ctx;
        spider.stats().increment_contexts_released();

        match Arc::get_mut(&mut outputs) {
            Some(buffers) => buffers.get_mut().clear(),
            None => {
                debug!(
                    "Context buffers of spider '{}' are still shared with an emitter, replacing them",
                    spider.name()
                );
                outputs = Arc::default();
            }
        }
        self.free.push(outputs);
    }

    /// Number of buffer pairs ready for reuse.
    pub fn idle(&self) -> usize {
        self.free.len()
    }
}

/// Acquires a context from the global pool.
pub fn acquire(spider: &Arc<Spider>, request: Request) -> ScrapeContext {
    ContextPool::global().acquire(spider, request)
}

/// Releases a context to the global pool.
pub fn release(ctx: ScrapeContext) {
    ContextPool::global().release(ctx)
}
