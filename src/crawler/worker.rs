//! # Worker Module
//!
//! Runs rule code against downloaded fetches.
//!
//! ## Overview
//!
//! A pool of worker tasks pulls [`Fetched`] values off the inbound channel.
//! For each one a worker acquires a scrape context, binds the response (or
//! records the download failure), dispatches to the spider's rules, drains
//! the emitted records and files into a [`Collected`] batch and releases the
//! context.
//!
//! Rule code is synchronous and may block on the body stream, so each cycle
//! runs under `spawn_blocking`. A cycle that fails, is cancelled or panics
//! is logged and accounted for; the worker moves on to the next fetch.

use super::{Collected, Fetched};
use crate::context::ContextPool;
use crate::error::SpiderError;
use crate::state::CrawlerState;
use kanal::{AsyncReceiver, AsyncSender};
use log::{debug, error, trace, warn};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::task::JoinSet;

pub(crate) fn spawn_worker_task(
    pool: &'static ContextPool,
    state: Arc<CrawlerState>,
    fetched_rx: AsyncReceiver<Fetched>,
    collected_tx: AsyncSender<Collected>,
    workers: usize,
) -> tokio::task::JoinHandle<()> {
    let mut tasks = JoinSet::new();

    for worker_id in 0..workers.max(1) {
        let fetched_rx = fetched_rx.clone();
        let collected_tx = collected_tx.clone();
        let state = Arc::clone(&state);

        tasks.spawn(async move {
            trace!("Parse worker {} started", worker_id);
            while let Ok(fetched) = fetched_rx.recv().await {
                state.parsing_fetches.fetch_add(1, Ordering::SeqCst);
                let url = fetched.request.url.clone();
                let spider = Arc::clone(&fetched.spider);
                debug!("Parsing fetch of {} for spider '{}'", url, spider.name());
                state.observe(&spider);

                match tokio::task::spawn_blocking(move || run_cycle(pool, fetched)).await {
                    Ok(batch) => {
                        if batch.is_empty() {
                            trace!("Fetch of {} produced no output", url);
                        } else {
                            state.collecting_batches.fetch_add(1, Ordering::SeqCst);
                            if collected_tx.send(batch).await.is_err() {
                                error!("Collected channel closed, dropping output of {}", url);
                                state.collecting_batches.fetch_sub(1, Ordering::SeqCst);
                            } else {
                                spider.stats().increment_batches_collected();
                            }
                        }
                    }
                    Err(e) => {
                        error!("Rule code panicked while parsing {}: {}", url, e);
                        spider.stats().increment_fetch_failures();
                    }
                }
                state.parsing_fetches.fetch_sub(1, Ordering::SeqCst);
            }
            trace!("Parse worker {} finished", worker_id);
        });
    }
    drop(collected_tx);

    tokio::spawn(async move {
        trace!("Waiting for parse workers to complete");
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!("A parse worker task failed: {:?}", e);
            }
        }
        trace!("All parse workers finished");
    })
}

/// One acquire, dispatch, drain and release cycle.
pub(crate) fn run_cycle(pool: &ContextPool, fetched: Fetched) -> Collected {
    let Fetched {
        spider,
        request,
        response,
    } = fetched;
    let mut ctx = pool.acquire(&spider, request);

    match response {
        Ok(response) => {
            ctx.set_response(response);
        }
        Err(e) => {
            warn!("Download of {} failed: {}", ctx.url(), e);
            spider.stats().increment_fetch_failures();
            ctx.set_error(e);
        }
    }

    if ctx.error().is_none() {
        let outcome = ctx.parse(None).map(|_| ());
        match outcome {
            Ok(()) => {}
            Err(SpiderError::Cancelled(name)) => {
                debug!("Spider '{}' stopped while parsing {}", name, ctx.url());
                ctx.set_error(SpiderError::Cancelled(name));
            }
            Err(e) => {
                error!("Rule '{}' failed on {}: {}", ctx.rule_name(), ctx.url(), e);
                ctx.set_error(e);
            }
        }
    }

    let batch = Collected {
        spider: spider.name().to_string(),
        url: ctx.url().to_string(),
        records: ctx.pull_items(),
        files: ctx.pull_files(),
        error: ctx.take_error(),
    };
    trace!(
        "Drained {} records and {} files from {}",
        batch.records.len(),
        batch.files.len(),
        batch.url
    );
    pool.release(ctx);
    batch
}
