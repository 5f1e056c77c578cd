//! # Crawler Module
//!
//! The worker side of a crawl: turns downloaded fetches into collected outputs.
//!
//! ## Overview
//!
//! Downloading happens elsewhere. The downloader hands each finished fetch to
//! the crawler as a [`Fetched`] value over a bounded `kanal` channel; the
//! crawler parses it with the owning spider's rules inside a pooled scrape
//! context and forwards everything the rules emitted, as a [`Collected`]
//! batch, to the configured pipelines.
//!
//! ## Key Components
//!
//! - **Crawler**: owns the pipelines and runs both stages until the inbound
//!   channel closes
//! - **Parse Workers**: acquire, dispatch, drain and release one context per
//!   fetch
//! - **Collector**: runs drained batches through the pipelines concurrently
//!
//! ## Architecture
//!
//! Each stage runs in its own Tokio task; the stages talk over bounded async
//! channels so a slow pipeline applies backpressure all the way back to the
//! downloader.

mod collector;
mod core;
mod worker;

pub use core::Crawler;
pub(crate) use collector::spawn_collector_task;
pub(crate) use worker::spawn_worker_task;

use crate::error::SpiderError;
use crate::item::{FileCell, Record};
use crate::request::Request;
use crate::response::Response;
use crate::spider::Spider;
use std::sync::Arc;

/// A finished download, ready to be parsed.
#[derive(Debug)]
pub struct Fetched {
    pub spider: Arc<Spider>,
    pub request: Request,
    /// The response, or why the download failed.
    pub response: Result<Response, SpiderError>,
}

/// Everything one fetch cycle produced.
#[derive(Debug)]
pub struct Collected {
    pub spider: String,
    pub url: String,
    pub records: Vec<Record>,
    pub files: Vec<FileCell>,
    /// The failure recorded against the fetch, if any.
    pub error: Option<SpiderError>,
}

impl Collected {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.files.is_empty() && self.error.is_none()
    }
}
