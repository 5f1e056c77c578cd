//! # spider-context
//!
//! The per-fetch scrape context of the `spider-lib` crawling framework.
//!
//! Every downloaded page is parsed inside a [`ScrapeContext`]: a short-lived,
//! pooled object that binds one request and its response to the owning
//! [`Spider`], dispatches to the spider's rules, lazily decodes the body into
//! text and a document tree, and buffers the records, files and follow-up
//! requests the rules produce.
//!
//! ## Example
//!
//! ```rust,ignore
//! use spider_context::prelude::*;
//! use serde_json::json;
//!
//! let spider = Spider::builder("news", FnRule::new(|ctx| {
//!         ctx.add_queue(Request::new("http://x.test/list", "list"))
//!     }))
//!     .rule("list", Rule::from_fn(|ctx| {
//!         let title = ctx.text()?.lines().next().unwrap_or_default().to_string();
//!         ctx.output([("title", json!(title))], None);
//!         Ok(())
//!     }))
//!     .build();
//!
//! let mut ctx = context::acquire(&spider, Request::new("http://x.test/list", "list"));
//! ctx.set_response(Response::new(200, "Hello"));
//! ctx.parse(None)?;
//! let records = ctx.pull_items();
//! context::release(ctx);
//! ```

pub mod builder;
pub mod context;
pub mod crawler;
pub mod error;
pub mod item;
pub mod pipeline;
pub mod prelude;
pub mod request;
pub mod response;
pub mod rule;
pub mod scheduler;
pub mod spider;
pub mod state;
pub mod stats;
pub mod timer;

pub use builder::{CrawlerBuilder, CrawlerConfig};
pub use context::{ContextPool, Emitter, ScrapeContext};
pub use crawler::{Collected, Crawler, Fetched};
pub use error::SpiderError;
pub use item::{FileCell, Item, Record};
pub use request::{Request, Temp};
pub use response::Response;
pub use rule::{FnRule, Rule, RuleHandler, RuleTree};
pub use scheduler::Scheduler;
pub use spider::{Spider, SpiderBuilder};
pub use stats::StatCollector;
pub use timer::Bell;

pub use async_trait::async_trait;
pub use tokio;
