//! A "prelude" for users of the `spider-context` crate.
//!
//! This prelude re-exports the types rule code and crawler setup use most,
//! so that they can be imported at once.
//!
//! # Example
//!
//! ```
//! use spider_context::prelude::*;
//! ```

pub use crate::{
    // Core structs
    Crawler,
    CrawlerBuilder,
    FnRule,
    Request,
    Response,
    Rule,
    ScrapeContext,
    Spider,
    // Core traits
    RuleHandler,
    pipeline::Pipeline,
    // Essential re-exports for trait implementation
    async_trait,
    context,
    error::SpiderError,
};
