//! # Spider Module
//!
//! Defines the `Spider`: the crawl unit every scrape context belongs to.
//!
//! ## Overview
//!
//! A spider owns the rule table contexts resolve against, the submission
//! queue new requests go to, the statistics collector, and a handful of
//! runtime settings rule code may read or adjust (keyin, limit, pausetime).
//! It is shared behind an `Arc` by all contexts of a crawl, so its mutable
//! settings are atomics or lock-guarded.
//!
//! Stopping a spider is cooperative: [`Spider::stop`] raises a flag that
//! dispatch, aid and queueing consult through [`Spider::check_running`]. A
//! stopped spider makes those calls return [`SpiderError::Cancelled`], which
//! unwinds the worker currently running rule code.
//!
//! ## Example
//!
//! ```rust,ignore
//! use spider_context::{FnRule, Request, Rule, Spider};
//!
//! let spider = Spider::builder("news", FnRule::new(|ctx| {
//!         ctx.add_queue(Request::new("http://x.test/list", "list"))
//!     }))
//!     .rule("list", Rule::from_fn(|ctx| Ok(())))
//!     .not_default_field(true)
//!     .build();
//! ```

use crate::error::SpiderError;
use crate::request::Request;
use crate::rule::{Rule, RuleHandler, RuleTree};
use crate::scheduler::Scheduler;
use crate::stats::StatCollector;
use crate::timer::{Bell, Timers};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

pub struct Spider {
    name: String,
    description: String,
    rule_tree: RuleTree,
    enable_cookie: bool,
    not_default_field: bool,
    keyin: RwLock<String>,
    limit: AtomicI64,
    pausetime: AtomicI64,
    stopped: AtomicBool,
    timers: Timers,
    scheduler: Arc<Scheduler>,
    stats: Arc<StatCollector>,
}

impl Spider {
    /// Starts building a spider whose seed requests are parsed by `root`.
    pub fn builder(name: impl Into<String>, root: impl RuleHandler + 'static) -> SpiderBuilder {
        SpiderBuilder {
            name: name.into(),
            description: String::new(),
            rule_tree: RuleTree::new(root),
            enable_cookie: false,
            not_default_field: false,
            keyin: String::new(),
            limit: 0,
            pausetime: 0,
            scheduler: None,
            stats: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn enable_cookie(&self) -> bool {
        self.enable_cookie
    }

    /// Whether records omit the url, referer and capture time fields.
    pub fn not_default_field(&self) -> bool {
        self.not_default_field
    }

    pub fn rule_tree(&self) -> &RuleTree {
        &self.rule_tree
    }

    pub fn get_rule(&self, name: &str) -> Option<Arc<Rule>> {
        self.rule_tree.get(name)
    }

    pub fn rules(&self) -> &HashMap<String, Arc<Rule>> {
        self.rule_tree.rules()
    }

    pub fn keyin(&self) -> String {
        self.keyin.read().clone()
    }

    pub fn set_keyin(&self, keyin: impl Into<String>) {
        *self.keyin.write() = keyin.into();
    }

    pub fn limit(&self) -> i64 {
        self.limit.load(Ordering::SeqCst)
    }

    pub fn set_limit(&self, limit: i64) {
        self.limit.store(limit, Ordering::SeqCst);
    }

    /// Pause between requests, in milliseconds.
    pub fn pausetime(&self) -> i64 {
        self.pausetime.load(Ordering::SeqCst)
    }

    /// Sets the pause unless one is already configured; `runtime` forces the overwrite.
    pub fn set_pausetime(&self, pause: i64, runtime: bool) {
        if runtime || self.pausetime() == 0 {
            self.pausetime.store(pause, Ordering::SeqCst);
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn stats(&self) -> &Arc<StatCollector> {
        &self.stats
    }

    /// Requests a cooperative stop of every worker running this spider's rules.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            info!("Spider '{}' stopping", self.name);
            self.scheduler.shutdown();
            self.timers.close();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Fails with [`SpiderError::Cancelled`] once the spider has been stopped.
    pub fn check_running(&self) -> Result<(), SpiderError> {
        if self.is_stopped() {
            debug!("Spider '{}' is stopped, unwinding worker", self.name);
            return Err(SpiderError::Cancelled(self.name.clone()));
        }
        Ok(())
    }

    /// Registers a named timer; see [`Timers::set`].
    pub fn set_timer(&self, id: &str, tol: Duration, bell: Option<Bell>) -> Result<(), SpiderError> {
        self.check_running()?;
        self.timers.set(id, tol, bell)
    }

    /// Blocks until timer `id` fires, or fails with [`SpiderError::Cancelled`]
    /// when the spider is stopped first.
    pub fn run_timer(&self, id: &str) -> Result<(), SpiderError> {
        self.check_running()?;
        if self.timers.wait(id)? {
            Ok(())
        } else {
            debug!("Spider '{}' stopped while timer '{}' was running", self.name, id);
            Err(SpiderError::Cancelled(self.name.clone()))
        }
    }

    /// Hands a prepared request to the submission queue.
    pub(crate) fn request_push(&self, request: Request) -> Result<(), SpiderError> {
        if self.scheduler.push(request)? {
            self.stats.increment_requests_enqueued();
        }
        Ok(())
    }
}

impl fmt::Debug for Spider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spider")
            .field("name", &self.name)
            .field("rule_tree", &self.rule_tree)
            .field("enable_cookie", &self.enable_cookie)
            .field("not_default_field", &self.not_default_field)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

/// Fluent configuration for a [`Spider`].
pub struct SpiderBuilder {
    name: String,
    description: String,
    rule_tree: RuleTree,
    enable_cookie: bool,
    not_default_field: bool,
    keyin: String,
    limit: i64,
    pausetime: i64,
    scheduler: Option<Arc<Scheduler>>,
    stats: Option<Arc<StatCollector>>,
}

impl SpiderBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Registers a named rule.
    pub fn rule(mut self, name: impl Into<String>, rule: Rule) -> Self {
        self.rule_tree = self.rule_tree.add_rule(name, rule);
        self
    }

    /// Sets the cookie-jar policy inherited by every queued request.
    pub fn enable_cookie(mut self, enable: bool) -> Self {
        self.enable_cookie = enable;
        self
    }

    /// Suppresses the url, referer and capture time fields on records.
    pub fn not_default_field(mut self, suppress: bool) -> Self {
        self.not_default_field = suppress;
        self
    }

    pub fn keyin(mut self, keyin: impl Into<String>) -> Self {
        self.keyin = keyin.into();
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn pausetime(mut self, pause: i64) -> Self {
        self.pausetime = pause;
        self
    }

    /// Uses an existing submission queue instead of a private one.
    pub fn scheduler(mut self, scheduler: Arc<Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn stats(mut self, stats: Arc<StatCollector>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn build(self) -> Arc<Spider> {
        Arc::new(Spider {
            name: self.name,
            description: self.description,
            rule_tree: self.rule_tree,
            enable_cookie: self.enable_cookie,
            not_default_field: self.not_default_field,
            keyin: RwLock::new(self.keyin),
            limit: AtomicI64::new(self.limit),
            pausetime: AtomicI64::new(self.pausetime),
            stopped: AtomicBool::new(false),
            timers: Timers::new(),
            scheduler: self.scheduler.unwrap_or_default(),
            stats: self.stats.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::FnRule;

    fn spider() -> Arc<Spider> {
        Spider::builder("news", FnRule::new(|_| Ok(())))
            .rule("list", Rule::from_fn(|_| Ok(())))
            .keyin("rust")
            .limit(10)
            .build()
    }

    #[test]
    fn settings_round_trip() {
        let spider = spider();
        assert_eq!(spider.name(), "news");
        assert_eq!(spider.keyin(), "rust");
        spider.set_keyin("go");
        assert_eq!(spider.keyin(), "go");
        assert_eq!(spider.limit(), 10);
        assert!(spider.get_rule("list").is_some());
        assert!(spider.get_rule("detail").is_none());
    }

    #[test]
    fn stopping_interrupts_a_running_timer() {
        let spider = spider();
        spider.set_timer("nightly", Duration::ZERO, Some(Bell::new(3, 0, 0))).unwrap();

        let waiter = {
            let spider = Arc::clone(&spider);
            std::thread::spawn(move || spider.run_timer("nightly"))
        };
        std::thread::sleep(Duration::from_millis(20));
        spider.stop();

        assert!(matches!(waiter.join().unwrap(), Err(SpiderError::Cancelled(_))));
        assert!(matches!(
            spider.set_timer("later", Duration::from_secs(1), None),
            Err(SpiderError::Cancelled(_))
        ));
    }

    #[test]
    fn pausetime_only_overwritten_when_unset_or_forced() {
        let spider = spider();
        spider.set_pausetime(300, false);
        assert_eq!(spider.pausetime(), 300);
        spider.set_pausetime(500, false);
        assert_eq!(spider.pausetime(), 300);
        spider.set_pausetime(500, true);
        assert_eq!(spider.pausetime(), 500);
    }

    #[test]
    fn stop_cancels_and_shuts_down_queue() {
        let spider = spider();
        assert!(spider.check_running().is_ok());
        spider.stop();
        assert!(matches!(spider.check_running(), Err(SpiderError::Cancelled(name)) if name == "news"));
        assert!(spider.scheduler().is_shutting_down());
    }
}
