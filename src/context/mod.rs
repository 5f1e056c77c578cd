//! # Context Module
//!
//! The scrape context: one fetch bound to one spider, for one cycle.
//!
//! ## Overview
//!
//! A worker acquires a [`ScrapeContext`] from the [`ContextPool`], binds the
//! downloaded [`Response`], and calls [`ScrapeContext::parse`]. Parse resolves
//! the rule named on the request (or the explicitly given one) and invokes it
//! with the context as its execution environment. Rule code reads the lazily
//! decoded text or parsed document, emits records and files, and queues
//! further requests. The worker then drains the outputs and releases the
//! context back to the pool.
//!
//! ## Ownership
//!
//! A context is owned by exactly one worker: the request, the response and
//! the derived views are only reachable through `&mut self`. The output
//! buffers are the exception. They sit behind a mutex shared with every
//! [`Emitter`] handed out by [`ScrapeContext::emitter`], so helper threads
//! spawned by rule code can emit into the same cycle concurrently.
//!
//! ## Rule resolution
//!
//! Every rule-scoped operation (parse, aid, output, field table lookups)
//! resolves its rule the same way: an explicit name wins; otherwise the rule
//! recorded on the request is used, but only once a response is bound. A
//! context without a response has no current rule. Misses are logged and
//! counted, never raised, except by `parse`, which falls back to the
//! spider's root handler.

mod emit;
mod pool;
mod queue;
mod text;

pub use emit::{Emitter, derive_filename};
pub use pool::{ContextPool, acquire, release};
pub use text::{Decoding, declared_charset, resolve_encoding};

use crate::error::SpiderError;
use crate::item::{FileCell, Record};
use crate::request::{Request, Temp, header_str};
use crate::response::{EffectiveRequest, Response};
use crate::rule::Rule;
use crate::spider::Spider;
use crate::timer::Bell;
use emit::Outputs;
use http::HeaderMap;
use http::header::REFERER;
use parking_lot::Mutex;
use scraper::Html;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, trace};

pub struct ScrapeContext {
    spider: Arc<Spider>,
    request: Request,
    response: Option<Response>,
    text: Option<String>,
    dom: Option<Html>,
    outputs: Arc<Mutex<Outputs>>,
    err: Option<SpiderError>,
}

impl ScrapeContext {
    pub(crate) fn bind(spider: Arc<Spider>, request: Request, outputs: Arc<Mutex<Outputs>>) -> Self {
        ScrapeContext {
            spider,
            request,
            response: None,
            text: None,
            dom: None,
            outputs,
            err: None,
        }
    }

    /// Binds the downloaded response.
    ///
    /// A response that does not carry its effective request inherits the
    /// url and headers of the request it answers.
    pub fn set_response(&mut self, mut response: Response) -> &mut Self {
        self.spider.stats().record_response_status(response.status);
        if response.request.url.is_empty() {
            response.request = EffectiveRequest {
                url: self.request.url.clone(),
                headers: self.request.header.clone(),
            };
        }
        self.response = Some(response);
        self
    }

    /// Records a download failure against this fetch.
    pub fn set_error(&mut self, err: SpiderError) -> &mut Self {
        self.err = Some(err);
        self
    }

    pub fn error(&self) -> Option<&SpiderError> {
        self.err.as_ref()
    }

    pub fn take_error(&mut self) -> Option<SpiderError> {
        self.err.take()
    }

    /// Dispatches to the named rule, the request's rule, or the root handler.
    ///
    /// With a response bound, the resolved name is written back onto the
    /// request so nested rule-scoped calls default to the same rule.
    pub fn parse(&mut self, rule: Option<&str>) -> Result<&mut Self, SpiderError> {
        self.spider.check_running()?;
        self.spider.stats().increment_dispatches();

        let name = self.resolve_name(rule);
        if self.response.is_some() {
            self.request.set_rule_name(name.clone().unwrap_or_default());
        }

        let spider = Arc::clone(&self.spider);
        match name.as_deref().and_then(|n| spider.get_rule(n)) {
            Some(found) => {
                trace!(
                    "Dispatching {} to rule '{}' of spider '{}'",
                    self.request.url,
                    self.request.rule,
                    spider.name()
                );
                found.parse(self)?;
            }
            None => {
                trace!(
                    "No rule resolved for {}, falling back to the root of spider '{}'",
                    self.request.url,
                    spider.name()
                );
                spider.stats().increment_root_fallbacks();
                spider.rule_tree().root().parse(self)?;
            }
        }
        Ok(self)
    }

    /// Invokes the aid function of the resolved rule.
    ///
    /// A resolution miss is logged and yields `Value::Null`.
    pub fn aid(&mut self, args: &Temp, rule: Option<&str>) -> Result<Value, SpiderError> {
        self.spider.check_running()?;
        let Some((_, found)) = self.lookup_rule("aid", rule) else {
            return Ok(Value::Null);
        };
        found.aid(self, args)
    }

    /// A handle that emits into this context's buffers from other threads.
    pub fn emitter(&self) -> Emitter {
        Emitter::new(
            Arc::clone(&self.spider),
            Arc::clone(&self.outputs),
            self.current_rule().map(str::to_string),
            self.request.url.clone(),
            self.referer().to_string(),
        )
    }

    /// Translates index-keyed fields to names through the rule's field table.
    pub fn create_item(
        &self,
        item: BTreeMap<usize, Value>,
        rule: Option<&str>,
    ) -> Option<Map<String, Value>> {
        let (name, found) = self.lookup_rule("create_item", rule)?;
        Some(emit::translate_indexed(&name, &found, item))
    }

    /// Removes and returns every record emitted so far, in emission order.
    pub fn pull_items(&self) -> Vec<Record> {
        std::mem::take(&mut self.outputs.lock().items)
    }

    /// Removes and returns every file emitted so far, in emission order.
    pub fn pull_files(&self) -> Vec<FileCell> {
        std::mem::take(&mut self.outputs.lock().files)
    }

    pub fn pending_items(&self) -> usize {
        self.outputs.lock().items.len()
    }

    pub fn pending_files(&self) -> usize {
        self.outputs.lock().files.len()
    }

    pub fn copy_request(&self) -> Request {
        self.request.clone()
    }

    pub fn copy_temps(&self) -> Temp {
        self.request.temp.clone()
    }

    pub fn set_temp<T: Serialize>(&mut self, key: impl Into<String>, value: T) -> Result<&mut Self, SpiderError> {
        self.request.set_temp(key, value)?;
        Ok(self)
    }

    pub fn get_temp<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.request.get_temp(key)
    }

    pub fn set_url(&mut self, url: impl Into<String>) -> &mut Self {
        self.request.url = url.into();
        self
    }

    pub fn set_referer(&mut self, referer: &str) -> &mut Self {
        self.request.set_referer(referer);
        self
    }

    /// Appends `field` to the resolved rule's field table; `None` on a miss.
    pub fn upsert_item_field(&self, field: &str, rule: Option<&str>) -> Option<usize> {
        let (_, found) = self.lookup_rule("upsert_item_field", rule)?;
        Some(found.upsert_field(field))
    }

    pub fn item_fields(&self, rule: Option<&str>) -> Option<Vec<String>> {
        let (_, found) = self.lookup_rule("item_fields", rule)?;
        Some(found.fields())
    }

    pub fn item_field(&self, index: usize, rule: Option<&str>) -> Option<String> {
        let (_, found) = self.lookup_rule("item_field", rule)?;
        found.field(index)
    }

    pub fn item_field_index(&self, field: &str, rule: Option<&str>) -> Option<usize> {
        let (_, found) = self.lookup_rule("item_field_index", rule)?;
        found.field_index(field)
    }

    /// Resolves a rule without logging a miss.
    pub fn resolve_rule(&self, rule: Option<&str>) -> Option<(String, Arc<Rule>)> {
        let name = self.resolve_name(rule)?;
        let found = self.spider.get_rule(&name)?;
        Some((name, found))
    }

    fn resolve_name(&self, rule: Option<&str>) -> Option<String> {
        resolve_name(self.current_rule(), rule)
    }

    fn lookup_rule(&self, op: &str, rule: Option<&str>) -> Option<(String, Arc<Rule>)> {
        lookup_rule(&self.spider, self.current_rule(), op, rule)
    }

    /// The request's rule, once a response is bound.
    fn current_rule(&self) -> Option<&str> {
        self.response.as_ref().map(|_| self.request.rule.as_str())
    }

    pub fn spider(&self) -> &Arc<Spider> {
        &self.spider
    }

    pub fn name(&self) -> &str {
        self.spider.name()
    }

    pub fn rules(&self) -> &HashMap<String, Arc<Rule>> {
        self.spider.rules()
    }

    pub fn rule(&self, name: &str) -> Option<Arc<Rule>> {
        self.spider.get_rule(name)
    }

    pub fn keyin(&self) -> String {
        self.spider.keyin()
    }

    pub fn set_keyin(&mut self, keyin: impl Into<String>) -> &mut Self {
        self.spider.set_keyin(keyin);
        self
    }

    pub fn limit(&self) -> i64 {
        self.spider.limit()
    }

    pub fn set_limit(&mut self, limit: i64) -> &mut Self {
        self.spider.set_limit(limit);
        self
    }

    pub fn set_pausetime(&mut self, pause: i64, runtime: bool) -> &mut Self {
        self.spider.set_pausetime(pause, runtime);
        self
    }

    /// Registers a named timer on the spider; see [`crate::timer::Timers::set`].
    pub fn set_timer(&self, id: &str, tol: Duration, bell: Option<Bell>) -> Result<(), SpiderError> {
        self.spider.set_timer(id, tol, bell)
    }

    /// Blocks rule code until the spider's timer `id` fires.
    pub fn run_timer(&self, id: &str) -> Result<(), SpiderError> {
        self.spider.run_timer(id)
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    pub fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    pub fn rule_name(&self) -> &str {
        &self.request.rule
    }

    /// The request url exactly as submitted, so it matches across retries and redirects.
    pub fn url(&self) -> &str {
        &self.request.url
    }

    pub fn method(&self) -> &str {
        self.request.method()
    }

    /// Host of the effective (post-redirect) url.
    pub fn host(&self) -> Option<String> {
        self.response.as_ref().and_then(Response::host)
    }

    pub fn status_code(&self) -> Option<u16> {
        self.response.as_ref().map(|r| r.status)
    }

    /// Response headers.
    pub fn header(&self) -> Option<&HeaderMap> {
        self.response.as_ref().map(|r| &r.headers)
    }

    /// Headers of the request as it was sent, or as queued when nothing was sent yet.
    pub fn request_header(&self) -> &HeaderMap {
        match &self.response {
            Some(r) => &r.request.headers,
            None => &self.request.header,
        }
    }

    pub fn referer(&self) -> &str {
        header_str(self.request_header(), REFERER.as_str())
    }

    pub fn cookie(&self) -> &str {
        self.response.as_ref().map(Response::cookie).unwrap_or("")
    }
}

/// An explicit name wins; otherwise the current rule, if any.
pub(crate) fn resolve_name(current: Option<&str>, rule: Option<&str>) -> Option<String> {
    rule.or(current).map(str::to_string)
}

/// Resolves a rule for `op`, logging and counting a miss.
pub(crate) fn lookup_rule(
    spider: &Spider,
    current: Option<&str>,
    op: &str,
    rule: Option<&str>,
) -> Option<(String, Arc<Rule>)> {
    let Some(name) = resolve_name(current, rule) else {
        error!(
            "Spider '{}' called {}() without a rule name before a response was bound",
            spider.name(),
            op
        );
        spider.stats().increment_rule_misses();
        return None;
    };
    match spider.get_rule(&name) {
        Some(found) => Some((name, found)),
        None => {
            error!(
                "Spider '{}' called {}() with unknown rule '{}'",
                spider.name(),
                op,
                name
            );
            spider.stats().increment_rule_misses();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::FnRule;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn spider() -> Arc<Spider> {
        Spider::builder(
            "news",
            FnRule::new(|ctx| {
                ctx.set_temp("visited_root", true)?;
                Ok(())
            }),
        )
        .rule(
            "list",
            Rule::new(
                FnRule::new(|ctx| {
                    let page: i64 = ctx.get_temp("page").unwrap_or(1);
                    ctx.output([("page", json!(page))], None);
                    Ok(())
                })
                .with_aid(|ctx, args| {
                    let step = args.get("step").and_then(Value::as_i64).unwrap_or(0);
                    Ok(json!(format!("{}+{}", ctx.rule_name(), step)))
                }),
            ),
        )
        .build()
    }

    #[test]
    fn dispatch_without_response_falls_back_to_root() {
        let spider = spider();
        let mut ctx = ContextPool::new().acquire(&spider, Request::new("http://x.test/", ""));

        ctx.parse(None).unwrap();

        assert_eq!(ctx.get_temp::<bool>("visited_root"), Some(true));
        assert_eq!(spider.stats().root_fallbacks.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.pending_items(), 0);
    }

    #[test]
    fn dispatch_with_response_runs_named_rule() {
        let spider = spider();
        let mut ctx = ContextPool::new().acquire(&spider, Request::new("http://x.test/p", "list"));
        ctx.set_temp("page", 4).unwrap();
        ctx.set_response(Response::new(200, ""));

        ctx.parse(None).unwrap();

        let items = ctx.pull_items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].rule_name, "list");
        assert_eq!(items[0].get("page"), Some(&json!(4)));
    }

    #[test]
    fn explicit_rule_is_recorded_on_request_when_response_bound() {
        let spider = spider();
        let mut ctx = ContextPool::new().acquire(&spider, Request::new("http://x.test/p", "other"));
        ctx.set_response(Response::new(200, ""));

        ctx.parse(Some("list")).unwrap();
        assert_eq!(ctx.rule_name(), "list");

        ctx.parse(Some("missing")).unwrap();
        assert_eq!(ctx.rule_name(), "missing");
        assert_eq!(ctx.get_temp::<bool>("visited_root"), Some(true));
    }

    #[test]
    fn stopped_spider_cancels_dispatch() {
        let spider = spider();
        let mut ctx = ContextPool::new().acquire(&spider, Request::new("http://x.test/p", "list"));
        ctx.set_response(Response::new(200, ""));
        ctx.output([("kept", json!(true))], None);

        spider.stop();
        assert!(matches!(ctx.parse(None), Err(SpiderError::Cancelled(_))));
        assert!(matches!(ctx.aid(&Temp::new(), None), Err(SpiderError::Cancelled(_))));
        assert_eq!(ctx.pull_items().len(), 1);
    }

    #[test]
    fn aid_resolves_rule_and_misses_yield_null() {
        let spider = spider();
        let mut ctx = ContextPool::new().acquire(&spider, Request::new("http://x.test/p", "list"));

        let mut args = Temp::new();
        args.insert("step".into(), json!(2));
        assert_eq!(ctx.aid(&args, None).unwrap(), Value::Null);
        assert_eq!(ctx.aid(&args, Some("list")).unwrap(), json!("list+2"));
        assert_eq!(ctx.aid(&args, Some("nope")).unwrap(), Value::Null);
        assert_eq!(spider.stats().rule_misses.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn field_table_queries_share_resolution() {
        let spider = spider();
        let mut ctx = ContextPool::new().acquire(&spider, Request::new("http://x.test/p", "list"));
        assert_eq!(ctx.upsert_item_field("title", None), None);

        ctx.set_response(Response::new(200, ""));
        assert_eq!(ctx.upsert_item_field("title", None), Some(0));
        assert_eq!(ctx.upsert_item_field("body", Some("list")), Some(1));
        assert_eq!(ctx.item_field(1, None).as_deref(), Some("body"));
        assert_eq!(ctx.item_field_index("title", None), Some(0));
        assert_eq!(ctx.item_fields(None).unwrap(), vec!["title", "body"]);
        assert!(ctx.item_fields(Some("detail")).is_none());

        let named = ctx
            .create_item(BTreeMap::from([(1, json!("B")), (9, json!("lost"))]), None)
            .unwrap();
        assert_eq!(named.get("body"), Some(&json!("B")));
        assert_eq!(named.len(), 1);
    }

    #[test]
    fn request_and_response_accessors() {
        let spider = spider();
        let mut request = Request::new("http://x.test/p", "list");
        request.set_referer("http://x.test/queued");
        let mut ctx = ContextPool::new().acquire(&spider, request);
        assert_eq!(ctx.referer(), "http://x.test/queued");
        assert_eq!(ctx.status_code(), None);
        assert_eq!(ctx.cookie(), "");

        let mut sent = HeaderMap::new();
        sent.insert(REFERER, "http://x.test/sent".parse().unwrap());
        ctx.set_response(
            Response::new(404, "")
                .with_header("Set-Cookie", "sid=9")
                .with_effective_request("http://m.x.test/p", sent),
        );

        assert_eq!(ctx.referer(), "http://x.test/sent");
        assert_eq!(ctx.host().as_deref(), Some("m.x.test"));
        assert_eq!(ctx.status_code(), Some(404));
        assert_eq!(ctx.cookie(), "sid=9");
        assert_eq!(ctx.url(), "http://x.test/p");
        assert_eq!(ctx.method(), "GET");
        assert_eq!(spider.stats().response_status_counts.get(&404).map(|c| *c), Some(1));
    }

    #[test]
    fn rule_code_runs_spider_timers() {
        let spider = Spider::builder(
            "ticker",
            FnRule::new(|ctx| {
                ctx.set_timer("pause", Duration::from_millis(10), None)?;
                ctx.run_timer("pause")?;
                ctx.run_timer("pause")
            }),
        )
        .build();
        let mut ctx = ContextPool::new().acquire(&spider, Request::new("http://x.test/", ""));

        let started = std::time::Instant::now();
        ctx.parse(None).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert!(matches!(ctx.run_timer("missing"), Err(SpiderError::ConfigurationError(_))));
    }

    #[test]
    fn bare_response_keeps_the_queued_request_view() {
        let spider = spider();
        let mut request = Request::new("http://x.test/list/2", "list");
        request.set_referer("http://x.test/list/1");
        let mut ctx = ContextPool::new().acquire(&spider, request);
        ctx.set_response(Response::new(200, "<p/>"));

        assert_eq!(ctx.referer(), "http://x.test/list/1");
        assert_eq!(ctx.host().as_deref(), Some("x.test"));

        ctx.output([("page", json!(2))], None);
        let records = ctx.pull_items();
        assert_eq!(records[0].referer.as_deref(), Some("http://x.test/list/1"));
        assert_eq!(records[0].url.as_deref(), Some("http://x.test/list/2"));
    }
}
