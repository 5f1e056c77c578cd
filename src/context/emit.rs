//! Record and file emission.
//!
//! Emitted outputs accumulate in two append-only buffers shared by the
//! context and every [`Emitter`] cloned from it. The worker drains them after
//! parse with [`ScrapeContext::pull_items`] and
//! [`ScrapeContext::pull_files`]; each drain hands over everything emitted so
//! far in emission order.

use super::{ScrapeContext, lookup_rule};
use crate::error::SpiderError;
use crate::item::{FileCell, Item, Record};
use crate::rule::Rule;
use crate::spider::Spider;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{trace, warn};
use url::Url;

const DEFAULT_FILE_BASE: &str = "index";
const DEFAULT_FILE_EXT: &str = ".html";

#[derive(Debug, Default)]
pub(crate) struct Outputs {
    pub(crate) items: Vec<Record>,
    pub(crate) files: Vec<FileCell>,
}

impl Outputs {
    /// Truncates both buffers, keeping their allocations.
    pub(crate) fn clear(&mut self) {
        self.items.clear();
        self.files.clear();
    }
}

/// A cloneable, thread-safe handle for emitting records into a context.
///
/// Rule code that fans work out to helper threads hands each thread an
/// emitter. The rule name, url and referer are captured when the emitter is
/// created. An emitter that outlives its cycle keeps writing into buffers
/// the pool no longer hands out, so late emissions are dropped, never leaked
/// into the next cycle.
#[derive(Clone)]
pub struct Emitter {
    spider: Arc<Spider>,
    outputs: Arc<Mutex<Outputs>>,
    current_rule: Option<String>,
    url: String,
    referer: String,
}

impl Emitter {
    pub(super) fn new(
        spider: Arc<Spider>,
        outputs: Arc<Mutex<Outputs>>,
        current_rule: Option<String>,
        url: String,
        referer: String,
    ) -> Self {
        Emitter {
            spider,
            outputs,
            current_rule,
            url,
            referer,
        }
    }

    /// Emits a record for the resolved rule.
    ///
    /// Named fields are registered in the rule's field table as a side
    /// effect. Indexed fields are translated through it; indices the table
    /// does not know are dropped with a warning.
    pub fn output(&self, item: impl Into<Item>, rule: Option<&str>) {
        let Some((name, found)) = lookup_rule(&self.spider, self.current_rule.as_deref(), "output", rule)
        else {
            return;
        };

        let fields = match item.into() {
            Item::Indexed(fields) => translate_indexed(&name, &found, fields),
            Item::Named(fields) => {
                for key in fields.keys() {
                    found.upsert_field(key);
                }
                fields
            }
        };

        let record = if self.spider.not_default_field() {
            Record::bare(name, fields)
        } else {
            Record::with_metadata(name, fields, self.url.as_str(), self.referer.as_str())
        };
        self.outputs.lock().items.push(record);
        self.spider.stats().increment_records_emitted();
    }
}

impl ScrapeContext {
    /// Emits a record; see [`Emitter::output`].
    pub fn output(&self, item: impl Into<Item>, rule: Option<&str>) {
        self.emitter().output(item, rule);
    }

    /// Emits the whole response body as a file.
    ///
    /// The name comes from the last path segment of the request url; `name`
    /// overrides its base name and, when it carries one, its extension.
    pub fn file_output(&mut self, name: Option<&str>) -> Result<(), SpiderError> {
        let response = self.response.as_mut().ok_or(SpiderError::NoResponse)?;
        let bytes = response.body.read_all()?;
        let stats = self.spider.stats();
        stats.add_bytes_materialized(bytes.len());

        let file_name = derive_filename(&self.request.url, name);
        trace!("Emitting file '{}' ({} bytes) from {}", file_name, bytes.len(), self.request.url);
        self.outputs
            .lock()
            .files
            .push(FileCell::new(self.request.rule.as_str(), file_name, bytes));
        stats.increment_files_emitted();
        Ok(())
    }
}

pub(crate) fn translate_indexed(
    rule_name: &str,
    rule: &Rule,
    fields: BTreeMap<usize, Value>,
) -> Map<String, Value> {
    let mut named = Map::with_capacity(fields.len());
    for (index, value) in fields {
        match rule.field(index) {
            Some(field) => {
                named.insert(field, value);
            }
            None => warn!(
                "Rule '{}' has no field at index {}, value dropped",
                rule_name, index
            ),
        }
    }
    named
}

/// Derives a file name from a url and an optional override.
///
/// The url's last path segment (query and fragment stripped) is split at its
/// last dot. A non-empty override base replaces the url's base; an override
/// extension replaces the url's extension. Missing parts fall back to
/// `index` and `.html`.
pub fn derive_filename(url: &str, name: Option<&str>) -> String {
    let path = match Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.split(['?', '#']).next().unwrap_or_default().to_string(),
    };
    let segment = path.rsplit('/').next().unwrap_or_default();
    let (url_base, url_ext) = split_ext(segment);

    let mut base = url_base.to_string();
    let mut ext = url_ext;
    if let Some(name) = name {
        let (dir, file) = match name.rfind('/') {
            Some(i) => name.split_at(i + 1),
            None => ("", name),
        };
        let (name_base, name_ext) = split_ext(file);
        if !name_base.is_empty() {
            base = format!("{dir}{name_base}");
        }
        if !name_ext.is_empty() {
            ext = name_ext;
        }
    }

    if base.is_empty() {
        base = DEFAULT_FILE_BASE.to_string();
    }
    if ext.is_empty() {
        ext = DEFAULT_FILE_EXT;
    }
    base + ext
}

fn split_ext(file: &str) -> (&str, &str) {
    match file.rfind('.') {
        Some(i) => file.split_at(i),
        None => (file, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextPool;
    use crate::request::Request;
    use crate::response::Response;
    use crate::rule::FnRule;
    use http::HeaderMap;
    use http::header::REFERER;
    use serde_json::json;

    fn spider(not_default_field: bool) -> Arc<Spider> {
        Spider::builder("news", FnRule::new(|_| Ok(())))
            .rule("list", Rule::from_fn(|_| Ok(())).with_fields(["title", "body"]))
            .not_default_field(not_default_field)
            .build()
    }

    fn bound(spider: &Arc<Spider>, url: &str) -> ScrapeContext {
        let mut ctx = ContextPool::new().acquire(spider, Request::new(url, "list"));
        let mut sent = HeaderMap::new();
        sent.insert(REFERER, "http://x.test/index".parse().unwrap());
        ctx.set_response(Response::new(200, "<html></html>").with_effective_request(url, sent));
        ctx
    }

    #[test]
    fn filenames_from_url_and_override() {
        assert_eq!(derive_filename("http://x.test/a/report.csv?x=1", None), "report.csv");
        assert_eq!(derive_filename("http://x.test/a/report.csv?x=1", Some("out")), "out.csv");
        assert_eq!(derive_filename("http://x.test/a/report.csv", Some("out.txt")), "out.txt");
        assert_eq!(derive_filename("http://x.test/a/page", None), "page.html");
        assert_eq!(derive_filename("http://x.test/", None), "index.html");
        assert_eq!(derive_filename("http://x.test", None), "index.html");
        assert_eq!(derive_filename("http://x.test/a.tar.gz", None), "a.tar.gz");
        assert_eq!(derive_filename("http://x.test/q?next=/a/b.pdf", None), "q.html");
        assert_eq!(derive_filename("http://x.test/r.csv", Some("dump/r2")), "dump/r2.csv");
    }

    #[test]
    fn named_output_registers_fields_and_stamps_metadata() {
        let spider = spider(false);
        let ctx = bound(&spider, "http://x.test/p/1");

        ctx.output([("title", json!("T")), ("author", json!("A"))], None);

        let rule = spider.get_rule("list").unwrap();
        assert_eq!(rule.fields(), vec!["title", "body", "author"]);

        let items = ctx.pull_items();
        assert_eq!(items.len(), 1);
        let record = &items[0];
        assert_eq!(record.rule_name, "list");
        assert_eq!(record.get("author"), Some(&json!("A")));
        assert_eq!(record.url.as_deref(), Some("http://x.test/p/1"));
        assert_eq!(record.referer.as_deref(), Some("http://x.test/index"));
        assert!(record.captured_at.is_some());
    }

    #[test]
    fn indexed_output_translates_without_registering() {
        let spider = spider(false);
        let ctx = bound(&spider, "http://x.test/p/1");

        ctx.output([(1usize, json!("B")), (7, json!("lost"))], None);

        let items = ctx.pull_items();
        assert_eq!(items[0].fields.len(), 1);
        assert_eq!(items[0].get("body"), Some(&json!("B")));
        assert_eq!(spider.get_rule("list").unwrap().field_count(), 2);
    }

    #[test]
    fn default_fields_can_be_suppressed() {
        let spider = spider(true);
        let ctx = bound(&spider, "http://x.test/p/1");
        ctx.output([("title", json!("T"))], None);

        let record = &ctx.pull_items()[0];
        assert!(record.url.is_none());
        assert!(record.referer.is_none());
        assert!(record.captured_at.is_none());
    }

    #[test]
    fn unresolved_output_is_dropped() {
        let spider = spider(false);
        let ctx = ContextPool::new().acquire(&spider, Request::new("http://x.test/", "list"));
        ctx.output([("title", json!("T"))], None);
        ctx.output([("title", json!("T"))], Some("detail"));

        assert_eq!(ctx.pending_items(), 0);
        assert_eq!(spider.stats().rule_misses.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn drain_preserves_order_and_empties_buffer() {
        let spider = spider(false);
        let ctx = bound(&spider, "http://x.test/p/1");
        for i in 0..3 {
            ctx.output([("title", json!(i))], None);
        }

        let titles: Vec<_> = ctx.pull_items().iter().map(|r| r.get("title").cloned()).collect();
        assert_eq!(titles, vec![Some(json!(0)), Some(json!(1)), Some(json!(2))]);
        assert_eq!(ctx.pending_items(), 0);
        assert!(ctx.pull_items().is_empty());
    }

    #[test]
    fn helper_threads_emit_concurrently() {
        let spider = spider(false);
        let ctx = bound(&spider, "http://x.test/p/1");
        let emitter = ctx.emitter();

        std::thread::scope(|s| {
            for worker in 0..4 {
                let emitter = emitter.clone();
                s.spawn(move || {
                    for n in 0..25 {
                        emitter.output([("title", json!(format!("{worker}-{n}")))], None);
                    }
                });
            }
        });

        let items = ctx.pull_items();
        assert_eq!(items.len(), 100);
        assert!(items.iter().all(|r| r.rule_name == "list"));
    }

    #[test]
    fn draining_during_emission_loses_nothing() {
        let spider = spider(false);
        let ctx = bound(&spider, "http://x.test/p/1");
        let emitter = ctx.emitter();

        let mut drained = 0;
        std::thread::scope(|s| {
            for worker in 0..4 {
                let emitter = emitter.clone();
                s.spawn(move || {
                    for n in 0..500 {
                        emitter.output([("title", json!(format!("{worker}-{n}")))], None);
                    }
                });
            }
            for _ in 0..200 {
                drained += ctx.pull_items().len();
                std::thread::yield_now();
            }
        });
        drained += ctx.pull_items().len();

        assert_eq!(drained, 2000);
        assert_eq!(ctx.pending_items(), 0);
    }

    #[test]
    fn file_output_reads_the_body_once() {
        let spider = spider(false);
        let mut ctx = ContextPool::new().acquire(&spider, Request::new("http://x.test/a/report.csv?x=1", "list"));
        ctx.set_response(Response::new(200, "a,b\n1,2\n"));

        ctx.file_output(None).unwrap();
        let files = ctx.pull_files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "report.csv");
        assert_eq!(files[0].rule_name, "list");
        assert_eq!(files[0].bytes, b"a,b\n1,2\n");

        assert!(matches!(ctx.file_output(None), Err(SpiderError::Io(_))));
        assert!(ctx.text().is_err());
    }
}
