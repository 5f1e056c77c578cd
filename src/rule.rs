//! # Rule Module
//!
//! Defines the capability contract a rule must satisfy to be dispatched by a
//! scrape context, and the per-rule field table records are aligned against.
//!
//! ## Overview
//!
//! How rules are authored is not this crate's business: a rule may be a
//! native closure, a compiled plugin or a script-backed shim. The context
//! only depends on [`RuleHandler`]: a `parse` entry point that receives the
//! context as its execution environment, and an optional auxiliary `aid`
//! entry point that takes a loose argument map and returns a JSON value.
//!
//! Each named [`Rule`] additionally owns an ordered field table. Indices are
//! assigned in insertion order, names are unique and the table only grows,
//! so a field index stays valid for the lifetime of the spider.
//!
//! ## Example
//!
//! ```rust,ignore
//! use spider_context::rule::{FnRule, Rule, RuleTree};
//!
//! let tree = RuleTree::new(FnRule::new(|ctx| {
//!     ctx.add_queue(Request::new("http://x.test/list", "list"))
//! }))
//! .add_rule("list", Rule::from_fn(|ctx| {
//!     let title = ctx.document()?.root_element().text().collect::<String>();
//!     ctx.output([("title", title.into())], None);
//!     Ok(())
//! }).with_fields(["title"]));
//! ```

use crate::context::ScrapeContext;
use crate::error::SpiderError;
use crate::request::Temp;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// The contract every rule exposes to the scrape context.
pub trait RuleHandler: Send + Sync {
    /// Parses the context's response, emitting records, files or new requests.
    fn parse(&self, ctx: &mut ScrapeContext) -> Result<(), SpiderError>;

    /// Auxiliary computation invoked through [`ScrapeContext::aid`].
    fn aid(&self, _ctx: &mut ScrapeContext, _args: &Temp) -> Result<Value, SpiderError> {
        Ok(Value::Null)
    }
}

pub type ParseFn = Box<dyn Fn(&mut ScrapeContext) -> Result<(), SpiderError> + Send + Sync>;
pub type AidFn = Box<dyn Fn(&mut ScrapeContext, &Temp) -> Result<Value, SpiderError> + Send + Sync>;

/// A rule built from native closures.
pub struct FnRule {
    parse: ParseFn,
    aid: Option<AidFn>,
}

impl FnRule {
    pub fn new<F>(parse: F) -> Self
    where
        F: Fn(&mut ScrapeContext) -> Result<(), SpiderError> + Send + Sync + 'static,
    {
        FnRule {
            parse: Box::new(parse),
            aid: None,
        }
    }

    pub fn with_aid<F>(mut self, aid: F) -> Self
    where
        F: Fn(&mut ScrapeContext, &Temp) -> Result<Value, SpiderError> + Send + Sync + 'static,
    {
        self.aid = Some(Box::new(aid));
        self
    }
}

impl RuleHandler for FnRule {
    fn parse(&self, ctx: &mut ScrapeContext) -> Result<(), SpiderError> {
        (self.parse)(ctx)
    }

    fn aid(&self, ctx: &mut ScrapeContext, args: &Temp) -> Result<Value, SpiderError> {
        match &self.aid {
            Some(aid) => aid(ctx, args),
            None => Ok(Value::Null),
        }
    }
}

/// A named rule: a handler plus its append-only field table.
pub struct Rule {
    handler: Box<dyn RuleHandler>,
    fields: RwLock<Vec<String>>,
}

impl Rule {
    pub fn new(handler: impl RuleHandler + 'static) -> Self {
        Rule {
            handler: Box::new(handler),
            fields: RwLock::new(Vec::new()),
        }
    }

    pub fn from_fn<F>(parse: F) -> Self
    where
        F: Fn(&mut ScrapeContext) -> Result<(), SpiderError> + Send + Sync + 'static,
    {
        Rule::new(FnRule::new(parse))
    }

    /// Pre-registers field names; duplicates keep their first index.
    pub fn with_fields<I, S>(self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for field in fields {
            self.upsert_field(field.as_ref());
        }
        self
    }

    pub fn parse(&self, ctx: &mut ScrapeContext) -> Result<(), SpiderError> {
        self.handler.parse(ctx)
    }

    pub fn aid(&self, ctx: &mut ScrapeContext, args: &Temp) -> Result<Value, SpiderError> {
        self.handler.aid(ctx, args)
    }

    /// Returns the index of `field`, appending it first if it is new.
    pub fn upsert_field(&self, field: &str) -> usize {
        if let Some(index) = self.field_index(field) {
            return index;
        }
        let mut fields = self.fields.write();
        // Another writer may have appended it between the two locks.
        if let Some(index) = fields.iter().position(|f| f == field) {
            return index;
        }
        fields.push(field.to_string());
        fields.len() - 1
    }

    pub fn field(&self, index: usize) -> Option<String> {
        self.fields.read().get(index).cloned()
    }

    pub fn field_index(&self, field: &str) -> Option<usize> {
        self.fields.read().iter().position(|f| f == field)
    }

    pub fn fields(&self) -> Vec<String> {
        self.fields.read().clone()
    }

    pub fn field_count(&self) -> usize {
        self.fields.read().len()
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("fields", &*self.fields.read())
            .finish_non_exhaustive()
    }
}

/// A spider's rules: the root handler for seed requests plus the named rules.
pub struct RuleTree {
    root: Box<dyn RuleHandler>,
    trunk: HashMap<String, Arc<Rule>>,
}

impl RuleTree {
    pub fn new(root: impl RuleHandler + 'static) -> Self {
        RuleTree {
            root: Box::new(root),
            trunk: HashMap::new(),
        }
    }

    pub fn add_rule(mut self, name: impl Into<String>, rule: Rule) -> Self {
        self.trunk.insert(name.into(), Arc::new(rule));
        self
    }

    pub fn root(&self) -> &dyn RuleHandler {
        self.root.as_ref()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Rule>> {
        self.trunk.get(name).cloned()
    }

    pub fn rules(&self) -> &HashMap<String, Arc<Rule>> {
        &self.trunk
    }
}

impl fmt::Debug for RuleTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleTree")
            .field("trunk", &self.trunk)
            .finish_non_exhaustive()
    }
}
