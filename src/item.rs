//! # Item Module
//!
//! Value types produced by rule code and handed to the collection pipeline.
//!
//! ## Overview
//!
//! A [`Record`] is one structured result: the rule that produced it, its
//! field-name to value mapping, and (unless the spider suppresses them) the
//! source url, referer and capture time. A [`FileCell`] is one raw file
//! payload with the filename it should be written under. Both are built once
//! by the emission calls on the scrape context and never mutated afterwards.
//!
//! [`Item`] is the input shape accepted by emission: fields keyed either by
//! their position in the rule's field table or by free-form name.

use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::collections::HashMap;

/// Timestamp layout used when rendering `captured_at` for text sinks.
pub const CAPTURE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Fields handed to an emission call.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    /// Keyed by index into the rule's existing field table.
    Indexed(BTreeMap<usize, Value>),
    /// Keyed by field name; unknown names are registered on the rule.
    Named(Map<String, Value>),
}

impl Item {
    pub fn len(&self) -> usize {
        match self {
            Item::Indexed(fields) => fields.len(),
            Item::Named(fields) => fields.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<BTreeMap<usize, Value>> for Item {
    fn from(fields: BTreeMap<usize, Value>) -> Self {
        Item::Indexed(fields)
    }
}

impl From<HashMap<usize, Value>> for Item {
    fn from(fields: HashMap<usize, Value>) -> Self {
        Item::Indexed(fields.into_iter().collect())
    }
}

impl From<Map<String, Value>> for Item {
    fn from(fields: Map<String, Value>) -> Self {
        Item::Named(fields)
    }
}

impl From<HashMap<String, Value>> for Item {
    fn from(fields: HashMap<String, Value>) -> Self {
        Item::Named(fields.into_iter().collect())
    }
}

impl<const N: usize> From<[(&str, Value); N]> for Item {
    fn from(fields: [(&str, Value); N]) -> Self {
        Item::Named(
            fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }
}

impl<const N: usize> From<[(usize, Value); N]> for Item {
    fn from(fields: [(usize, Value); N]) -> Self {
        Item::Indexed(fields.into_iter().collect())
    }
}

/// One structured record emitted by a rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub rule_name: String,
    pub fields: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub captured_at: Option<DateTime<Local>>,
}

impl Record {
    /// Builds a record carrying only the rule name and fields.
    pub fn bare(rule_name: impl Into<String>, fields: Map<String, Value>) -> Self {
        Record {
            rule_name: rule_name.into(),
            fields,
            url: None,
            referer: None,
            captured_at: None,
        }
    }

    /// Builds a record stamped with the default metadata fields.
    pub fn with_metadata(
        rule_name: impl Into<String>,
        fields: Map<String, Value>,
        url: impl Into<String>,
        referer: impl Into<String>,
    ) -> Self {
        Record {
            rule_name: rule_name.into(),
            fields,
            url: Some(url.into()),
            referer: Some(referer.into()),
            captured_at: Some(Local::now()),
        }
    }

    /// Capture time rendered with [`CAPTURE_TIME_FORMAT`].
    pub fn captured_at_string(&self) -> Option<String> {
        self.captured_at
            .map(|t| t.format(CAPTURE_TIME_FORMAT).to_string())
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

/// One raw file payload emitted by a rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileCell {
    pub rule_name: String,
    pub name: String,
    #[serde(skip)]
    pub bytes: Vec<u8>,
}

impl FileCell {
    pub fn new(rule_name: impl Into<String>, name: impl Into<String>, bytes: Vec<u8>) -> Self {
        FileCell {
            rule_name: rule_name.into(),
            name: name.into(),
            bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
