//! # Request Module
//!
//! The outbound half of a fetch: what to download, how, and which rule of
//! which spider should parse the result.
//!
//! ## Overview
//!
//! A `Request` is created by rule code (or by a spider's root handler), is
//! freely mutable until it is handed to [`Request::prepare`], and is then
//! owned by exactly one scrape context at a time. Besides the HTTP-level
//! fields it carries a `temp` store: a small JSON map rule code uses to pass
//! values from one parse step to the next.
//!
//! `prepare` is the single normalization point. It validates the url and the
//! target rule, upper-cases the method and resolves every "unset" parameter
//! to its default, so a prepared request never has to be re-checked
//! downstream.

mod dynamic;

use crate::error::SpiderError;
use http::HeaderMap;
use http::header::{CONTENT_TYPE, REFERER};
use http::HeaderValue;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

/// Per-request scratch space shared between parse steps.
pub type Temp = HashMap<String, Value>;

/// Downloader id of the primary, high-concurrency HTTP engine.
pub const DOWNLOADER_HTTP: i32 = 0;
/// Downloader id of the alternate, browser-backed engine.
pub const DOWNLOADER_BROWSER: i32 = 1;

pub const DEFAULT_METHOD: &str = "GET";
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_CONN_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_TRY_TIMES: i32 = 3;
pub const DEFAULT_RETRY_PAUSE: Duration = Duration::from_secs(2);

/// A timeout parameter that may be left to the default or disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Timeout {
    /// Resolved to the crate default by [`Request::prepare`].
    #[default]
    Default,
    /// No limit at all.
    Unlimited,
    After(Duration),
}

impl Timeout {
    /// Interprets a signed nanosecond count: negative disables the limit,
    /// zero asks for the default.
    pub fn from_nanos(nanos: i64) -> Self {
        match nanos {
            n if n < 0 => Timeout::Unlimited,
            0 => Timeout::Default,
            n => Timeout::After(Duration::from_nanos(n as u64)),
        }
    }

    fn or_default(self, default: Duration) -> Self {
        match self {
            Timeout::Default => Timeout::After(default),
            other => other,
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        match self {
            Timeout::After(d) => Some(*d),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Request {
    /// The url exactly as submitted (after `prepare`, re-serialized).
    pub url: String,
    /// Name of the rule that parses the response.
    pub rule: String,
    pub method: String,
    pub header: HeaderMap,
    pub post_data: String,
    pub temp: Temp,
    /// Skip visited-request dedup for this request.
    pub reloadable: bool,
    pub dial_timeout: Timeout,
    pub conn_timeout: Timeout,
    pub retry_pause: Option<Duration>,
    /// Maximum download attempts; negative means unlimited.
    pub try_times: i32,
    /// Maximum redirects; zero means unlimited, negative forbids redirects.
    pub redirect_times: i32,
    pub priority: i32,
    pub downloader_id: i32,
    pub(crate) spider: String,
    pub(crate) enable_cookie: bool,
}

impl Request {
    /// Creates a GET request for `url`, parsed by rule `rule`.
    pub fn new(url: impl Into<String>, rule: impl Into<String>) -> Self {
        Request {
            url: url.into(),
            rule: rule.into(),
            ..Default::default()
        }
    }

    /// Validates the request and fills in every default.
    pub fn prepare(&mut self) -> Result<&mut Self, SpiderError> {
        if self.url.trim().is_empty() {
            return Err(SpiderError::InvalidRequest(format!(
                "spider '{}': request url is empty",
                self.spider
            )));
        }
        let parsed = Url::parse(self.url.trim()).map_err(|e| {
            SpiderError::InvalidRequest(format!("spider '{}': url '{}': {}", self.spider, self.url, e))
        })?;
        self.url = parsed.to_string();

        if self.rule.is_empty() {
            return Err(SpiderError::InvalidRequest(format!(
                "spider '{}': request for '{}' names no rule",
                self.spider, self.url
            )));
        }

        if self.method.is_empty() {
            self.method = DEFAULT_METHOD.to_string();
        } else {
            self.method = self.method.to_uppercase();
        }

        self.dial_timeout = self.dial_timeout.or_default(DEFAULT_DIAL_TIMEOUT);
        self.conn_timeout = self.conn_timeout.or_default(DEFAULT_CONN_TIMEOUT);
        if self.try_times == 0 {
            self.try_times = DEFAULT_TRY_TIMES;
        }
        if self.retry_pause.is_none_or(|p| p.is_zero()) {
            self.retry_pause = Some(DEFAULT_RETRY_PAUSE);
        }
        if self.priority < 0 {
            self.priority = 0;
        }
        if !(DOWNLOADER_HTTP..=DOWNLOADER_BROWSER).contains(&self.downloader_id) {
            self.downloader_id = DOWNLOADER_HTTP;
        }
        Ok(self)
    }

    pub fn spider_name(&self) -> &str {
        &self.spider
    }

    pub fn set_spider_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.spider = name.into();
        self
    }

    pub fn enable_cookie(&self) -> bool {
        self.enable_cookie
    }

    pub fn set_enable_cookie(&mut self, enable: bool) -> &mut Self {
        self.enable_cookie = enable;
        self
    }

    pub fn rule_name(&self) -> &str {
        &self.rule
    }

    pub fn set_rule_name(&mut self, rule: impl Into<String>) -> &mut Self {
        self.rule = rule.into();
        self
    }

    pub fn method(&self) -> &str {
        if self.method.is_empty() {
            DEFAULT_METHOD
        } else {
            &self.method
        }
    }

    /// The `Referer` header, or an empty string.
    pub fn referer(&self) -> &str {
        header_str(&self.header, REFERER.as_str())
    }

    /// Sets the `Referer` header; values that are not valid header text are ignored.
    pub fn set_referer(&mut self, referer: &str) -> &mut Self {
        if let Ok(value) = HeaderValue::from_str(referer) {
            self.header.insert(REFERER, value);
        }
        self
    }

    pub fn content_type(&self) -> &str {
        header_str(&self.header, CONTENT_TYPE.as_str())
    }

    pub fn set_temp<T: Serialize>(&mut self, key: impl Into<String>, value: T) -> Result<&mut Self, SpiderError> {
        self.temp.insert(key.into(), serde_json::to_value(value)?);
        Ok(self)
    }

    /// Reads a temp value back into `T`; `None` when absent or of another shape.
    pub fn get_temp<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.temp
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn temps(&self) -> &Temp {
        &self.temp
    }

    /// Stable identity used for visited-request dedup.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.method().as_bytes());
        hasher.update(b"\n");
        hasher.update(self.url.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.post_data.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}
