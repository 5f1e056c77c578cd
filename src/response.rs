//! # Response Module
//!
//! The inbound half of a fetch, as delivered by the downloader.
//!
//! The body is a single-read stream: the first read takes ownership of the
//! underlying reader, drains it and drops it, which closes it. Any later read
//! fails with a stream error instead of silently yielding an empty body.
//!
//! A response also remembers the *effective* request that produced it (the
//! url after redirects and the headers actually sent), so host and referer
//! lookups reflect what went over the wire.

use crate::request::header_str;
use http::HeaderMap;
use http::header::{CONTENT_TYPE, REFERER, SET_COOKIE};
use std::fmt;
use std::io::{self, Cursor, Read};
use url::Url;

/// A response body that can be read exactly once.
pub struct Body {
    reader: Option<Box<dyn Read + Send>>,
}

impl Body {
    pub fn from_reader(reader: impl Read + Send + 'static) -> Self {
        Body {
            reader: Some(Box::new(reader)),
        }
    }

    pub fn empty() -> Self {
        Body::from(Vec::new())
    }

    /// Whether the stream has already been consumed.
    pub fn is_consumed(&self) -> bool {
        self.reader.is_none()
    }

    /// Reads the whole stream into memory and closes it.
    pub fn read_all(&mut self) -> io::Result<Vec<u8>> {
        let mut reader = self
            .reader
            .take()
            .ok_or_else(|| io::Error::other("response body already consumed"))?;
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Body::from_reader(Cursor::new(bytes))
    }
}

impl From<&'static [u8]> for Body {
    fn from(bytes: &'static [u8]) -> Self {
        Body::from_reader(bytes)
    }
}

impl From<&'static str> for Body {
    fn from(text: &'static str) -> Self {
        Body::from_reader(text.as_bytes())
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Body::from(text.into_bytes())
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Body")
            .field("consumed", &self.is_consumed())
            .finish()
    }
}

/// The request as it was actually sent.
#[derive(Debug, Clone, Default)]
pub struct EffectiveRequest {
    pub url: String,
    pub headers: HeaderMap,
}

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Body,
    pub request: EffectiveRequest,
}

impl Response {
    pub fn new(status: u16, body: impl Into<Body>) -> Self {
        Response {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
            request: EffectiveRequest::default(),
        }
    }

    /// Adds a response header; invalid names or values are ignored.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            http::HeaderName::from_bytes(name.as_bytes()),
            http::HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn with_effective_request(mut self, url: impl Into<String>, headers: HeaderMap) -> Self {
        self.request = EffectiveRequest {
            url: url.into(),
            headers,
        };
        self
    }

    pub fn content_type(&self) -> &str {
        header_str(&self.headers, CONTENT_TYPE.as_str())
    }

    /// The `Set-Cookie` header, or an empty string.
    pub fn cookie(&self) -> &str {
        header_str(&self.headers, SET_COOKIE.as_str())
    }

    /// The `Referer` header of the effective request.
    pub fn referer(&self) -> &str {
        header_str(&self.request.headers, REFERER.as_str())
    }

    /// Host of the effective url, if it parses.
    pub fn host(&self) -> Option<String> {
        Url::parse(&self.request.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
    }
}
