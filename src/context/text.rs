//! Lazy text and document views over the response body.
//!
//! The body stream is read at most once. The first call to
//! [`ScrapeContext::text`] reads it in full, transcodes it to UTF-8 when the
//! declared charset asks for it, and caches the result; the document tree is
//! parsed from that cached text on first use of [`ScrapeContext::document`].

use super::ScrapeContext;
use crate::error::SpiderError;
use crate::request::DOWNLOADER_HTTP;
use encoding_rs::{Encoding, UTF_8};
use scraper::Html;
use tracing::{debug, warn};

/// Labels that mean "already UTF-8". The empty label is an undeclared charset.
const UTF8_LABELS: [&str; 4] = ["", "utf8", "utf-8", "unicode-1-1-utf-8"];

/// How a response body becomes text.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decoding {
    /// Use the bytes as they are.
    Passthrough,
    Transcode(&'static Encoding),
    /// A charset was declared but is not a known encoding label.
    Unknown,
}

/// Extracts the lower-cased `charset` parameter of a Content-Type value.
pub fn declared_charset(content_type: &str) -> Option<String> {
    if content_type.trim().is_empty() {
        return None;
    }
    let charset = match content_type.parse::<mime::Mime>() {
        Ok(parsed) => parsed
            .get_param(mime::CHARSET)
            .map(|v| v.as_str().to_string()),
        // Tolerate values the strict parser rejects, e.g. a bare `charset=gbk`.
        Err(_) => content_type
            .split(';')
            .filter_map(|part| part.split_once('='))
            .find(|(key, _)| key.trim().eq_ignore_ascii_case("charset"))
            .map(|(_, value)| value.to_string()),
    }?;
    Some(charset.trim().trim_matches('"').trim().to_ascii_lowercase())
}

/// Picks the decoding strategy for a body.
///
/// Only bodies fetched by the HTTP downloader are sniffed; the browser
/// downloader already hands over UTF-8 text. The response's declared charset
/// wins over the request's.
pub fn resolve_encoding(downloader_id: i32, response_content_type: &str, request_content_type: &str) -> Decoding {
    if downloader_id != DOWNLOADER_HTTP {
        return Decoding::Passthrough;
    }
    let label = declared_charset(response_content_type)
        .or_else(|| declared_charset(request_content_type))
        .unwrap_or_default();
    if UTF8_LABELS.contains(&label.as_str()) {
        return Decoding::Passthrough;
    }
    match Encoding::for_label(label.as_bytes()) {
        Some(encoding) if encoding == UTF_8 => Decoding::Passthrough,
        Some(encoding) => Decoding::Transcode(encoding),
        None => Decoding::Unknown,
    }
}

fn into_text(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

impl ScrapeContext {
    /// The response body as text, read and decoded on first call.
    ///
    /// A failure while reading the body is fatal to the cycle. An unknown
    /// charset is not: the raw bytes are used and a warning is logged.
    pub fn text(&mut self) -> Result<&str, SpiderError> {
        let text = match self.text.take() {
            Some(text) => text,
            None => self.materialize_text()?,
        };
        Ok(self.text.insert(text).as_str())
    }

    /// The parsed document, built from [`text`](Self::text) on first call.
    pub fn document(&mut self) -> Result<&Html, SpiderError> {
        let dom = match self.dom.take() {
            Some(dom) => dom,
            None => Html::parse_document(self.text()?),
        };
        Ok(self.dom.insert(dom))
    }

    /// Replaces the cached text and drops any document parsed from the old one.
    pub fn reset_text(&mut self, body: impl Into<String>) -> &mut Self {
        self.text = Some(body.into());
        self.dom = None;
        self
    }

    fn materialize_text(&mut self) -> Result<String, SpiderError> {
        let stats = self.spider.stats();
        let response = self.response.as_mut().ok_or(SpiderError::NoResponse)?;
        let bytes = response.body.read_all()?;
        stats.add_bytes_materialized(bytes.len());

        let decoding = resolve_encoding(
            self.request.downloader_id,
            response.content_type(),
            self.request.content_type(),
        );
        match decoding {
            Decoding::Passthrough => Ok(into_text(bytes)),
            Decoding::Transcode(encoding) => {
                debug!("Transcoding {} from {}", self.request.url, encoding.name());
                let (text, had_errors) = encoding.decode_without_bom_handling(&bytes);
                if had_errors {
                    debug!("Malformed {} sequences replaced in {}", encoding.name(), self.request.url);
                }
                Ok(text.into_owned())
            }
            Decoding::Unknown => {
                warn!(
                    "Unsupported charset for {} (response '{}', request '{}'), using raw bytes",
                    self.request.url,
                    response.content_type(),
                    self.request.content_type()
                );
                stats.increment_transcode_fallbacks();
                Ok(into_text(bytes))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextPool;
    use crate::request::{DOWNLOADER_BROWSER, Request};
    use crate::response::{Body, Response};
    use crate::rule::FnRule;
    use crate::spider::Spider;
    use scraper::Selector;
    use std::io::{self, Read};
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    const GBK_NIHAO: &[u8] = &[0xC4, 0xE3, 0xBA, 0xC3];

    fn spider() -> Arc<Spider> {
        Spider::builder("news", FnRule::new(|_| Ok(()))).build()
    }

    struct Broken;

    impl Read for Broken {
        fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer"))
        }
    }

    #[test]
    fn charset_parameter_extraction() {
        assert_eq!(declared_charset("text/html; charset=GBK").as_deref(), Some("gbk"));
        assert_eq!(declared_charset("text/html; charset=\"utf-8\"").as_deref(), Some("utf-8"));
        assert_eq!(declared_charset("text/html").as_deref(), None);
        assert_eq!(declared_charset("").as_deref(), None);
    }

    #[test]
    fn resolution_prefers_response_and_skips_browser() {
        assert_eq!(
            resolve_encoding(DOWNLOADER_HTTP, "text/html; charset=gbk", "text/html; charset=utf-8"),
            Decoding::Transcode(encoding_rs::GBK)
        );
        assert_eq!(
            resolve_encoding(DOWNLOADER_HTTP, "text/html", "application/x-www-form-urlencoded; charset=gbk"),
            Decoding::Transcode(encoding_rs::GBK)
        );
        assert_eq!(
            resolve_encoding(DOWNLOADER_HTTP, "text/html; charset=UTF8", ""),
            Decoding::Passthrough
        );
        assert_eq!(
            resolve_encoding(DOWNLOADER_BROWSER, "text/html; charset=gbk", ""),
            Decoding::Passthrough
        );
        assert_eq!(
            resolve_encoding(DOWNLOADER_HTTP, "text/html; charset=x-klingon", ""),
            Decoding::Unknown
        );
    }

    #[test]
    fn gbk_body_is_transcoded_and_cached() {
        let spider = spider();
        let mut ctx = ContextPool::new().acquire(&spider, Request::new("http://x.test/", "list"));
        ctx.set_response(
            Response::new(200, GBK_NIHAO).with_header("Content-Type", "text/html; charset=gbk"),
        );

        assert_eq!(ctx.text().unwrap(), "你好");
        // The body is consumed; a second call is served from the cache.
        assert_eq!(ctx.text().unwrap(), "你好");
        assert_eq!(spider.stats().bytes_materialized.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn request_content_type_is_the_fallback_declaration() {
        let spider = spider();
        let mut request = Request::new("http://x.test/", "list");
        request.header.insert(
            http::header::CONTENT_TYPE,
            "text/html; charset=gbk".parse().unwrap(),
        );
        let mut ctx = ContextPool::new().acquire(&spider, request);
        ctx.set_response(Response::new(200, GBK_NIHAO));

        assert_eq!(ctx.text().unwrap(), "你好");
    }

    #[test]
    fn unknown_charset_falls_back_to_raw_bytes() {
        let spider = spider();
        let mut ctx = ContextPool::new().acquire(&spider, Request::new("http://x.test/", "list"));
        ctx.set_response(
            Response::new(200, "plain ascii").with_header("Content-Type", "text/html; charset=x-klingon"),
        );

        assert_eq!(ctx.text().unwrap(), "plain ascii");
        assert_eq!(spider.stats().transcode_fallbacks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn browser_bodies_are_not_sniffed() {
        let spider = spider();
        let mut request = Request::new("http://x.test/", "list");
        request.downloader_id = DOWNLOADER_BROWSER;
        let mut ctx = ContextPool::new().acquire(&spider, request);
        ctx.set_response(
            Response::new(200, "已经是UTF-8").with_header("Content-Type", "text/html; charset=gbk"),
        );

        assert_eq!(ctx.text().unwrap(), "已经是UTF-8");
    }

    #[test]
    fn document_is_parsed_once_and_reset_invalidates_it() {
        let spider = spider();
        let mut ctx = ContextPool::new().acquire(&spider, Request::new("http://x.test/", "list"));
        ctx.set_response(Response::new(200, "<html><body><h1>First</h1></body></html>"));

        let h1 = Selector::parse("h1").unwrap();
        let title = |doc: &Html| doc.select(&h1).next().map(|e| e.text().collect::<String>());
        assert_eq!(title(ctx.document().unwrap()).as_deref(), Some("First"));

        ctx.reset_text("<h1>Second</h1>");
        assert_eq!(ctx.text().unwrap(), "<h1>Second</h1>");
        assert_eq!(title(ctx.document().unwrap()).as_deref(), Some("Second"));
    }

    #[test]
    fn stream_failures_and_missing_response_are_fatal() {
        let spider = spider();
        let pool = ContextPool::new();

        let mut ctx = pool.acquire(&spider, Request::new("http://x.test/", "list"));
        assert!(matches!(ctx.text(), Err(SpiderError::NoResponse)));

        ctx.set_response(Response::new(200, Body::from_reader(Broken)));
        let err = ctx.text().unwrap_err();
        assert!(matches!(err, SpiderError::Io(_)));
        assert!(err.is_fatal());
    }
}
