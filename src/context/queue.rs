//! Submission of follow-up requests from rule code.

use super::ScrapeContext;
use crate::error::SpiderError;
use crate::request::Request;
use serde_json::Value;
use tracing::{debug, error, warn};

impl ScrapeContext {
    /// Prepares `request` for this context's spider and submits it.
    ///
    /// The request inherits the spider's name and cookie policy. When a
    /// response is bound and the request has no referer, the current url
    /// becomes its referer. A request that fails validation is logged and
    /// dropped; only a stopped spider is reported as an error.
    pub fn add_queue(&self, request: Request) -> Result<(), SpiderError> {
        self.spider.check_running()?;
        self.submit(request);
        Ok(())
    }

    /// Builds a request from a loosely typed bag and submits it.
    ///
    /// Fields of the wrong shape are skipped; a bag without a usable url is
    /// dropped.
    pub fn add_queue_dynamic(&self, bag: &Value) -> Result<(), SpiderError> {
        self.spider.check_running()?;
        match Request::from_dynamic(bag) {
            Some(request) => self.submit(request),
            None => {
                debug!(
                    "Spider '{}' dropped a dynamic request without a url",
                    self.spider.name()
                );
                self.spider.stats().increment_requests_dropped();
            }
        }
        Ok(())
    }

    fn submit(&self, mut request: Request) {
        request
            .set_spider_name(self.spider.name())
            .set_enable_cookie(self.spider.enable_cookie());

        if let Err(e) = request.prepare() {
            error!("{}", e);
            self.spider.stats().increment_requests_dropped();
            return;
        }

        if request.referer().is_empty() && self.response.is_some() {
            request.set_referer(self.url());
        }

        let url = request.url.clone();
        if let Err(e) = self.spider.request_push(request) {
            warn!("Spider '{}' could not queue {}: {}", self.spider.name(), url, e);
            self.spider.stats().increment_requests_dropped();
        }
    }
}
