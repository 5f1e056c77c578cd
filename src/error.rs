//! Error type shared by every layer of the crate.
//!
//! Resolution misses and transcoding fallbacks are recovered locally and only
//! logged; the variants below are the failures that cross an API boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpiderError {
    /// A queued request failed validation and was not submitted.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    /// The response body could not be read in full.
    #[error("stream error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A response view was requested before a response was bound.
    #[error("no response bound to the context")]
    NoResponse,

    /// The owning spider was stopped; the current worker must unwind.
    #[error("spider '{0}' has been stopped")]
    Cancelled(String),

    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("{0}")]
    GeneralError(String),
}

impl SpiderError {
    /// Returns true for errors that must abort the current fetch cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SpiderError::Io(_) | SpiderError::NoResponse | SpiderError::Cancelled(_)
        )
    }
}
