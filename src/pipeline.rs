//! # Pipeline Module
//!
//! The outbound collection contract: where drained records and files go.
//!
//! ## Overview
//!
//! After each fetch cycle the crawler hands the records and files drained
//! from the context to every registered [`Pipeline`] in order. A pipeline may
//! transform an output, pass it on unchanged, or drop it by returning
//! `Ok(None)`; an error drops the output and is logged.
//!
//! ## Example
//!
//! ```rust,ignore
//! use spider_context::pipeline::{MemoryPipeline, Pipeline};
//!
//! let sink = MemoryPipeline::new();
//! let crawler = CrawlerBuilder::new()
//!     .add_pipeline(sink.clone())
//!     .build();
//! ```

use crate::error::SpiderError;
use crate::item::{FileCell, Record};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

#[async_trait]
pub trait Pipeline: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn process_record(&self, record: Record) -> Result<Option<Record>, SpiderError>;

    async fn process_file(&self, file: FileCell) -> Result<Option<FileCell>, SpiderError> {
        Ok(Some(file))
    }

    async fn close(&self) -> Result<(), SpiderError> {
        Ok(())
    }
}

/// Keeps every record and file it sees. Clones share storage.
#[derive(Debug, Default, Clone)]
pub struct MemoryPipeline {
    records: Arc<Mutex<Vec<Record>>>,
    files: Arc<Mutex<Vec<FileCell>>>,
}

impl MemoryPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Record> {
        self.records.lock().clone()
    }

    pub fn files(&self) -> Vec<FileCell> {
        self.files.lock().clone()
    }
}

#[async_trait]
impl Pipeline for MemoryPipeline {
    fn name(&self) -> &str {
        "memory"
    }

    async fn process_record(&self, record: Record) -> Result<Option<Record>, SpiderError> {
        self.records.lock().push(record.clone());
        Ok(Some(record))
    }

    async fn process_file(&self, file: FileCell) -> Result<Option<FileCell>, SpiderError> {
        self.files.lock().push(file.clone());
        Ok(Some(file))
    }
}
