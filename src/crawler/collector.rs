//! Contains the collection stage of the crawler.
//! Drained batches are run through the configured pipelines concurrently.

use super::Collected;
use crate::pipeline::Pipeline;
use crate::state::CrawlerState;
use kanal::AsyncReceiver;
use log::{debug, error, trace, warn};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

pub(crate) fn spawn_collector_task(
    state: Arc<CrawlerState>,
    collected_rx: AsyncReceiver<Collected>,
    pipelines: Arc<Vec<Box<dyn Pipeline>>>,
    max_concurrent_pipelines: usize,
) -> tokio::task::JoinHandle<()> {
    let mut tasks = JoinSet::new();
    let semaphore = Arc::new(Semaphore::new(max_concurrent_pipelines.max(1)));

    trace!(
        "Starting collector with max_concurrent_pipelines: {}",
        max_concurrent_pipelines
    );
    tokio::spawn(async move {
        while let Ok(batch) = collected_rx.recv().await {
            trace!("Received batch from {}", batch.url);
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => {
                    warn!("Semaphore closed, shutting down collector.");
                    break;
                }
            };

            let state = Arc::clone(&state);
            let pipelines = Arc::clone(&pipelines);

            tasks.spawn(async move {
                collect_batch(&pipelines, batch).await;
                state.collecting_batches.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            });
        }

        trace!("Waiting for active collection tasks to complete");
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!("A collection task failed: {:?}", e);
            }
        }
        trace!("Collector finished");
    })
}

async fn collect_batch(pipelines: &[Box<dyn Pipeline>], batch: Collected) {
    let Collected {
        spider,
        url,
        records,
        files,
        error,
    } = batch;

    if let Some(e) = error {
        warn!("Fetch of {} for spider '{}' ended with: {}", url, spider, e);
    }
    debug!(
        "Collecting {} records and {} files from {}",
        records.len(),
        files.len(),
        url
    );

    for record in records {
        let mut current = Some(record);
        for pipeline in pipelines {
            let Some(record) = current.take() else { break };
            match pipeline.process_record(record).await {
                Ok(next) => {
                    if next.is_none() {
                        debug!("Pipeline '{}' dropped a record from {}", pipeline.name(), url);
                    }
                    current = next;
                }
                Err(e) => {
                    error!("Pipeline '{}' error: {}", pipeline.name(), e);
                    break;
                }
            }
        }
    }

    for file in files {
        let mut current = Some(file);
        for pipeline in pipelines {
            let Some(file) = current.take() else { break };
            match pipeline.process_file(file).await {
                Ok(next) => current = next,
                Err(e) => {
                    error!("Pipeline '{}' error on file: {}", pipeline.name(), e);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SpiderError;
    use crate::item::{FileCell, Record};
    use crate::pipeline::MemoryPipeline;
    use async_trait::async_trait;
    use serde_json::{Map, json};

    struct DropOdd;

    #[async_trait]
    impl Pipeline for DropOdd {
        fn name(&self) -> &str {
            "drop-odd"
        }

        async fn process_record(&self, record: Record) -> Result<Option<Record>, SpiderError> {
            let odd = record.get("n").and_then(|v| v.as_i64()).is_some_and(|n| n % 2 == 1);
            Ok((!odd).then_some(record))
        }
    }

    fn record(n: i64) -> Record {
        let mut fields = Map::new();
        fields.insert("n".into(), json!(n));
        Record::bare("list", fields)
    }

    #[tokio::test]
    async fn batches_flow_through_pipelines_in_order() {
        let sink = MemoryPipeline::new();
        let pipelines: Arc<Vec<Box<dyn Pipeline>>> =
            Arc::new(vec![Box::new(DropOdd), Box::new(sink.clone())]);
        let state = CrawlerState::new();
        let (tx, rx) = kanal::bounded_async(4);

        let task = spawn_collector_task(Arc::clone(&state), rx, pipelines, 2);
        state.collecting_batches.fetch_add(1, Ordering::SeqCst);
        tx.send(Collected {
            spider: "news".into(),
            url: "http://x.test/".into(),
            records: (0..4).map(record).collect(),
            files: vec![FileCell::new("list", "index.html", b"<p/>".to_vec())],
            error: None,
        })
        .await
        .unwrap();
        drop(tx);
        task.await.unwrap();

        let kept: Vec<_> = sink.records().iter().filter_map(|r| r.get("n").cloned()).collect();
        assert_eq!(kept, vec![json!(0), json!(2)]);
        assert_eq!(sink.files().len(), 1);
        assert!(state.is_idle());
    }
}
