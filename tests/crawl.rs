use serde_json::json;
use spider_context::pipeline::MemoryPipeline;
use spider_context::prelude::*;
use spider_context::Fetched;
use std::sync::Arc;
use std::sync::atomic::Ordering;

fn spider() -> Arc<Spider> {
    Spider::builder("shop", FnRule::new(|_| Ok(())))
        .rule(
            "product",
            Rule::from_fn(|ctx| {
                let name = ctx.text()?.trim().to_string();
                let emitter = ctx.emitter();
                std::thread::scope(|s| {
                    for variant in ["small", "large"] {
                        let emitter = emitter.clone();
                        let name = name.clone();
                        s.spawn(move || {
                            emitter.output([("name", json!(name)), ("variant", json!(variant))], None);
                        });
                    }
                });
                Ok(())
            }),
        )
        .rule("download", Rule::from_fn(|ctx| ctx.file_output(None)))
        .build()
}

#[tokio::test]
async fn crawler_parses_fetches_and_feeds_pipelines() {
    let spider = spider();
    let sink = MemoryPipeline::new();
    let crawler = CrawlerBuilder::new()
        .parser_workers(3)
        .max_concurrent_pipelines(2)
        .channel_capacity(4)
        .add_pipeline(sink.clone())
        .build()
        .unwrap();

    let (tx, rx) = kanal::bounded_async(4);
    let run = tokio::spawn(crawler.run(rx));

    for n in 0..4 {
        tx.send(Fetched {
            spider: Arc::clone(&spider),
            request: Request::new(format!("http://shop.test/p/{n}"), "product"),
            response: Ok(Response::new(200, format!(" widget-{n} "))),
        })
        .await
        .unwrap();
    }
    tx.send(Fetched {
        spider: Arc::clone(&spider),
        request: Request::new("http://shop.test/catalog.pdf", "download"),
        response: Ok(Response::new(200, b"%PDF".to_vec())),
    })
    .await
    .unwrap();
    tx.send(Fetched {
        spider: Arc::clone(&spider),
        request: Request::new("http://shop.test/p/9", "product"),
        response: Err(SpiderError::GeneralError("connection refused".into())),
    })
    .await
    .unwrap();
    drop(tx);

    run.await.unwrap().unwrap();

    let records = sink.records();
    assert_eq!(records.len(), 8);
    assert!(records.iter().all(|r| r.rule_name == "product"));
    assert!(records.iter().any(|r| r.get("name") == Some(&json!("widget-2"))));

    let files = sink.files();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].name, "catalog.pdf");

    let stats = spider.stats();
    assert_eq!(stats.fetch_failures.load(Ordering::SeqCst), 1);
    assert_eq!(stats.contexts_acquired.load(Ordering::SeqCst), 6);
    assert_eq!(stats.contexts_released.load(Ordering::SeqCst), 6);
    assert_eq!(stats.records_emitted.load(Ordering::SeqCst), 8);
}
