//! End-to-end tests for pipeline runs.

#[cfg(test)]
mod tests {
    use crate::config::{IndexerConfig, SinkConfig};
    use crate::context::ProcessingContext;
    use crate::delivery::{BatchDeliverySink, SinkState};
    use crate::errors::IndexflowError;
    use crate::pipeline::{FallibleSource, PipelineBuilder, PipelineDriver};
    use crate::steps::RegexCaptureStep;
    use crate::testing::{
        numbered_records, test_sink_config, FailingStep, LogCapture, RecordingDeliveryClient,
        ScriptedOutcome, TestRecord,
    };
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tracing::Level;

    fn config(processing_threads: usize) -> IndexerConfig {
        IndexerConfig::new()
            .with_processing_threads(processing_threads)
            .with_log_batch_size(0)
    }

    fn sink(config: SinkConfig, client: &Arc<RecordingDeliveryClient>) -> BatchDeliverySink {
        BatchDeliverySink::new(config, client.clone()).unwrap()
    }

    fn title_builder(config: IndexerConfig) -> PipelineBuilder<TestRecord> {
        PipelineDriver::builder(config)
            .to_field("id", |ctx: &ProcessingContext<TestRecord>| {
                Ok(vec![json!(ctx.source_record().id)])
            })
            .to_field("title", |ctx: &ProcessingContext<TestRecord>| {
                Ok(vec![json!(ctx.source_record().title)])
            })
    }

    fn delivered_ids(client: &RecordingDeliveryClient) -> Vec<String> {
        client
            .delivered_documents()
            .iter()
            .filter_map(|doc| doc["id"][0].as_str().map(str::to_string))
            .collect()
    }

    #[test]
    fn test_single_record_with_defaults() {
        let client = Arc::new(RecordingDeliveryClient::new());
        let driver = title_builder(config(2))
            .build(sink(test_sink_config(), &client))
            .unwrap();

        let report = driver.run(numbered_records(1).into_iter()).unwrap();

        assert!(report.success);
        assert_eq!(report.records_read, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.skipped_by_delivery, 0);
        assert_eq!(client.post_count(), 1);
        assert_eq!(
            client.delivered_documents(),
            vec![json!({"id": ["rec-1"], "title": ["Title 1"]})]
        );
    }

    #[test]
    fn test_parallel_run_delivers_every_record_once() {
        let client = Arc::new(RecordingDeliveryClient::new());
        let driver = title_builder(config(4))
            .build(sink(test_sink_config().with_batch_size(10).with_thread_pool(2), &client))
            .unwrap();

        let report = driver.run(numbered_records(500).into_iter()).unwrap();

        assert_eq!(report.records_read, 500);
        assert_eq!(report.delivered, 500);
        let ids = delivered_ids(&client);
        assert_eq!(ids.len(), 500);
        let unique: HashSet<&String> = ids.iter().collect();
        assert_eq!(unique.len(), 500);
        assert!(client.posts().iter().all(|call| call.document_count() <= Some(10)));
    }

    #[test]
    fn test_batches_of_200() {
        let client = Arc::new(RecordingDeliveryClient::new());
        let driver = title_builder(config(2))
            .build(sink(test_sink_config().with_batch_size(200), &client))
            .unwrap();

        driver.run(numbered_records(201).into_iter()).unwrap();

        let mut sizes: Vec<usize> = client.posts().iter().filter_map(|c| c.document_count()).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![1, 200]);
    }

    #[test]
    fn test_synchronous_run_keeps_source_order() {
        let client = Arc::new(RecordingDeliveryClient::new());
        let driver = title_builder(config(0))
            .build(sink(test_sink_config().with_batch_size(1000), &client))
            .unwrap();

        driver.run(numbered_records(50).into_iter()).unwrap();

        let expected: Vec<String> = (1..=50).map(|n| format!("rec-{n}")).collect();
        assert_eq!(delivered_ids(&client), expected);
    }

    #[test]
    fn test_transformation_skips_are_counted_apart() {
        let capture = LogCapture::new();
        let client = Arc::new(RecordingDeliveryClient::new());

        let report = capture.run(Level::INFO, || {
            title_builder(config(2))
                .each_record("drop even records", |ctx: &mut ProcessingContext<TestRecord>| {
                    if ctx.position() % 2 == 0 {
                        ctx.skip("even position");
                    }
                    Ok(())
                })
                .build(sink(test_sink_config(), &client))
                .unwrap()
                .run(numbered_records(20).into_iter())
                .unwrap()
        });

        assert!(report.success);
        assert_eq!(report.skipped_by_transformation, 10);
        assert_eq!(report.skipped_by_delivery, 0);
        assert_eq!(report.delivered, 10);
        assert_eq!(capture.count_containing("Skipping record #"), 10);
        assert!(capture.contents().contains("even position"));
    }

    #[test]
    fn test_skip_stops_later_steps() {
        let client = Arc::new(RecordingDeliveryClient::new());
        let later_calls = Arc::new(AtomicUsize::new(0));
        let counter = later_calls.clone();

        let report = PipelineDriver::builder(config(0))
            .each_record("skip all", |ctx: &mut ProcessingContext<TestRecord>| {
                ctx.skip("not wanted");
                Ok(())
            })
            .each_record("count", move |_: &mut ProcessingContext<TestRecord>| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .build(sink(test_sink_config(), &client))
            .unwrap()
            .run(numbered_records(5).into_iter())
            .unwrap();

        assert_eq!(later_calls.load(Ordering::SeqCst), 0);
        assert_eq!(report.skipped_by_transformation, 5);
        assert_eq!(client.post_count(), 0);
    }

    #[test]
    fn test_transformation_error_stops_reading() {
        let capture = LogCapture::new();
        let client = Arc::new(RecordingDeliveryClient::new());
        let read = Arc::new(AtomicUsize::new(0));
        let read_counter = read.clone();
        let source = numbered_records(10).into_iter().inspect(move |_| {
            read_counter.fetch_add(1, Ordering::SeqCst);
        });

        let err = capture.run(Level::INFO, || {
            title_builder(config(0))
                .step(FailingStep::at_position(3, "bad leader"))
                .build(sink(test_sink_config(), &client))
                .unwrap()
                .run(source)
                .unwrap_err()
        });

        match err {
            IndexflowError::Transformation {
                position,
                record_id,
                step,
                cause,
            } => {
                assert_eq!(position, 3);
                assert_eq!(record_id.as_deref(), Some("rec-3"));
                assert_eq!(step, "fail at record #3");
                assert_eq!(cause, "bad leader");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(read.load(Ordering::SeqCst), 3);
        assert_eq!(client.post_count(), 0);
        assert_eq!(capture.count_containing("Indexing run aborted"), 1);
        assert!(capture
            .contents()
            .contains("Transformation failed for record #3 (id: rec-3)"));
    }

    #[test]
    fn test_aborted_run_fails_sink() {
        let client = Arc::new(RecordingDeliveryClient::new());
        let delivery = Arc::new(sink(
            test_sink_config().with_batch_size(1).with_commit_on_close(true),
            &client,
        ));

        let err = title_builder(config(0))
            .step(FailingStep::at_position(3, "bad leader"))
            .build(delivery.clone())
            .unwrap()
            .run(numbered_records(10).into_iter())
            .unwrap_err();
        assert!(matches!(err, IndexflowError::Transformation { position: 3, .. }));

        assert_eq!(delivery.state(), SinkState::Failed);
        let closed = delivery.close().unwrap_err();
        assert!(matches!(closed, IndexflowError::Transformation { position: 3, .. }));
        let late = ProcessingContext::new(11, TestRecord::new("rec-11", "Title 11"));
        assert!(delivery.accept(late).is_err());
        assert!(client.gets().is_empty());
    }

    #[test]
    fn test_parallel_transformation_error_is_raised() {
        let client = Arc::new(RecordingDeliveryClient::new());
        let err = title_builder(config(3))
            .step(FailingStep::at_position(50, "unexpected subfield"))
            .build(sink(test_sink_config(), &client))
            .unwrap()
            .run(numbered_records(200).into_iter())
            .unwrap_err();

        assert!(matches!(err, IndexflowError::Transformation { position: 50, .. }));
    }

    #[test]
    fn test_panicking_step_is_captured() {
        let client = Arc::new(RecordingDeliveryClient::new());
        let err = title_builder(config(1))
            .each_record("panics", |ctx: &mut ProcessingContext<TestRecord>| {
                assert!(ctx.position() != 2, "corrupt record");
                Ok(())
            })
            .build(sink(test_sink_config(), &client))
            .unwrap()
            .run(numbered_records(5).into_iter())
            .unwrap_err();

        match err {
            IndexflowError::TaskPanicked { pool, message } => {
                assert_eq!(pool, "transform");
                assert!(message.contains("corrupt record"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_delivery_skips_within_threshold_complete_unsuccessfully() {
        let capture = LogCapture::new();
        let client = Arc::new(
            RecordingDeliveryClient::new().with_default(ScriptedOutcome::status(500)),
        );

        let report = capture.run(Level::INFO, || {
            title_builder(config(2))
                .build(sink(
                    test_sink_config().with_batch_size(1).with_max_skipped(10),
                    &client,
                ))
                .unwrap()
                .run(numbered_records(10).into_iter())
                .unwrap()
        });

        assert!(!report.success);
        assert_eq!(report.skipped_by_delivery, 10);
        assert_eq!(report.delivered, 0);
        assert_eq!(capture.count_containing("Could not deliver"), 10);
    }

    #[test]
    fn test_exceeding_max_skipped_aborts_run() {
        let client = Arc::new(
            RecordingDeliveryClient::new().with_default(ScriptedOutcome::status(500)),
        );
        let err = title_builder(config(2))
            .build(sink(
                test_sink_config().with_batch_size(1).with_max_skipped(5),
                &client,
            ))
            .unwrap()
            .run(numbered_records(6).into_iter())
            .unwrap_err();

        assert!(err.to_string().contains("exceeded maximum"));
    }

    #[test]
    fn test_hooks_run_in_order_after_close() {
        let client = Arc::new(RecordingDeliveryClient::new());
        let delivery = Arc::new(sink(test_sink_config(), &client));
        let calls = Arc::new(Mutex::new(Vec::new()));

        let first_calls = calls.clone();
        let first_sink = delivery.clone();
        let second_calls = calls.clone();

        let report = title_builder(config(2))
            .after_processing("first", move || {
                assert_eq!(first_sink.state(), SinkState::Closed);
                first_calls.lock().push("first");
                Ok(())
            })
            .after_processing("second", move || {
                second_calls.lock().push("second");
                Ok(())
            })
            .build(delivery)
            .unwrap()
            .run(numbered_records(3).into_iter())
            .unwrap();

        assert!(report.success);
        assert_eq!(*calls.lock(), vec!["first", "second"]);
    }

    #[test]
    fn test_hook_failure_is_fatal() {
        let client = Arc::new(RecordingDeliveryClient::new());
        let err = title_builder(config(0))
            .after_processing("optimize", || anyhow::bail!("service unavailable"))
            .build(sink(test_sink_config(), &client))
            .unwrap()
            .run(numbered_records(2).into_iter())
            .unwrap_err();

        match err {
            IndexflowError::Hook { name, cause } => {
                assert_eq!(name, "optimize");
                assert_eq!(cause, "service unavailable");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(client.post_count(), 1);
    }

    #[test]
    fn test_source_error_is_fatal() {
        let client = Arc::new(RecordingDeliveryClient::new());
        let records: Vec<Result<TestRecord, String>> = vec![
            Ok(TestRecord::new("a", "A")),
            Err("unexpected end of file".to_string()),
        ];

        let err = title_builder(config(0))
            .build(sink(test_sink_config(), &client))
            .unwrap()
            .run(FallibleSource::new(records.into_iter()))
            .unwrap_err();

        assert!(matches!(err, IndexflowError::Source(ref m) if m.contains("end of file")));
    }

    #[test]
    fn test_regex_step_in_parallel_run() {
        let client = Arc::new(RecordingDeliveryClient::new());
        let driver = title_builder(config(3))
            .step(RegexCaptureStep::new("number", r"(\d+)$", |r: &TestRecord| {
                vec![r.title.clone()]
            }))
            .build(sink(test_sink_config(), &client))
            .unwrap();

        driver.run(numbered_records(30).into_iter()).unwrap();

        let mut numbers: Vec<String> = client
            .delivered_documents()
            .iter()
            .filter_map(|doc| doc["number"][0].as_str().map(str::to_string))
            .collect();
        numbers.sort_by_key(|n| n.parse::<u32>().unwrap_or_default());
        let expected: Vec<String> = (1..=30).map(|n| n.to_string()).collect();
        assert_eq!(numbers, expected);
    }

    #[test]
    fn test_progress_lines() {
        let capture = LogCapture::new();
        let client = Arc::new(RecordingDeliveryClient::new());

        capture.run(Level::INFO, || {
            title_builder(config(2).with_log_batch_size(10))
                .build(sink(test_sink_config(), &client))
                .unwrap()
                .run(numbered_records(25).into_iter())
                .unwrap()
        });

        assert_eq!(capture.count_containing("Read 10 records"), 1);
        assert_eq!(capture.count_containing("Read 20 records"), 1);
        assert_eq!(capture.count_containing("Indexing run finished"), 1);
    }

    #[test]
    fn test_invalid_config_rejected_at_build() {
        let client = Arc::new(RecordingDeliveryClient::new());
        let result = title_builder(config(1).with_id_field(""))
            .build(sink(test_sink_config(), &client));
        assert!(matches!(result, Err(IndexflowError::Usage(_))));
    }

    #[test]
    fn test_custom_id_field_labels_records() {
        let capture = LogCapture::new();
        let client = Arc::new(RecordingDeliveryClient::new());

        capture.run(Level::INFO, || {
            PipelineDriver::builder(config(0).with_id_field("control_number"))
                .to_field("control_number", |ctx: &ProcessingContext<TestRecord>| {
                    Ok(vec![json!(ctx.source_record().id)])
                })
                .each_record("skip", |ctx: &mut ProcessingContext<TestRecord>| {
                    ctx.skip("suppressed");
                    Ok(())
                })
                .build(sink(test_sink_config(), &client))
                .unwrap()
                .run(numbered_records(1).into_iter())
                .unwrap()
        });

        assert!(capture.contents().contains("Skipping record #1 (id: rec-1): suppressed"));
    }
}
