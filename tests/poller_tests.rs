use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio_test::{assert_err, assert_ok};

use bqdriver::executor::{JobOutcome, JobPoller, PollPolicy, QueryOptions, UsageReporter};
use bqdriver::remote::{ErrorPayload, JobScript, JobStatistics, MockWarehouse, QueryJobRequest};
use bqdriver::DriverError;

fn poller(warehouse: &Arc<MockWarehouse>, timeout: Duration, max_interval: Duration) -> JobPoller {
    JobPoller::new(warehouse.clone(), PollPolicy::new(timeout, max_interval))
}

fn gaps(instants: &[tokio::time::Instant]) -> Vec<Duration> {
    instants.windows(2).map(|w| w[1] - w[0]).collect()
}

#[derive(Default)]
struct RecordingReporter {
    calls: Mutex<Vec<(Option<JobStatistics>, Option<String>)>>,
}

impl UsageReporter for RecordingReporter {
    fn report_query_usage(&self, statistics: Option<&JobStatistics>, options: &QueryOptions) {
        self.calls
            .lock()
            .unwrap()
            .push((statistics.cloned(), options.request_id.clone()));
    }
}

#[tokio::test(start_paused = true)]
async fn test_polls_until_first_done() {
    let warehouse = Arc::new(MockWarehouse::new());
    warehouse.on_query(
        "FROM orders",
        JobScript::rows(&[("n", "INT64")], vec![json!({"n": 3})]).running_for(2),
    );

    let poller = poller(&warehouse, Duration::from_secs(60), Duration::from_millis(300));
    let outcome = assert_ok!(
        poller
            .run(&QueryJobRequest::new("SELECT COUNT(*) AS n FROM orders"), &QueryOptions::default(), true)
            .await
    );

    let results = outcome.into_results();
    assert_eq!(results.rows.len(), 1);
    assert_eq!(results.rows[0]["n"], json!(3));
    assert_eq!(warehouse.poll_instants("mock_job_1").len(), 3);
    assert!(warehouse.cancelled().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_poll_delays_grow_and_cap() {
    let warehouse = Arc::new(MockWarehouse::new());
    warehouse.on_query("SELECT", JobScript::completed().running_for(6));

    let max_interval = Duration::from_millis(500);
    let poller = poller(&warehouse, Duration::from_secs(60), max_interval);
    assert_ok!(
        poller
            .run(&QueryJobRequest::new("SELECT 1"), &QueryOptions::default(), false)
            .await
    );

    let instants = warehouse.poll_instants("mock_job_1");
    assert_eq!(instants.len(), 7);

    let expected = [0u64, 200, 400, 500, 500, 500];
    for (gap, expected_ms) in gaps(&instants).iter().zip(expected) {
        let expected = Duration::from_millis(expected_ms);
        assert!(*gap >= expected, "gap {:?} shorter than {:?}", gap, expected);
        assert!(*gap <= expected + Duration::from_millis(2), "gap {:?} longer than {:?}", gap, expected);
        assert!(*gap <= max_interval + Duration::from_millis(2));
    }
}

#[tokio::test(start_paused = true)]
async fn test_timeout_cancels_once() {
    let warehouse = Arc::new(MockWarehouse::new());
    warehouse.on_query("SELECT", JobScript::never_finishes());

    let poller = poller(&warehouse, Duration::from_secs(2), Duration::from_millis(500));
    let err = assert_err!(
        poller
            .run(&QueryJobRequest::new("SELECT slow()"), &QueryOptions::default(), true)
            .await
    );

    assert!(matches!(err, DriverError::PollTimeout { timeout_ms: 2000 }));
    assert_eq!(err.to_string(), "BigQuery job timeout reached 2000ms");
    assert_eq!(warehouse.cancelled(), vec!["mock_job_1".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_failed_cancellation_keeps_timeout_error() {
    let warehouse = Arc::new(MockWarehouse::new());
    warehouse.on_query("SELECT", JobScript::never_finishes());
    warehouse.fail_cancellation();

    let poller = poller(&warehouse, Duration::from_secs(1), Duration::from_millis(200));
    let err = assert_err!(
        poller
            .run(&QueryJobRequest::new("SELECT slow()"), &QueryOptions::default(), true)
            .await
    );

    assert!(matches!(err, DriverError::PollTimeout { timeout_ms: 1000 }));
    assert_eq!(warehouse.cancelled().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_error_payload_message() {
    let warehouse = Arc::new(MockWarehouse::new());
    warehouse.on_query(
        "SELEC",
        JobScript::failed(ErrorPayload {
            reason: Some("invalidQuery".into()),
            message: Some("Syntax error: Unexpected identifier \"SELEC\"".into()),
            ..Default::default()
        })
        .running_for(1),
    );

    let poller = poller(&warehouse, Duration::from_secs(10), Duration::from_secs(1));
    let err = assert_err!(
        poller
            .run(&QueryJobRequest::new("SELEC 1"), &QueryOptions::default(), true)
            .await
    );

    match err {
        DriverError::RemoteJob { message } => {
            assert_eq!(message, "Syntax error: Unexpected identifier \"SELEC\"")
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(warehouse.cancelled().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_error_payload_without_message_is_serialized() {
    let warehouse = Arc::new(MockWarehouse::new());
    warehouse.on_query(
        "SELECT",
        JobScript::failed(ErrorPayload {
            reason: Some("backendError".into()),
            ..Default::default()
        }),
    );

    let poller = poller(&warehouse, Duration::from_secs(10), Duration::from_secs(1));
    let err = assert_err!(
        poller
            .run(&QueryJobRequest::new("SELECT 1"), &QueryOptions::default(), false)
            .await
    );

    assert_eq!(err.to_string(), r#"{"reason":"backendError"}"#);
}

#[tokio::test(start_paused = true)]
async fn test_terminal_empty_result_is_not_running() {
    let warehouse = Arc::new(MockWarehouse::new());
    warehouse.on_query("WHERE false", JobScript::rows(&[("id", "INT64")], vec![]).running_for(1));

    let poller = poller(&warehouse, Duration::from_secs(10), Duration::from_secs(1));
    let outcome = assert_ok!(
        poller
            .run(&QueryJobRequest::new("SELECT id FROM t WHERE false"), &QueryOptions::default(), true)
            .await
    );

    match outcome {
        JobOutcome::Rows(results) => {
            assert!(results.rows.is_empty());
            assert_eq!(results.column_names(), vec!["id"]);
        }
        JobOutcome::Completed => panic!("expected rows"),
    }
    assert_eq!(warehouse.poll_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_submission_failure_is_not_retried() {
    let warehouse = Arc::new(MockWarehouse::new());
    warehouse.on_query("SELECT", JobScript::rejected("quota exceeded"));

    let poller = poller(&warehouse, Duration::from_secs(10), Duration::from_secs(1));
    let err = assert_err!(
        poller
            .run(&QueryJobRequest::new("SELECT 1"), &QueryOptions::default(), true)
            .await
    );

    assert!(matches!(err, DriverError::Client(_)));
    assert_eq!(warehouse.poll_count(), 0);
    assert!(warehouse.submitted().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_usage_reported_on_success_only() {
    let warehouse = Arc::new(MockWarehouse::new());
    let stats = JobStatistics {
        total_bytes_processed: Some(1024),
        cache_hit: Some(false),
        ..Default::default()
    };
    warehouse.on_query("FROM ok", JobScript::completed().with_statistics(stats.clone()));
    warehouse.on_query("FROM broken", JobScript::failed(ErrorPayload::with_message("boom")));

    let reporter = Arc::new(RecordingReporter::default());
    let poller = poller(&warehouse, Duration::from_secs(10), Duration::from_secs(1))
        .with_reporter(reporter.clone());
    let options = QueryOptions::new().with_request_id("req-42");

    assert_ok!(poller.run(&QueryJobRequest::new("SELECT * FROM ok"), &options, false).await);
    assert_err!(poller.run(&QueryJobRequest::new("SELECT * FROM broken"), &options, false).await);

    let calls = reporter.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, Some(stats));
    assert_eq!(calls[0].1.as_deref(), Some("req-42"));
}

#[tokio::test(start_paused = true)]
async fn test_independent_jobs_run_concurrently() {
    let warehouse = Arc::new(MockWarehouse::new());
    warehouse.on_query("FROM a", JobScript::rows(&[("v", "STRING")], vec![json!({"v": "a"})]).running_for(3));
    warehouse.on_query("FROM b", JobScript::rows(&[("v", "STRING")], vec![json!({"v": "b"})]).running_for(1));

    let poller = poller(&warehouse, Duration::from_secs(10), Duration::from_secs(1));
    let options = QueryOptions::default();
    let request_a = QueryJobRequest::new("SELECT v FROM a");
    let request_b = QueryJobRequest::new("SELECT v FROM b");

    let (a, b) = tokio::join!(
        poller.run(&request_a, &options, true),
        poller.run(&request_b, &options, true),
    );

    assert_eq!(assert_ok!(a).into_results().rows[0]["v"], json!("a"));
    assert_eq!(assert_ok!(b).into_results().rows[0]["v"], json!("b"));
}
