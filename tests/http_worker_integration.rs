//! Integration tests for the HTTP job client against the mock worker.
//!
//! Each test spins up the mock worker on a random port and drives the real
//! `HttpJobClient` + `JobOrchestrator` over the wire.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::time::timeout;

use seo_jobs::config::{OrchestratorConfig, PollConfig};
use seo_jobs::error::{ClientError, JobError};
use seo_jobs::jobs::{
    AuditConfig, HttpJobClient, InputSet, JobClient, JobEvent, JobId, JobOrchestrator,
    JobOutcome, JobRequest, JobStatus, StatusReport,
};
use seo_jobs::mock_worker::{MockWorker, serve};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Start the mock worker on a random port and return its base URL.
async fn start_worker(worker: Arc<MockWorker>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        serve(listener, worker).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    format!("http://127.0.0.1:{port}")
}

fn client(base_url: &str) -> Arc<HttpJobClient> {
    Arc::new(HttpJobClient::new(base_url, Duration::from_secs(2)).unwrap())
}

fn orchestrator(base_url: &str, poll: PollConfig) -> JobOrchestrator {
    let config = OrchestratorConfig {
        worker_url: base_url.to_string(),
        poll_override: Some(poll),
        ..OrchestratorConfig::default()
    };
    JobOrchestrator::new(client(base_url), config)
}

fn fast_poll() -> PollConfig {
    PollConfig::new(Duration::from_millis(20), Duration::from_secs(4))
}

fn audit(domain: &str) -> JobRequest {
    JobRequest::site_audit(
        "project-1",
        &AuditConfig {
            domain: domain.to_string(),
            max_pages: Some(50),
        },
    )
}

/// Collect every event for a job until its subscription closes.
async fn events_until_done(orch: &JobOrchestrator, job_id: &JobId) -> Vec<JobEvent> {
    let (_sub, stream) = orch.watch(job_id).unwrap();
    timeout(TEST_TIMEOUT, stream.collect::<Vec<_>>())
        .await
        .expect("job did not finish in time")
}

#[tokio::test]
async fn client_speaks_worker_protocol() {
    let url = start_worker(MockWorker::new()).await;
    let client = client(&url);

    let record = client.create(&audit("example.com")).await.unwrap();
    assert_eq!(record.status, JobStatus::Pending);
    assert_eq!(record.owner_scope, "project-1");

    let first = client.fetch_status(&record.id).await.unwrap();
    assert_eq!(first.status, JobStatus::Pending);

    let early = client.fetch_result(&record.id).await.unwrap_err();
    assert!(matches!(early, ClientError::PreconditionFailed { .. }));

    let second = client.fetch_status(&record.id).await.unwrap();
    assert_eq!(second.status, JobStatus::Processing);
    assert_eq!(second.progress, Some(25));

    client.cancel(&record.id).await.unwrap();
    let after = client.fetch_status(&record.id).await.unwrap();
    assert_eq!(after.status, JobStatus::Cancelled);
    // Cancelling a finished job is not an error.
    client.cancel(&record.id).await.unwrap();
}

#[tokio::test]
async fn malformed_target_is_rejected_at_submission() {
    let url = start_worker(MockWorker::new()).await;
    let orch = orchestrator(&url, fast_poll());

    let err = orch.submit(audit("not a domain")).await.unwrap_err();
    match err {
        JobError::Submission(ClientError::SubmissionRejected { reason }) => {
            assert!(reason.contains("Invalid domain"), "reason: {reason}");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(orch.summary().total, 0);
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let url = start_worker(MockWorker::new()).await;
    let err = client(&url)
        .fetch_status(&JobId::from("does-not-exist"))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::NotFound { .. }));
}

#[tokio::test]
async fn audit_runs_to_completion_over_http() {
    let url = start_worker(MockWorker::new()).await;
    let orch = orchestrator(&url, fast_poll());

    let job_id = orch.submit(audit("example.com")).await.unwrap();
    let events = events_until_done(&orch, &job_id).await;

    let progress: Vec<Option<u8>> = events
        .iter()
        .filter_map(|e| match e {
            JobEvent::Updated(r) => Some(r.progress),
            _ => None,
        })
        .collect();
    // Snapshot, then the worker's "Queued" message, then each progress step.
    assert_eq!(
        progress,
        vec![None, None, Some(25), Some(50), Some(75), Some(100)]
    );
    assert!(matches!(events.last(), Some(JobEvent::ResultReady { .. })));

    let record = orch.get_job(&job_id).unwrap();
    assert_eq!(record.outcome(), JobOutcome::Succeeded);
    assert!(record.result_ref.is_some());

    let payload = orch.fetch_result(&job_id).await.unwrap();
    assert_eq!(payload["domain"], "example.com");
    assert_eq!(payload["jobId"], json!(job_id));
}

#[tokio::test]
async fn gap_analysis_over_http() {
    let url = start_worker(MockWorker::new()).await;
    let orch = orchestrator(&url, fast_poll());

    let mut inputs = InputSet::new("target.com");
    inputs.add("rival.io").unwrap();
    inputs.add("").unwrap();
    inputs.add("other.net").unwrap();

    let job_id = orch.submit_gap("project-1", &inputs).await.unwrap();
    events_until_done(&orch, &job_id).await;

    let payload = orch.fetch_result(&job_id).await.unwrap();
    assert_eq!(payload["target"], "target.com");
    assert_eq!(payload["competitors"], json!(["rival.io", "other.net"]));
}

#[tokio::test]
async fn worker_failure_reaches_subscriber() {
    let url = start_worker(MockWorker::new()).await;
    let orch = orchestrator(&url, fast_poll());

    let job_id = orch.submit(audit("ghost.invalid")).await.unwrap();
    let events = events_until_done(&orch, &job_id).await;

    match events.last() {
        Some(JobEvent::Updated(record)) => {
            assert_eq!(record.status, JobStatus::Failed);
            assert_eq!(record.error.as_ref().unwrap().code, "dns_failure");
            assert_eq!(record.outcome(), JobOutcome::Failed);
        }
        other => panic!("unexpected last event {other:?}"),
    }
}

#[tokio::test]
async fn stalled_job_times_out_as_unknown() {
    let worker = MockWorker::with_script(vec![
        StatusReport::new(JobStatus::Processing).with_progress(10),
    ]);
    let url = start_worker(worker).await;
    let orch = orchestrator(
        &url,
        PollConfig::new(Duration::from_millis(20), Duration::from_millis(300)),
    );

    let job_id = orch.submit(audit("example.com")).await.unwrap();
    events_until_done(&orch, &job_id).await;

    let record = orch.get_job(&job_id).unwrap();
    assert_eq!(record.status, JobStatus::Processing);
    assert_eq!(record.outcome(), JobOutcome::Unknown);

    // No longer tracked, so an identical request starts a fresh job.
    let again = orch.submit(audit("example.com")).await.unwrap();
    assert_ne!(again, job_id);
    orch.clear_all().await;
}

#[tokio::test]
async fn cancel_tracking_cancels_remote_job() {
    let worker = MockWorker::with_script(vec![
        StatusReport::new(JobStatus::Processing).with_progress(10),
    ]);
    let url = start_worker(worker).await;
    let orch = orchestrator(&url, fast_poll());

    let job_id = orch.submit(audit("example.com")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(orch.cancel_tracking(&job_id).await);
    assert!(orch.get_job(&job_id).is_none());

    let remote = client(&url).fetch_status(&job_id).await.unwrap();
    assert_eq!(remote.status, JobStatus::Cancelled);
}

#[tokio::test]
async fn unreachable_worker_fails_submission_with_transport_error() {
    let orch = orchestrator("http://127.0.0.1:9", fast_poll());
    let err = orch.submit(audit("example.com")).await.unwrap_err();
    assert!(matches!(err, JobError::Submission(ref e) if e.is_transport()));
    assert_eq!(orch.active_count(), 0);
}
