//! Mock analysis worker — in-memory REST stand-in for the remote job worker.
//!
//! Serves the same four endpoints `HttpJobClient` talks to. Every status read
//! advances a job one step along a scripted lifecycle, so a client polling it
//! sees realistic progress without any real crawling.

mod payloads;

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::jobs::model::{JobRequest, JobStatus, StatusReport};

pub use payloads::is_valid_domain;

/// One job held by the mock worker.
struct MockJob {
    request: JobRequest,
    created_at: DateTime<Utc>,
    /// Index of the next script step to serve.
    cursor: usize,
    /// Status most recently served to a client.
    status: JobStatus,
    failure: Option<(String, String)>,
}

/// Shared state of the mock worker.
pub struct MockWorker {
    jobs: RwLock<HashMap<String, MockJob>>,
    script: Vec<StatusReport>,
}

impl MockWorker {
    /// Worker playing the default lifecycle: pending, processing 25/50/75, completed.
    pub fn new() -> Arc<Self> {
        Self::with_script(default_script())
    }

    /// Worker playing a custom lifecycle. The last step repeats.
    pub fn with_script(script: Vec<StatusReport>) -> Arc<Self> {
        let script = if script.is_empty() {
            default_script()
        } else {
            script
        };
        Arc::new(Self {
            jobs: RwLock::new(HashMap::new()),
            script,
        })
    }

    /// Number of jobs ever accepted.
    pub async fn job_count(&self) -> usize {
        self.jobs.read().await.len()
    }

    async fn create(&self, request: JobRequest) -> (String, DateTime<Utc>) {
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let failure = payloads::scripted_failure(&request);

        info!(
            job_id = %id,
            scope = %request.owner_scope,
            kind = %request.kind,
            "Mock job accepted"
        );

        self.jobs.write().await.insert(
            id.clone(),
            MockJob {
                request,
                created_at,
                cursor: 0,
                status: JobStatus::Pending,
                failure,
            },
        );
        (id, created_at)
    }

    /// Serve the next step of a job's lifecycle.
    async fn advance(&self, id: &str) -> Option<StatusReport> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(id)?;

        if job.status.is_terminal() {
            return Some(self.terminal_report(id, job));
        }

        let last = self.script.len() - 1;
        let mut report = self.script[job.cursor.min(last)].clone();
        if report.status == JobStatus::Completed {
            if let Some((code, message)) = job.failure.clone() {
                report = StatusReport::new(JobStatus::Failed).with_error(code, message);
            } else if report.result_ref.is_none() {
                report.result_ref = Some(crate::jobs::model::ResultRef(id.to_string()));
            }
        }

        if job.cursor < last {
            job.cursor += 1;
        }
        job.status = report.status;
        debug!(job_id = %id, status = %report.status, progress = report.progress.unwrap_or(0), "Mock status served");
        Some(report)
    }

    fn terminal_report(&self, id: &str, job: &MockJob) -> StatusReport {
        match job.status {
            JobStatus::Failed => {
                let (code, message) = job
                    .failure
                    .clone()
                    .unwrap_or_else(|| ("unknown".to_string(), "Job failed".to_string()));
                StatusReport::new(JobStatus::Failed).with_error(code, message)
            }
            JobStatus::Completed => {
                let mut report = StatusReport::new(JobStatus::Completed).with_progress(100);
                report.result_ref = Some(crate::jobs::model::ResultRef(id.to_string()));
                report
            }
            other => StatusReport::new(other).with_message("Cancelled by client"),
        }
    }
}

fn default_script() -> Vec<StatusReport> {
    vec![
        StatusReport::new(JobStatus::Pending).with_message("Queued"),
        StatusReport::new(JobStatus::Processing)
            .with_progress(25)
            .with_message("Crawling pages"),
        StatusReport::new(JobStatus::Processing)
            .with_progress(50)
            .with_message("Analyzing content"),
        StatusReport::new(JobStatus::Processing)
            .with_progress(75)
            .with_message("Scoring results"),
        StatusReport::new(JobStatus::Completed).with_progress(100),
    ]
}

/// Build the Axum router for the mock worker.
pub fn mock_routes(worker: Arc<MockWorker>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_headers(Any)
        .allow_methods(Any);

    Router::new()
        .route("/health", get(health))
        .route("/jobs", axum::routing::post(create_job))
        .route("/jobs/{id}", get(job_status).delete(cancel_job))
        .route("/jobs/{id}/result", get(job_result))
        .layer(cors)
        .with_state(worker)
}

/// Serve the mock worker on an already bound listener until the process exits.
pub async fn serve(listener: TcpListener, worker: Arc<MockWorker>) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Mock worker listening");
    }
    axum::serve(listener, mock_routes(worker)).await
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "seo-jobs-mock-worker"
    }))
}

// ── Jobs ────────────────────────────────────────────────────────────────

async fn create_job(
    State(worker): State<Arc<MockWorker>>,
    Json(request): Json<JobRequest>,
) -> Response {
    if let Err(reason) = payloads::validate(&request) {
        warn!(kind = %request.kind, %reason, "Mock job rejected");
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": reason })),
        )
            .into_response();
    }

    let (id, created_at) = worker.create(request).await;
    (
        StatusCode::CREATED,
        Json(json!({
            "id": id,
            "status": JobStatus::Pending,
            "createdAt": created_at,
        })),
    )
        .into_response()
}

async fn job_status(State(worker): State<Arc<MockWorker>>, Path(id): Path<String>) -> Response {
    match worker.advance(&id).await {
        Some(report) => Json(report).into_response(),
        None => not_found(&id),
    }
}

async fn job_result(State(worker): State<Arc<MockWorker>>, Path(id): Path<String>) -> Response {
    let jobs = worker.jobs.read().await;
    let Some(job) = jobs.get(&id) else {
        return not_found(&id);
    };

    if job.status != JobStatus::Completed {
        return (
            StatusCode::CONFLICT,
            Json(json!({ "error": format!("Job {id} is {}", job.status) })),
        )
            .into_response();
    }

    debug!(job_id = %id, age_ms = (Utc::now() - job.created_at).num_milliseconds(), "Mock result served");
    Json(payloads::result_for(&id, &job.request)).into_response()
}

async fn cancel_job(State(worker): State<Arc<MockWorker>>, Path(id): Path<String>) -> Response {
    let mut jobs = worker.jobs.write().await;
    let Some(job) = jobs.get_mut(&id) else {
        return not_found(&id);
    };

    if job.status.is_terminal() {
        return (
            StatusCode::CONFLICT,
            Json(json!({ "error": format!("Job {id} already {}", job.status) })),
        )
            .into_response();
    }

    job.status = JobStatus::Cancelled;
    info!(job_id = %id, "Mock job cancelled");
    StatusCode::NO_CONTENT.into_response()
}

fn not_found(id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("Job {id} not found") })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use serde_json::Value;
    use tower::ServiceExt;

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn create(app: &Router, domain: &str) -> String {
        let (status, body) = call(
            app,
            Method::POST,
            "/jobs",
            Some(json!({"ownerScope": "p1", "type": "site_audit", "config": {"domain": domain}})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["status"], "pending");
        body["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn lifecycle_advances_per_read() {
        let app = mock_routes(MockWorker::new());
        let id = create(&app, "example.com").await;
        let uri = format!("/jobs/{id}");

        let mut seen = Vec::new();
        for _ in 0..6 {
            let (status, body) = call(&app, Method::GET, &uri, None).await;
            assert_eq!(status, StatusCode::OK);
            seen.push((body["status"].as_str().unwrap().to_string(), body["progress"].as_u64()));
        }
        assert_eq!(
            seen,
            vec![
                ("pending".to_string(), None),
                ("processing".to_string(), Some(25)),
                ("processing".to_string(), Some(50)),
                ("processing".to_string(), Some(75)),
                ("completed".to_string(), Some(100)),
                ("completed".to_string(), Some(100)),
            ]
        );

        let (status, body) = call(&app, Method::GET, &format!("{uri}/result"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["domain"], "example.com");
        assert!(body["issues"].as_array().unwrap().len() >= 3);
    }

    #[tokio::test]
    async fn malformed_domain_is_unprocessable() {
        let app = mock_routes(MockWorker::new());
        let (status, body) = call(
            &app,
            Method::POST,
            "/jobs",
            Some(json!({"ownerScope": "p1", "type": "site_audit", "config": {"domain": "not a domain"}})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].as_str().unwrap().contains("Invalid domain"));
    }

    #[tokio::test]
    async fn result_before_completion_conflicts() {
        let app = mock_routes(MockWorker::new());
        let id = create(&app, "example.com").await;
        let (status, _) = call(&app, Method::GET, &format!("/jobs/{id}/result"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let app = mock_routes(MockWorker::new());
        let (status, _) = call(&app, Method::GET, "/jobs/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app, Method::DELETE, "/jobs/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancel_sticks_and_second_cancel_conflicts() {
        let app = mock_routes(MockWorker::new());
        let id = create(&app, "example.com").await;
        let uri = format!("/jobs/{id}");

        let (status, _) = call(&app, Method::DELETE, &uri, None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, body) = call(&app, Method::GET, &uri, None).await;
        assert_eq!(body["status"], "cancelled");
        let (status, _) = call(&app, Method::DELETE, &uri, None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn unresolvable_domain_ends_failed() {
        let app = mock_routes(MockWorker::new());
        let id = create(&app, "ghost.invalid").await;
        let uri = format!("/jobs/{id}");

        let mut last = Value::Null;
        for _ in 0..5 {
            last = call(&app, Method::GET, &uri, None).await.1;
        }
        assert_eq!(last["status"], "failed");
        assert_eq!(last["error"]["code"], "dns_failure");
    }
}
