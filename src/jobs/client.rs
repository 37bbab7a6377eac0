//! Job client — request/response boundary to the remote analysis worker.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::error::ClientError;
use crate::jobs::model::{JobId, JobRecord, JobRequest, JobStatus, ResultPayload, StatusReport};

/// Operations on the remote worker.
///
/// `fetch_status` must not be called concurrently for the same job; the
/// polling session guarantees one in-flight request per job.
#[async_trait]
pub trait JobClient: Send + Sync {
    /// Submit a job. Returns a pending record.
    async fn create(&self, request: &JobRequest) -> Result<JobRecord, ClientError>;

    /// Current status of a job. Idempotent.
    async fn fetch_status(&self, job_id: &JobId) -> Result<StatusReport, ClientError>;

    /// Result payload of a completed job.
    async fn fetch_result(&self, job_id: &JobId) -> Result<ResultPayload, ClientError>;

    /// Best-effort cancellation. A job that already finished is not an error.
    async fn cancel(&self, job_id: &JobId) -> Result<(), ClientError>;
}

/// Acknowledgement body of `POST /jobs`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedJob {
    id: JobId,
    #[serde(default)]
    status: Option<JobStatus>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

/// Error body returned by the worker on 4xx.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// `JobClient` over the worker's JSON REST API.
pub struct HttpJobClient {
    base_url: String,
    api_token: Option<SecretString>,
    client: reqwest::Client,
}

impl HttpJobClient {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ClientError::Transport(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token: None,
            client,
        })
    }

    pub fn with_token(mut self, token: Option<SecretString>) -> Self {
        self.api_token = token;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.api_token {
            Some(ref token) => builder.bearer_auth(token.expose_secret()),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, ClientError> {
        self.authorized(builder)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, ClientError> {
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ClientError::InvalidResponse(format!("Malformed JSON body: {e}")))
    }

    async fn error_reason(resp: reqwest::Response) -> String {
        let status = resp.status();
        let body: ErrorBody = resp.json().await.unwrap_or_default();
        body.error
            .or(body.message)
            .unwrap_or_else(|| format!("worker returned {status}"))
    }
}

#[async_trait]
impl JobClient for HttpJobClient {
    async fn create(&self, request: &JobRequest) -> Result<JobRecord, ClientError> {
        let resp = self.send(self.client.post(self.url("/jobs")).json(request)).await?;

        let status = resp.status();
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNPROCESSABLE_ENTITY {
            let reason = Self::error_reason(resp).await;
            return Err(ClientError::SubmissionRejected { reason });
        }
        if !status.is_success() {
            return Err(ClientError::Transport(Self::error_reason(resp).await));
        }

        let created: CreatedJob = Self::read_json(resp).await?;
        if let Some(reported) = created.status {
            if reported != JobStatus::Pending {
                tracing::debug!(job_id = %created.id, status = %reported, "Worker acknowledged job past pending");
            }
        }

        Ok(JobRecord::new(
            created.id,
            request,
            created.created_at.unwrap_or_else(Utc::now),
        ))
    }

    async fn fetch_status(&self, job_id: &JobId) -> Result<StatusReport, ClientError> {
        let resp = self
            .send(self.client.get(self.url(&format!("/jobs/{job_id}"))))
            .await?;

        match resp.status() {
            s if s.is_success() => Self::read_json(resp).await,
            StatusCode::NOT_FOUND => Err(ClientError::NotFound { id: job_id.clone() }),
            _ => Err(ClientError::Transport(Self::error_reason(resp).await)),
        }
    }

    async fn fetch_result(&self, job_id: &JobId) -> Result<ResultPayload, ClientError> {
        let resp = self
            .send(self.client.get(self.url(&format!("/jobs/{job_id}/result"))))
            .await?;

        match resp.status() {
            s if s.is_success() => Self::read_json(resp).await,
            StatusCode::NOT_FOUND => Err(ClientError::NotFound { id: job_id.clone() }),
            StatusCode::CONFLICT => Err(ClientError::PreconditionFailed {
                id: job_id.clone(),
                status: JobStatus::Processing,
            }),
            _ => Err(ClientError::Transport(Self::error_reason(resp).await)),
        }
    }

    async fn cancel(&self, job_id: &JobId) -> Result<(), ClientError> {
        let resp = self
            .send(self.client.delete(self.url(&format!("/jobs/{job_id}"))))
            .await?;

        match resp.status() {
            s if s.is_success() => Ok(()),
            // Already gone or already finished.
            StatusCode::NOT_FOUND | StatusCode::CONFLICT => {
                tracing::debug!(job_id = %job_id, status = %resp.status(), "Cancel had no effect");
                Ok(())
            }
            _ => Err(ClientError::Transport(Self::error_reason(resp).await)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let client = HttpJobClient::new("http://worker.local/api/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.url("/jobs"), "http://worker.local/api/jobs");
    }

    #[tokio::test]
    async fn connection_refused_is_transport_error() {
        // Port 9 (discard) is not listening on loopback in test environments.
        let client = HttpJobClient::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let err = client.fetch_status(&JobId::from("x")).await.unwrap_err();
        assert!(err.is_transport(), "expected transport error, got {err:?}");
    }

    #[tokio::test]
    async fn malformed_status_body_is_invalid_response() {
        let app = axum::Router::new().route(
            "/jobs/{id}",
            axum::routing::get(|| async { "<html>maintenance</html>" }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = HttpJobClient::new(format!("http://{addr}"), Duration::from_secs(2)).unwrap();
        let err = client.fetch_status(&JobId::from("x")).await.unwrap_err();
        assert!(
            matches!(err, ClientError::InvalidResponse(ref reason) if reason.starts_with("Malformed JSON body")),
            "expected invalid response, got {err:?}"
        );
        assert!(!err.is_transport());
    }
}
