//! Scripted in-memory `JobClient` for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use crate::error::ClientError;
use crate::jobs::client::JobClient;
use crate::jobs::model::{JobId, JobRecord, JobRequest, JobStatus, ResultPayload, StatusReport};

/// One scripted answer to `fetch_status`.
#[derive(Debug, Clone)]
pub(crate) enum Step {
    Report(StatusReport),
    TransportFailure,
    /// The worker answers 404.
    NotFound,
    /// The worker answers with a body that is not a status report.
    Malformed,
}

impl Step {
    pub(crate) fn status(status: JobStatus, progress: Option<u8>) -> Self {
        let mut report = StatusReport::new(status);
        report.progress = progress;
        Self::Report(report)
    }

    pub(crate) fn failed(code: &str, message: &str) -> Self {
        Self::Report(StatusReport::new(JobStatus::Failed).with_error(code, message))
    }
}

/// Every job created plays the same script; the last step repeats forever.
pub(crate) struct ScriptedClient {
    script: Vec<Step>,
    queues: Mutex<HashMap<JobId, VecDeque<Step>>>,
    next_id: AtomicUsize,
    create_calls: AtomicUsize,
    status_calls: AtomicUsize,
    result_calls: AtomicUsize,
    cancelled: Mutex<Vec<JobId>>,
    in_flight: AtomicBool,
    overlapped: AtomicBool,
    status_delay: Mutex<Duration>,
    create_delay: Mutex<Duration>,
    result_delay: Mutex<Duration>,
    reject_next_create: Mutex<Option<String>>,
}

impl ScriptedClient {
    pub(crate) fn with_script(script: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            script,
            queues: Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(1),
            create_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
            result_calls: AtomicUsize::new(0),
            cancelled: Mutex::new(Vec::new()),
            in_flight: AtomicBool::new(false),
            overlapped: AtomicBool::new(false),
            status_delay: Mutex::new(Duration::ZERO),
            create_delay: Mutex::new(Duration::ZERO),
            result_delay: Mutex::new(Duration::ZERO),
            reject_next_create: Mutex::new(None),
        })
    }

    pub(crate) fn set_status_delay(&self, delay: Duration) {
        *self.status_delay.lock().unwrap() = delay;
    }

    pub(crate) fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = delay;
    }

    pub(crate) fn set_result_delay(&self, delay: Duration) {
        *self.result_delay.lock().unwrap() = delay;
    }

    pub(crate) fn reject_next_create(&self, reason: &str) {
        *self.reject_next_create.lock().unwrap() = Some(reason.to_string());
    }

    pub(crate) fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn result_calls(&self) -> usize {
        self.result_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn cancelled(&self) -> Vec<JobId> {
        self.cancelled.lock().unwrap().clone()
    }

    /// Whether two status checks were ever in flight at once.
    pub(crate) fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    fn next_step(&self, job_id: &JobId) -> Option<Step> {
        let mut queues = self.queues.lock().unwrap();
        // Jobs not created through this client play the script too.
        let queue = queues
            .entry(job_id.clone())
            .or_insert_with(|| self.script.iter().cloned().collect());
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait]
impl JobClient for ScriptedClient {
    async fn create(&self, request: &JobRequest) -> Result<JobRecord, ClientError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.create_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = self.reject_next_create.lock().unwrap().take() {
            return Err(ClientError::SubmissionRejected { reason });
        }

        let id = JobId::new(format!("job-{}", self.next_id.fetch_add(1, Ordering::SeqCst)));
        self.queues
            .lock()
            .unwrap()
            .insert(id.clone(), self.script.iter().cloned().collect());
        Ok(JobRecord::new(id, request, Utc::now()))
    }

    async fn fetch_status(&self, job_id: &JobId) -> Result<StatusReport, ClientError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.overlapped.store(true, Ordering::SeqCst);
        }

        let delay = *self.status_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.store(false, Ordering::SeqCst);

        match self.next_step(job_id) {
            Some(Step::Report(report)) => Ok(report),
            Some(Step::TransportFailure) => {
                Err(ClientError::Transport("connection reset by peer".to_string()))
            }
            Some(Step::Malformed) => Err(ClientError::InvalidResponse(
                "Malformed JSON body: expected value at line 1 column 1".to_string(),
            )),
            Some(Step::NotFound) | None => Err(ClientError::NotFound { id: job_id.clone() }),
        }
    }

    async fn fetch_result(&self, job_id: &JobId) -> Result<ResultPayload, ClientError> {
        self.result_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.result_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(json!({"jobId": job_id, "score": 87}))
    }

    async fn cancel(&self, job_id: &JobId) -> Result<(), ClientError> {
        self.cancelled.lock().unwrap().push(job_id.clone());
        Ok(())
    }
}
