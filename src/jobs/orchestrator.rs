//! Job orchestrator — the facade callers use to submit and follow analysis jobs.
//!
//! Owns the in-memory job table, one polling session per tracked job, the
//! per-job event hubs, and the result cache. Everything is torn down by
//! `clear_all()` or when the last orchestrator handle is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::{ClientError, Error, JobError};
use crate::jobs::cache::ResultCache;
use crate::jobs::client::JobClient;
use crate::jobs::events::{Callback, EventHub, JobEvent, Subscription};
use crate::jobs::input_set::InputSet;
use crate::jobs::model::{
    ClientCondition, DedupKey, JobId, JobRecord, JobRequest, JobStatus, ResultPayload,
    StatusReport,
};
use crate::jobs::session::{ApplyOutcome, PollingSession, SessionObserver};

/// A job the orchestrator is following.
struct TrackedJob {
    record: JobRecord,
    dedup_key: DedupKey,
    hub: EventHub,
    session: PollingSession,
    /// Flips to `true` once the automatic result fetch has been handled.
    result_settled: watch::Sender<bool>,
    /// Serializes caller-driven result fetches for this job.
    fetch_gate: Arc<tokio::sync::Mutex<()>>,
}

/// Counts of tracked jobs per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Non-terminal jobs the client stopped waiting for.
    pub timed_out: usize,
    /// Non-terminal jobs the worker could no longer report on.
    pub lost: usize,
    /// Jobs with a cached result payload or result error.
    pub cached_results: usize,
}

struct Inner {
    client: Arc<dyn JobClient>,
    config: OrchestratorConfig,
    jobs: RwLock<HashMap<JobId, TrackedJob>>,
    /// One gate per in-progress submission key.
    submit_gates: Mutex<HashMap<DedupKey, Arc<tokio::sync::Mutex<()>>>>,
    /// Capacity held by submissions whose `create` is still in flight.
    reserved: AtomicUsize,
    cache: ResultCache,
}

/// One unit of tracking capacity, held from the capacity check until the job
/// is in the table or the submission failed.
struct SlotReservation<'a>(&'a AtomicUsize);

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Submits analysis jobs and tracks them until they finish.
///
/// Cloning is cheap; clones share the same job table.
#[derive(Clone)]
pub struct JobOrchestrator {
    inner: Arc<Inner>,
}

impl JobOrchestrator {
    pub fn new(client: Arc<dyn JobClient>, config: OrchestratorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                config,
                jobs: RwLock::new(HashMap::new()),
                submit_gates: Mutex::new(HashMap::new()),
                reserved: AtomicUsize::new(0),
                cache: ResultCache::new(),
            }),
        }
    }

    /// Submit a job and start polling it.
    ///
    /// An identical request (same scope, kind, and normalized config) that is
    /// still being tracked returns the existing job id instead of creating a
    /// second remote job. This also holds while the first `create` is in flight.
    pub async fn submit(&self, request: JobRequest) -> Result<JobId, JobError> {
        let key = request.dedup_key();
        let gate = self.inner.gate_for(&key);

        let result = {
            let _guard = gate.lock().await;
            self.submit_gated(request, &key).await
        };

        self.inner.release_gate(&key, gate);
        result
    }

    /// Validate an input set and submit a competitor gap analysis for it.
    pub async fn submit_gap(
        &self,
        owner_scope: impl Into<String>,
        inputs: &InputSet,
    ) -> Result<JobId, JobError> {
        let config = inputs.to_gap_config()?;
        self.submit(JobRequest::competitor_gap(owner_scope, &config))
            .await
    }

    async fn submit_gated(&self, request: JobRequest, key: &DedupKey) -> Result<JobId, JobError> {
        // Write lock: the capacity check and the reservation must not interleave
        // with another submission's.
        let reservation = {
            let jobs = self.inner.write_jobs();
            if let Some(existing) = jobs
                .values()
                .find(|t| &t.dedup_key == key && t.record.is_tracking())
            {
                info!(
                    job_id = %existing.record.id,
                    scope = %request.owner_scope,
                    "Identical job already in progress, reusing"
                );
                return Ok(existing.record.id.clone());
            }

            let active = jobs.values().filter(|t| t.record.is_tracking()).count();
            let reserved = self.inner.reserved.load(Ordering::SeqCst);
            if active + reserved >= self.inner.config.max_tracked_jobs {
                debug!(active, reserved, "No tracking capacity left");
                return Err(JobError::MaxJobsExceeded {
                    max: self.inner.config.max_tracked_jobs,
                });
            }
            self.inner.reserved.fetch_add(1, Ordering::SeqCst);
            SlotReservation(&self.inner.reserved)
        };

        let record = self.inner.client.create(&request).await.map_err(|e| {
            warn!(scope = %request.owner_scope, kind = %request.kind, "Job submission failed: {e}");
            e
        })?;
        let job_id = record.id.clone();

        info!(
            job_id = %job_id,
            scope = %record.owner_scope,
            kind = %record.kind,
            "Job submitted"
        );

        let poll = self.inner.config.poll_for(record.kind);
        let observer: Arc<dyn SessionObserver> = Arc::new(SessionLink(Arc::downgrade(&self.inner)));

        let mut jobs = self.inner.write_jobs();
        let session = PollingSession::start(
            job_id.clone(),
            Arc::clone(&self.inner.client),
            observer,
            poll,
        );
        if let Some(previous) = jobs.insert(
            job_id.clone(),
            TrackedJob {
                hub: EventHub::spawn(job_id.clone()),
                record,
                dedup_key: key.clone(),
                session,
                result_settled: watch::Sender::new(false),
                fetch_gate: Arc::default(),
            },
        ) {
            // Worker reused an id; the old entry cannot be followed any more.
            warn!(job_id = %job_id, "Worker returned an id that is already tracked");
            previous.hub.close();
            previous.session.stop();
        }
        // The job now counts as active; hand the slot back while still locked.
        drop(reservation);

        Ok(job_id)
    }

    /// Snapshot of a tracked job. No network call.
    pub fn get_job(&self, job_id: &JobId) -> Option<JobRecord> {
        self.inner
            .read_jobs()
            .get(job_id)
            .map(|t| t.record.clone())
    }

    /// All tracked jobs, oldest first.
    pub fn jobs(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self
            .inner
            .read_jobs()
            .values()
            .map(|t| t.record.clone())
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        records
    }

    /// Call `callback` with the current record, then on every change until the
    /// job ends or the subscription is cancelled.
    pub fn subscribe<F>(&self, job_id: &JobId, callback: F) -> Result<Subscription, JobError>
    where
        F: Fn(&JobEvent) + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(callback);
        let jobs = self.inner.read_jobs();
        let tracked = jobs
            .get(job_id)
            .ok_or_else(|| JobError::NotFound { id: job_id.clone() })?;

        // Replay is queued under the table lock so it cannot overtake a newer update.
        match tracked
            .hub
            .subscribe(job_id.clone(), Arc::clone(&callback), tracked.record.clone())
        {
            Some(subscription) => Ok(subscription),
            None => {
                // Job already finished; deliver the final snapshot only.
                let record = tracked.record.clone();
                drop(jobs);
                callback(&JobEvent::Updated(record));
                Ok(Subscription::detached(job_id.clone()))
            }
        }
    }

    /// Stream of events for one job. Ends when the job ends.
    pub fn watch(
        &self,
        job_id: &JobId,
    ) -> Result<(Subscription, UnboundedReceiverStream<JobEvent>), JobError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let subscription = self.subscribe(job_id, move |event| {
            let _ = tx.send(event.clone());
        })?;
        Ok((subscription, UnboundedReceiverStream::new(rx)))
    }

    /// Result payload of a completed job, from the cache or the worker.
    ///
    /// While the automatic fetch after completion is running, callers wait for
    /// it instead of sending their own request. At most one fetch per job is in
    /// flight at a time.
    ///
    /// Asking before the job completed is a caller bug and fails with
    /// `PreconditionFailed`.
    pub async fn fetch_result(&self, job_id: &JobId) -> Result<ResultPayload, Error> {
        let (record, mut settled, gate) = {
            let jobs = self.inner.read_jobs();
            let tracked = jobs
                .get(job_id)
                .ok_or_else(|| JobError::NotFound { id: job_id.clone() })?;
            (
                tracked.record.clone(),
                tracked.result_settled.subscribe(),
                Arc::clone(&tracked.fetch_gate),
            )
        };

        if record.status != JobStatus::Completed {
            error!(job_id = %job_id, status = %record.status, "Result requested before completion");
            return Err(ClientError::PreconditionFailed {
                id: job_id.clone(),
                status: record.status,
            }
            .into());
        }

        let settled = settled.wait_for(|done| *done).await.is_ok();
        if !settled {
            // Tracking was cancelled while the automatic fetch ran.
            return Err(JobError::NotFound { id: job_id.clone() }.into());
        }

        let _guard = gate.lock().await;
        if let Some(payload) = self.inner.cache.result(job_id) {
            return Ok(payload);
        }

        debug!(job_id = %job_id, "Fetching result from worker");
        match self.inner.client.fetch_result(job_id).await {
            Ok(payload) => {
                if self.inner.read_jobs().contains_key(job_id) {
                    self.inner.cache.store_result(job_id, payload.clone());
                }
                Ok(payload)
            }
            Err(e) => {
                if self.inner.read_jobs().contains_key(job_id) {
                    self.inner.cache.store_error(job_id, e.to_string());
                }
                Err(e.into())
            }
        }
    }

    /// Last error stored for a job's result, if any.
    pub fn cached_error(&self, job_id: &JobId) -> Option<String> {
        self.inner.cache.error(job_id)
    }

    /// Drop a cached result so the next `fetch_result` goes to the worker.
    pub fn invalidate_result(&self, job_id: &JobId) -> bool {
        self.inner.cache.invalidate(job_id)
    }

    /// Stop following a job and forget it. Remote cancellation is best-effort.
    ///
    /// Returns whether the job was tracked.
    pub async fn cancel_tracking(&self, job_id: &JobId) -> bool {
        let removed = self.inner.write_jobs().remove(job_id);
        let Some(tracked) = removed else {
            return false;
        };

        tracked.session.stop();
        tracked.hub.close();
        self.inner.cache.invalidate(job_id);

        info!(job_id = %job_id, status = %tracked.record.status, "Stopped tracking job");

        if tracked.record.status.is_active() {
            if let Err(e) = self.inner.client.cancel(job_id).await {
                warn!(job_id = %job_id, "Remote cancellation failed: {e}");
            }
        }
        true
    }

    /// Stop every polling session and evict all jobs. Call on teardown.
    pub async fn clear_all(&self) {
        let drained: Vec<TrackedJob> = self.inner.write_jobs().drain().map(|(_, t)| t).collect();
        if drained.is_empty() {
            return;
        }

        let count = drained.len();
        let mut sessions = Vec::new();
        for tracked in drained {
            tracked.hub.close();
            tracked.session.stop();
            sessions.push(tracked.session.join());
        }
        futures::future::join_all(sessions).await;
        self.inner.cache.clear();

        info!(count, "Cleared all tracked jobs");
    }

    /// Per-status counts of the tracked jobs.
    pub fn summary(&self) -> JobSummary {
        let jobs = self.inner.read_jobs();

        let mut summary = JobSummary::default();
        for tracked in jobs.values() {
            let record = &tracked.record;
            match record.status {
                JobStatus::Pending => summary.pending += 1,
                JobStatus::Processing => summary.processing += 1,
                JobStatus::Completed => summary.completed += 1,
                JobStatus::Failed => summary.failed += 1,
                JobStatus::Cancelled => summary.cancelled += 1,
            }
            if record.status.is_active() {
                match record.condition {
                    Some(ClientCondition::TimedOut { .. }) => summary.timed_out += 1,
                    Some(ClientCondition::Lost { .. }) => summary.lost += 1,
                    _ => {}
                }
            }
        }

        summary.total = jobs.len();
        summary.cached_results = self.inner.cache.len();
        summary
    }

    /// Number of jobs with a live polling session.
    pub fn active_count(&self) -> usize {
        self.inner
            .read_jobs()
            .values()
            .filter(|t| t.record.is_tracking())
            .count()
    }
}

impl Inner {
    fn read_jobs(&self) -> std::sync::RwLockReadGuard<'_, HashMap<JobId, TrackedJob>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_jobs(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<JobId, TrackedJob>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn gate_for(&self, key: &DedupKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = self.submit_gates.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(gates.entry(key.clone()).or_default())
    }

    fn release_gate(&self, key: &DedupKey, gate: Arc<tokio::sync::Mutex<()>>) {
        let mut gates = self.submit_gates.lock().unwrap_or_else(PoisonError::into_inner);
        // Ours plus the map's: nobody else is waiting on this key.
        if Arc::strong_count(&gate) == 2 {
            gates.remove(key);
        }
    }

    fn apply_status(&self, job_id: &JobId, report: StatusReport) -> ApplyOutcome {
        let mut jobs = self.write_jobs();
        let Some(tracked) = jobs.get_mut(job_id) else {
            return ApplyOutcome::Detached;
        };

        match tracked.record.apply(report) {
            Ok(true) => {
                let record = &tracked.record;
                info!(
                    job_id = %job_id,
                    status = %record.status,
                    progress = record.progress.unwrap_or(0),
                    "Job updated"
                );
                tracked.hub.publish(JobEvent::Updated(record.clone()));
                // Completed jobs close after the result fetch.
                if record.status.is_terminal() && record.status != JobStatus::Completed {
                    tracked.hub.close();
                }
                ApplyOutcome::Changed
            }
            Ok(false) => ApplyOutcome::Unchanged,
            Err(e) => {
                warn!(job_id = %job_id, "Ignoring status report: {e}");
                ApplyOutcome::Rejected
            }
        }
    }

    fn mark_degraded(&self, job_id: &JobId, consecutive_failures: u32, error: &ClientError) {
        let mut jobs = self.write_jobs();
        if let Some(tracked) = jobs.get_mut(job_id) {
            tracked
                .record
                .mark_transport_degraded(consecutive_failures, error.to_string());
            tracked.hub.publish(JobEvent::Updated(tracked.record.clone()));
        }
    }

    fn mark_timed_out(&self, job_id: &JobId, after: Duration) {
        let mut jobs = self.write_jobs();
        if let Some(tracked) = jobs.get_mut(job_id) {
            tracked.record.mark_timed_out(after);
            tracked.hub.publish(JobEvent::Updated(tracked.record.clone()));
            tracked.hub.close();
        }
    }

    fn mark_lost(&self, job_id: &JobId, error: &ClientError) {
        let mut jobs = self.write_jobs();
        if let Some(tracked) = jobs.get_mut(job_id) {
            tracked.record.mark_lost(error.to_string());
            info!(job_id = %job_id, status = %tracked.record.status, "Stopped following job the worker cannot report on");
            tracked.hub.publish(JobEvent::Updated(tracked.record.clone()));
            tracked.hub.close();
        }
    }

    fn store_result(&self, job_id: &JobId, result: Result<ResultPayload, ClientError>) {
        // Write lock: closing must not interleave with a concurrent subscribe.
        let jobs = self.write_jobs();
        let Some(tracked) = jobs.get(job_id) else {
            return;
        };

        match result {
            Ok(payload) => {
                self.cache.store_result(job_id, payload);
                debug!(job_id = %job_id, "Result cached");
                tracked.hub.publish(JobEvent::ResultReady {
                    job_id: job_id.clone(),
                });
            }
            Err(e) => {
                warn!(job_id = %job_id, "Result fetch failed: {e}");
                let reason = e.to_string();
                self.cache.store_error(job_id, reason.clone());
                tracked.hub.publish(JobEvent::ResultFailed {
                    job_id: job_id.clone(),
                    reason,
                });
            }
        }
        tracked.result_settled.send_replace(true);
        tracked.hub.close();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let jobs = self.jobs.get_mut().unwrap_or_else(PoisonError::into_inner);
        for tracked in jobs.values() {
            tracked.session.stop();
            tracked.hub.close();
        }
    }
}

/// Session-facing view of the orchestrator. Holds it weakly so running
/// sessions do not keep a dropped orchestrator alive.
struct SessionLink(Weak<Inner>);

impl SessionObserver for SessionLink {
    fn on_status(&self, job_id: &JobId, report: StatusReport) -> ApplyOutcome {
        match self.0.upgrade() {
            Some(inner) => inner.apply_status(job_id, report),
            None => ApplyOutcome::Detached,
        }
    }

    fn on_transport_degraded(&self, job_id: &JobId, consecutive_failures: u32, error: &ClientError) {
        if let Some(inner) = self.0.upgrade() {
            inner.mark_degraded(job_id, consecutive_failures, error);
        }
    }

    fn on_timeout(&self, job_id: &JobId, after: Duration) {
        if let Some(inner) = self.0.upgrade() {
            inner.mark_timed_out(job_id, after);
        }
    }

    fn on_lost(&self, job_id: &JobId, error: &ClientError) {
        if let Some(inner) = self.0.upgrade() {
            inner.mark_lost(job_id, error);
        }
    }

    fn on_result(&self, job_id: &JobId, result: Result<ResultPayload, ClientError>) {
        if let Some(inner) = self.0.upgrade() {
            inner.store_result(job_id, result);
        }
    }
}
