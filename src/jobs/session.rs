//! Polling session — follows one job from submission to a terminal state.
//!
//! A session is a single spawned task. It issues one status check at a time
//! and schedules the next check only after the previous one resolved, so
//! reports are applied in request order and a slow worker defers the
//! cadence instead of stacking requests.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PollConfig;
use crate::error::ClientError;
use crate::jobs::client::JobClient;
use crate::jobs::model::{JobId, JobStatus, ResultPayload, StatusReport};

/// What the observer did with a status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The record changed.
    Changed,
    /// Nothing observable changed.
    Unchanged,
    /// The report was inconsistent with the record (e.g. a status regression).
    Rejected,
    /// Nobody tracks this job any more; the session should end.
    Detached,
}

/// Receives everything a session learns about its job.
pub trait SessionObserver: Send + Sync {
    fn on_status(&self, job_id: &JobId, report: StatusReport) -> ApplyOutcome;

    /// Called once the consecutive transport failure count reaches the
    /// configured threshold, and again for each further failure.
    fn on_transport_degraded(&self, job_id: &JobId, consecutive_failures: u32, error: &ClientError);

    fn on_timeout(&self, job_id: &JobId, after: Duration);

    /// The worker answered but cannot report on the job (unknown id,
    /// unreadable status). Polling ends after this call.
    fn on_lost(&self, job_id: &JobId, error: &ClientError);

    fn on_result(&self, job_id: &JobId, result: Result<ResultPayload, ClientError>);
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The worker reported a terminal status.
    Terminal(JobStatus),
    /// The client-local timeout elapsed.
    TimedOut,
    /// The worker can no longer report on the job.
    Lost,
    /// `stop()` was called.
    Stopped,
    /// The observer dropped the job.
    Detached,
}

/// Handle to a running polling loop.
pub struct PollingSession {
    job_id: JobId,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<SessionEnd>,
}

impl PollingSession {
    /// Start polling `job_id`. The first check runs immediately.
    pub fn start(
        job_id: JobId,
        client: Arc<dyn JobClient>,
        observer: Arc<dyn SessionObserver>,
        config: PollConfig,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);

        info!(
            job_id = %job_id,
            interval_ms = config.interval.as_millis() as u64,
            timeout_ms = config.timeout.as_millis() as u64,
            "Polling session started"
        );

        let handle = tokio::spawn(run(job_id.clone(), client, observer, config, stop_rx));

        Self {
            job_id,
            stop_tx,
            handle,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Stop polling. A check already in flight completes but its result is
    /// discarded. Safe to call repeatedly and after the session ended.
    pub fn stop(&self) {
        let was_stopped = self.stop_tx.send_replace(true);
        if !was_stopped && !self.handle.is_finished() {
            debug!(job_id = %self.job_id, "Polling session stop requested");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the loop to exit.
    pub async fn join(self) -> SessionEnd {
        match self.handle.await {
            Ok(end) => end,
            Err(e) => {
                warn!(job_id = %self.job_id, "Polling session task failed: {e}");
                SessionEnd::Stopped
            }
        }
    }
}

impl std::fmt::Debug for PollingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingSession")
            .field("job_id", &self.job_id)
            .field("finished", &self.handle.is_finished())
            .finish()
    }
}

async fn run(
    job_id: JobId,
    client: Arc<dyn JobClient>,
    observer: Arc<dyn SessionObserver>,
    config: PollConfig,
    mut stop_rx: watch::Receiver<bool>,
) -> SessionEnd {
    let started = Instant::now();
    let deadline = started + config.timeout;
    let mut next_check = started;
    let mut consecutive_failures: u32 = 0;
    let mut quiet_checks: u32 = 0;
    let mut attempt: u64 = 0;

    loop {
        tokio::select! {
            biased;
            // Also fires if the handle was dropped.
            _ = stop_rx.changed() => return SessionEnd::Stopped,
            _ = tokio::time::sleep_until(next_check.min(deadline)) => {}
        }
        if *stop_rx.borrow() {
            return SessionEnd::Stopped;
        }

        if Instant::now() >= deadline {
            info!(
                job_id = %job_id,
                timeout_ms = config.timeout.as_millis() as u64,
                "Stopped waiting for job; outcome unknown"
            );
            observer.on_timeout(&job_id, config.timeout);
            return SessionEnd::TimedOut;
        }

        attempt += 1;
        debug!(job_id = %job_id, attempt, "Checking job status");
        let result = client.fetch_status(&job_id).await;

        if *stop_rx.borrow() {
            debug!(job_id = %job_id, "Discarding status received after stop");
            return SessionEnd::Stopped;
        }

        match result {
            Ok(report) => {
                consecutive_failures = 0;
                let status = report.status;
                match observer.on_status(&job_id, report) {
                    ApplyOutcome::Detached => return SessionEnd::Detached,
                    ApplyOutcome::Rejected => {
                        quiet_checks += 1;
                    }
                    outcome => {
                        if outcome == ApplyOutcome::Changed {
                            quiet_checks = 0;
                        } else {
                            quiet_checks += 1;
                        }

                        if status.is_terminal() {
                            if status == JobStatus::Completed {
                                let result = client.fetch_result(&job_id).await;
                                if *stop_rx.borrow() {
                                    return SessionEnd::Stopped;
                                }
                                observer.on_result(&job_id, result);
                            }
                            info!(job_id = %job_id, status = %status, "Polling session finished");
                            return SessionEnd::Terminal(status);
                        }
                    }
                }
            }
            Err(e) if !e.is_transport() => {
                warn!(job_id = %job_id, "Worker cannot report on job; polling stopped: {e}");
                observer.on_lost(&job_id, &e);
                return SessionEnd::Lost;
            }
            Err(e) => {
                consecutive_failures += 1;
                quiet_checks += 1;
                warn!(
                    job_id = %job_id,
                    consecutive_failures,
                    "Status check failed: {e}"
                );
                if consecutive_failures >= config.transport_failure_threshold {
                    observer.on_transport_degraded(&job_id, consecutive_failures, &e);
                }
            }
        }

        next_check = Instant::now() + config.backoff.delay(config.interval, quiet_checks);
    }
}
