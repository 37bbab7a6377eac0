//! Job events and subscriptions.
//!
//! Each tracked job owns an `EventHub`: an unbounded queue drained by one
//! dispatcher task that invokes subscriber callbacks in publish order.
//! Publishing never blocks the polling session.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::jobs::model::{JobId, JobRecord};

/// Something observable happened to a tracked job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    /// The record changed (status, progress, message, or client condition).
    Updated(JobRecord),
    /// The completed job's payload is in the result cache.
    ResultReady { job_id: JobId },
    /// The completed job's payload could not be fetched.
    ResultFailed { job_id: JobId, reason: String },
}

impl JobEvent {
    pub fn job_id(&self) -> &JobId {
        match self {
            Self::Updated(record) => &record.id,
            Self::ResultReady { job_id } | Self::ResultFailed { job_id, .. } => job_id,
        }
    }
}

/// Subscriber callback.
pub type Callback = Arc<dyn Fn(&JobEvent) + Send + Sync>;

enum Command {
    Subscribe {
        id: u64,
        callback: Callback,
        active: Arc<AtomicBool>,
        replay: JobRecord,
    },
    Unsubscribe(u64),
    Publish(JobEvent),
    Close,
}

/// Per-job fan-out of events to subscribers.
pub(crate) struct EventHub {
    tx: mpsc::UnboundedSender<Command>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl EventHub {
    /// Create the hub and spawn its dispatcher.
    pub(crate) fn spawn(job_id: JobId) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(job_id, rx));
        Self {
            tx,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn publish(&self, event: JobEvent) {
        // A closed hub simply has nobody left to tell.
        let _ = self.tx.send(Command::Publish(event));
    }

    /// Register a callback. `replay` is delivered to it first.
    /// Returns `None` once the hub has closed.
    pub(crate) fn subscribe(&self, job_id: JobId, callback: Callback, replay: JobRecord) -> Option<Subscription> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        self.tx
            .send(Command::Subscribe {
                id,
                callback,
                active: Arc::clone(&active),
                replay,
            })
            .ok()?;
        Some(Subscription {
            job_id,
            id,
            active,
            tx: Some(self.tx.clone()),
        })
    }

    /// Deliver everything queued so far, then drop all subscribers.
    pub(crate) fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(Command::Close);
        }
    }
}

async fn dispatch(job_id: JobId, mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut subscribers: HashMap<u64, (Callback, Arc<AtomicBool>)> = HashMap::new();

    while let Some(command) = rx.recv().await {
        match command {
            Command::Subscribe {
                id,
                callback,
                active,
                replay,
            } => {
                if active.load(Ordering::Acquire) {
                    invoke(&job_id, &callback, &JobEvent::Updated(replay));
                }
                subscribers.insert(id, (callback, active));
            }
            Command::Unsubscribe(id) => {
                subscribers.remove(&id);
            }
            Command::Publish(event) => {
                // Stable delivery order across subscribers.
                let mut ids: Vec<u64> = subscribers.keys().copied().collect();
                ids.sort_unstable();
                for id in ids {
                    if let Some((callback, active)) = subscribers.get(&id) {
                        if active.load(Ordering::Acquire) {
                            invoke(&job_id, callback, &event);
                        }
                    }
                }
            }
            Command::Close => break,
        }
    }

    debug!(job_id = %job_id, subscribers = subscribers.len(), "Event hub closed");
}

fn invoke(job_id: &JobId, callback: &Callback, event: &JobEvent) {
    if std::panic::catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
        warn!(job_id = %job_id, "Subscriber callback panicked");
    }
}

/// Handle to one subscription. Call `unsubscribe` to stop receiving events.
///
/// Dropping the handle leaves the subscription in place until the job ends.
pub struct Subscription {
    job_id: JobId,
    id: u64,
    active: Arc<AtomicBool>,
    tx: Option<mpsc::UnboundedSender<Command>>,
}

impl Subscription {
    /// A subscription with nothing behind it, for jobs that already ended.
    pub(crate) fn detached(job_id: JobId) -> Self {
        Self {
            job_id,
            id: 0,
            active: Arc::new(AtomicBool::new(false)),
            tx: None,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stop delivery. No new callback invocation starts after this returns. Idempotent.
    pub fn unsubscribe(&mut self) {
        self.active.store(false, Ordering::Release);
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Command::Unsubscribe(self.id));
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("job_id", &self.job_id)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
