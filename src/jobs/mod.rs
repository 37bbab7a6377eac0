//! Analysis jobs — submit to the remote worker and follow them to completion.
//!
//! Core components:
//! - `model` — Job records, status lifecycle, requests and reports
//! - `input_set` — Primary identifier plus bounded additional identifiers
//! - `client` — Transport to the worker (`JobClient` trait, HTTP implementation)
//! - `session` — One polling loop per job (interval, timeout, backoff)
//! - `events` — Per-job subscriber fan-out
//! - `cache` — Fetched result payloads and errors
//! - `orchestrator` — Facade: submit, de-duplicate, track, cancel, tear down

pub mod cache;
pub mod client;
pub mod events;
pub mod input_set;
pub mod model;
pub mod orchestrator;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{CachedResult, ResultCache};
pub use client::{HttpJobClient, JobClient};
pub use events::{JobEvent, Subscription};
pub use input_set::InputSet;
pub use model::{
    AuditConfig, ClientCondition, GapConfig, JobId, JobKind, JobOutcome, JobRecord, JobRequest,
    JobStatus, OnPageConfig, StatusReport,
};
pub use orchestrator::{JobOrchestrator, JobSummary};
pub use session::{PollingSession, SessionEnd};
