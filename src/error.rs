//! Error types for the analysis job orchestrator.

use crate::jobs::model::{JobId, JobStatus};

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Input error: {0}")]
    Input(#[from] InputError),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Input set validation errors. Recoverable by correcting the input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InputError {
    #[error("Input set is full ({max} additional identifiers allowed)")]
    CapacityExceeded { max: usize },

    #[error("Identifier {identifier} is already in the input set")]
    DuplicateMember { identifier: String },

    #[error("Index {index} is out of range (input set has {len} entries)")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("The primary identifier can be replaced but not removed")]
    PrimaryNotRemovable,

    #[error("The primary identifier is empty")]
    EmptyPrimary,
}

/// Errors from talking to the remote worker.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Submission rejected by worker: {reason}")]
    SubmissionRejected { reason: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Job {id} not found on worker")]
    NotFound { id: JobId },

    #[error("Precondition failed for job {id}: result requested while {status}")]
    PreconditionFailed { id: JobId, status: JobStatus },

    /// The worker answered, but not with what the protocol promises.
    #[error("Invalid response from worker: {0}")]
    InvalidResponse(String),
}

impl ClientError {
    /// Whether this failure is network-level and worth retrying on the next tick.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Job tracking errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: JobId },

    #[error("Maximum tracked jobs ({max}) exceeded")]
    MaxJobsExceeded { max: usize },

    #[error("Job {id} already in state {from}, cannot transition to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Submission failed: {0}")]
    Submission(#[from] ClientError),

    #[error("Invalid input: {0}")]
    Input(#[from] InputError),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
