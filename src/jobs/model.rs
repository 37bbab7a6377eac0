//! Job data model — records, statuses, requests, and worker status reports.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::JobError;

/// Opaque job identifier assigned by the remote worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle status of a job, as reported by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted by the worker, not started yet.
    Pending,
    /// Worker is executing the analysis.
    Processing,
    /// Result is available.
    Completed,
    /// Worker gave up; `error` carries the cause.
    Failed,
    /// Cancelled on the worker.
    Cancelled,
}

impl JobStatus {
    /// Check if the worker may report `target` after `self`.
    ///
    /// Status only moves forward. Repeating a non-terminal status is allowed.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Pending, Pending) | (Pending, Processing) |
            (Pending, Completed) | (Pending, Failed) | (Pending, Cancelled) |
            (Processing, Processing) |
            (Processing, Completed) | (Processing, Failed) | (Processing, Cancelled)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if the job is still pollable.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Which analysis the worker should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Full site audit of one domain.
    SiteAudit,
    /// On-page SEO check of one URL against a keyword.
    OnPageCheck,
    /// Keyword gap between a target and its competitors.
    CompetitorGap,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SiteAudit => write!(f, "site_audit"),
            Self::OnPageCheck => write!(f, "on_page_check"),
            Self::CompetitorGap => write!(f, "competitor_gap"),
        }
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "site_audit" | "audit" => Ok(Self::SiteAudit),
            "on_page_check" | "on_page" => Ok(Self::OnPageCheck),
            "competitor_gap" | "gap" => Ok(Self::CompetitorGap),
            _ => Err(format!("Unknown job kind: {}", s)),
        }
    }
}

/// Structured failure cause reported by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub code: String,
    pub message: String,
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Reference to a completed job's result payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultRef(pub String);

/// The opaque result document produced by the worker.
pub type ResultPayload = serde_json::Value;

/// Client-side condition attached to a record. Never set by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientCondition {
    /// Consecutive status checks failed at the transport level. Polling continues.
    TransportDegraded {
        consecutive_failures: u32,
        reason: String,
    },
    /// The client stopped waiting. The job may still be running remotely.
    TimedOut { after_ms: u64 },
    /// The worker answered but can no longer report on the job (unknown id,
    /// unreadable status). Polling stopped.
    Lost { reason: String },
}

/// How the UI should label a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Running,
    Succeeded,
    Failed,
    Cancelled,
    /// Client stopped following the job; the remote result is unknown.
    Unknown,
}

/// One status report from `GET /jobs/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<ResultRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
}

impl StatusReport {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            progress: None,
            message: None,
            result_ref: None,
            error: None,
        }
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error = Some(JobFailure {
            code: code.into(),
            message: message.into(),
        });
        self
    }
}

/// A request to start one analysis job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    /// Parent context the job belongs to (e.g. project id).
    pub owner_scope: String,
    #[serde(rename = "type")]
    pub kind: JobKind,
    pub config: serde_json::Value,
}

/// Site audit configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditConfig {
    pub domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pages: Option<u32>,
}

/// On-page SEO check configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnPageConfig {
    pub url: String,
    pub keyword: String,
}

/// Competitor gap configuration: the ordered participant list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GapConfig {
    pub domains: Vec<String>,
}

impl JobRequest {
    pub fn new(owner_scope: impl Into<String>, kind: JobKind, config: serde_json::Value) -> Self {
        Self {
            owner_scope: owner_scope.into(),
            kind,
            config,
        }
    }

    pub fn site_audit(owner_scope: impl Into<String>, config: &AuditConfig) -> Self {
        Self::typed(owner_scope, JobKind::SiteAudit, config)
    }

    pub fn on_page_check(owner_scope: impl Into<String>, config: &OnPageConfig) -> Self {
        Self::typed(owner_scope, JobKind::OnPageCheck, config)
    }

    pub fn competitor_gap(owner_scope: impl Into<String>, config: &GapConfig) -> Self {
        Self::typed(owner_scope, JobKind::CompetitorGap, config)
    }

    fn typed<T: Serialize>(owner_scope: impl Into<String>, kind: JobKind, config: &T) -> Self {
        // Plain structs of strings and integers always serialize.
        let config = serde_json::to_value(config).unwrap_or(serde_json::Value::Null);
        Self::new(owner_scope, kind, config)
    }

    /// Key identifying equivalent requests: same scope, kind, and normalized config.
    ///
    /// Domains, URL hosts and keywords compare case-insensitively. Everything
    /// else, URL paths included, keeps its case.
    pub fn dedup_key(&self) -> DedupKey {
        let mut config = canonical_json(&self.config);
        fold_case_insensitive_fields(self.kind, &mut config);
        DedupKey(format!(
            "{}|{}|{}",
            self.owner_scope.trim(),
            self.kind,
            config
        ))
    }
}

/// Normalized identity of a request, used for submission de-duplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey(String);

/// Copy with sorted keys and trimmed strings.
fn canonical_json(value: &serde_json::Value) -> serde_json::Value {
    use serde_json::Value;

    fn normalize(value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(s.trim().to_string()),
            Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
            Value::Object(map) => {
                let sorted: BTreeMap<&String, Value> =
                    map.iter().map(|(k, v)| (k, normalize(v))).collect();
                Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
            }
            other => other.clone(),
        }
    }

    normalize(value)
}

fn fold_case_insensitive_fields(kind: JobKind, config: &mut serde_json::Value) {
    use serde_json::Value;

    fn lower(value: &mut Value) {
        if let Value::String(s) = value {
            *s = s.to_lowercase();
        }
    }

    match kind {
        JobKind::SiteAudit => {
            if let Some(domain) = config.get_mut("domain") {
                lower(domain);
            }
        }
        JobKind::CompetitorGap => {
            if let Some(Value::Array(domains)) = config.get_mut("domains") {
                domains.iter_mut().for_each(lower);
            }
        }
        JobKind::OnPageCheck => {
            if let Some(Value::String(url)) = config.get_mut("url") {
                *url = fold_url_origin(url);
            }
            if let Some(keyword) = config.get_mut("keyword") {
                lower(keyword);
            }
        }
    }
}

/// Lower-case a URL's scheme and host. Path, query and fragment are kept.
fn fold_url_origin(url: &str) -> String {
    let (scheme, rest) = match url.split_once("://") {
        Some((scheme, rest)) => (Some(scheme), rest),
        None => (None, url),
    };
    let host_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let (host, tail) = rest.split_at(host_end);
    match scheme {
        Some(scheme) => format!(
            "{}://{}{tail}",
            scheme.to_lowercase(),
            host.to_lowercase()
        ),
        None => format!("{}{tail}", host.to_lowercase()),
    }
}

/// Client-side view of one submitted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: JobId,
    /// Immutable after creation.
    pub owner_scope: String,
    pub kind: JobKind,
    pub status: JobStatus,
    /// 0–100, absent until the worker reports it.
    pub progress: Option<u8>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Latest note from the worker, overwritten on each poll.
    pub message: Option<String>,
    /// Echo of the request payload. Never mutated.
    pub config: serde_json::Value,
    pub result_ref: Option<ResultRef>,
    pub error: Option<JobFailure>,
    pub condition: Option<ClientCondition>,
}

impl JobRecord {
    /// Create a pending record for a job the worker just accepted.
    pub fn new(id: JobId, request: &JobRequest, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            owner_scope: request.owner_scope.clone(),
            kind: request.kind,
            status: JobStatus::Pending,
            progress: None,
            created_at,
            updated_at: created_at,
            message: None,
            config: request.config.clone(),
            result_ref: None,
            error: None,
            condition: None,
        }
    }

    /// Apply a worker status report. Returns whether anything observable changed.
    ///
    /// The report's status is authoritative; nothing is inferred locally
    /// (progress 100 does not imply completion). Progress never decreases.
    pub fn apply(&mut self, report: StatusReport) -> Result<bool, JobError> {
        if !self.status.can_transition_to(report.status) {
            return Err(JobError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: report.status,
            });
        }

        let before = (
            self.status,
            self.progress,
            self.message.clone(),
            self.condition.clone(),
        );

        self.status = report.status;

        if let Some(reported) = report.progress {
            let reported = reported.min(100);
            match self.progress {
                Some(current) if reported < current => {
                    tracing::debug!(
                        job_id = %self.id,
                        current,
                        reported,
                        "Ignoring progress regression"
                    );
                }
                _ => self.progress = Some(reported),
            }
        }

        self.message = report.message;

        match report.status {
            JobStatus::Completed => {
                self.result_ref = Some(
                    report
                        .result_ref
                        .unwrap_or_else(|| ResultRef(self.id.to_string())),
                );
                self.error = None;
            }
            JobStatus::Failed => {
                self.error = Some(report.error.unwrap_or_else(|| JobFailure {
                    code: "unknown".to_string(),
                    message: "Worker reported failure without detail".to_string(),
                }));
                self.result_ref = None;
            }
            _ => {}
        }

        // A successful status check clears any transport warning.
        if matches!(self.condition, Some(ClientCondition::TransportDegraded { .. })) {
            self.condition = None;
        }

        let after = (
            self.status,
            self.progress,
            self.message.clone(),
            self.condition.clone(),
        );
        let changed = before != after;
        if changed {
            self.updated_at = Utc::now();
        }
        Ok(changed)
    }

    /// Flag consecutive transport failures on a still-running job.
    pub fn mark_transport_degraded(&mut self, consecutive_failures: u32, reason: impl Into<String>) {
        self.condition = Some(ClientCondition::TransportDegraded {
            consecutive_failures,
            reason: reason.into(),
        });
        self.updated_at = Utc::now();
    }

    /// Record that the client stopped waiting.
    pub fn mark_timed_out(&mut self, after: Duration) {
        self.condition = Some(ClientCondition::TimedOut {
            after_ms: after.as_millis() as u64,
        });
        self.updated_at = Utc::now();
    }

    /// Record that the worker can no longer report on this job.
    pub fn mark_lost(&mut self, reason: impl Into<String>) {
        self.condition = Some(ClientCondition::Lost {
            reason: reason.into(),
        });
        self.updated_at = Utc::now();
    }

    /// Whether the client gave up on this job before it finished.
    pub fn is_abandoned(&self) -> bool {
        matches!(
            self.condition,
            Some(ClientCondition::TimedOut { .. } | ClientCondition::Lost { .. })
        )
    }

    /// Whether a polling session should still be following this job.
    pub fn is_tracking(&self) -> bool {
        self.status.is_active() && !self.is_abandoned()
    }

    pub fn outcome(&self) -> JobOutcome {
        match self.status {
            JobStatus::Completed => JobOutcome::Succeeded,
            JobStatus::Failed => JobOutcome::Failed,
            JobStatus::Cancelled => JobOutcome::Cancelled,
            JobStatus::Pending | JobStatus::Processing if self.is_abandoned() => {
                JobOutcome::Unknown
            }
            JobStatus::Pending | JobStatus::Processing => JobOutcome::Running,
        }
    }
}
