//! Configuration types.

use std::time::Duration;

use rand::Rng;
use secrecy::SecretString;

use crate::error::ConfigError;
use crate::jobs::model::JobKind;

/// Delay policy between status checks.
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// Constant cadence of `PollConfig::interval`.
    Fixed,
    /// Grow the delay by `factor` after each check, capped at `max`.
    /// Resets to the base interval after a status change.
    Exponential {
        factor: f64,
        max: Duration,
        /// Fraction of the delay (0.0–1.0) randomized up or down.
        jitter: f64,
    },
}

impl Backoff {
    /// Delay before the next check, given the base interval and how many
    /// checks in a row produced no change.
    pub fn delay(&self, interval: Duration, quiet_checks: u32) -> Duration {
        match self {
            Self::Fixed => interval,
            Self::Exponential {
                factor,
                max,
                jitter,
            } => {
                let exp = quiet_checks.min(32) as i32;
                let scaled = interval.as_secs_f64() * factor.max(1.0).powi(exp);
                let capped = scaled.min(max.as_secs_f64());
                let jitter = jitter.clamp(0.0, 1.0);
                let spread = if jitter > 0.0 {
                    rand::thread_rng().gen_range(-jitter..=jitter)
                } else {
                    0.0
                };
                Duration::from_secs_f64((capped * (1.0 + spread)).max(0.0))
            }
        }
    }
}

/// Polling behaviour for one job.
#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    /// Base delay between status checks.
    pub interval: Duration,
    /// Give up waiting after this long (client-local; the job may still run).
    pub timeout: Duration,
    pub backoff: Backoff,
    /// Consecutive transport failures before subscribers are told.
    pub transport_failure_threshold: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(600), // 10 minutes
            backoff: Backoff::Fixed,
            transport_failure_threshold: 2,
        }
    }
}

impl PollConfig {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            ..Self::default()
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

impl JobKind {
    /// Per-feature polling preset.
    pub fn default_poll(&self) -> PollConfig {
        match self {
            Self::SiteAudit => PollConfig::new(Duration::from_secs(2), Duration::from_secs(600)),
            Self::OnPageCheck => {
                PollConfig::new(Duration::from_millis(1500), Duration::from_secs(120))
            }
            Self::CompetitorGap => {
                PollConfig::new(Duration::from_secs(3), Duration::from_secs(300))
            }
        }
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Base URL of the remote analysis worker.
    pub worker_url: String,
    /// Bearer token for the worker, if it requires one.
    pub api_token: Option<SecretString>,
    /// Maximum number of jobs actively polled at once.
    pub max_tracked_jobs: usize,
    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
    /// Overrides every kind's polling preset when set.
    pub poll_override: Option<PollConfig>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_url: "http://127.0.0.1:8090".to_string(),
            api_token: None,
            max_tracked_jobs: 20,
            request_timeout: Duration::from_secs(15),
            poll_override: None,
        }
    }
}

impl OrchestratorConfig {
    /// Polling settings for a job kind.
    pub fn poll_for(&self, kind: JobKind) -> PollConfig {
        self.poll_override
            .clone()
            .unwrap_or_else(|| kind.default_poll())
    }

    /// Load from `SEO_JOBS_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let worker_url = std::env::var("SEO_JOBS_WORKER_URL")
            .map_err(|_| ConfigError::MissingEnvVar("SEO_JOBS_WORKER_URL".to_string()))?;
        Self::from_lookup(worker_url, |key| std::env::var(key).ok())
    }

    /// Like `from_env`, but against an explicit worker URL.
    pub fn for_worker(worker_url: impl Into<String>) -> Result<Self, ConfigError> {
        Self::from_lookup(worker_url.into(), |key| std::env::var(key).ok())
    }

    fn from_lookup(
        worker_url: String,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_tracked_jobs =
            parse_var(&lookup, "SEO_JOBS_MAX_TRACKED")?.unwrap_or(defaults.max_tracked_jobs);

        let request_timeout = parse_var::<u64>(&lookup, "SEO_JOBS_REQUEST_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.request_timeout);

        let interval = parse_var::<u64>(&lookup, "SEO_JOBS_POLL_INTERVAL_MS")?;
        let timeout = parse_var::<u64>(&lookup, "SEO_JOBS_POLL_TIMEOUT_MS")?;
        let poll_override = match (interval, timeout) {
            (None, None) => None,
            (interval, timeout) => {
                let base = PollConfig::default();
                Some(PollConfig::new(
                    interval.map(Duration::from_millis).unwrap_or(base.interval),
                    timeout.map(Duration::from_millis).unwrap_or(base.timeout),
                ))
            }
        };

        if let Some(ref poll) = poll_override {
            if poll.interval.is_zero() {
                return Err(ConfigError::InvalidValue {
                    key: "SEO_JOBS_POLL_INTERVAL_MS".to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }

        Ok(Self {
            worker_url: worker_url.trim_end_matches('/').to_string(),
            api_token: lookup("SEO_JOBS_API_TOKEN")
                .filter(|s| !s.is_empty())
                .map(SecretString::from),
            max_tracked_jobs,
            request_timeout,
            poll_override,
        })
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
    }
}
