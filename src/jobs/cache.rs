//! Result cache — last fetched payload and last error per job.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};

use crate::jobs::model::{JobId, ResultPayload};

/// Cached state for one job.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResult {
    pub payload: Option<ResultPayload>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// In-memory result cache keyed by job id. Invalidation is explicit.
#[derive(Debug, Default)]
pub struct ResultCache {
    entries: RwLock<HashMap<JobId, CachedResult>>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a fetched payload. Clears any earlier error for the job.
    pub fn store_result(&self, job_id: &JobId, payload: ResultPayload) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            job_id.clone(),
            CachedResult {
                payload: Some(payload),
                error: None,
                updated_at: Utc::now(),
            },
        );
    }

    /// Store the latest error. A previously fetched payload is kept.
    pub fn store_error(&self, job_id: &JobId, error: impl Into<String>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.entry(job_id.clone()).or_insert_with(|| CachedResult {
            payload: None,
            error: None,
            updated_at: Utc::now(),
        });
        entry.error = Some(error.into());
        entry.updated_at = Utc::now();
    }

    pub fn get(&self, job_id: &JobId) -> Option<CachedResult> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
            .cloned()
    }

    pub fn result(&self, job_id: &JobId) -> Option<ResultPayload> {
        self.get(job_id).and_then(|e| e.payload)
    }

    pub fn error(&self, job_id: &JobId) -> Option<String> {
        self.get(job_id).and_then(|e| e.error)
    }

    /// Drop the entry for one job. Returns whether it existed.
    pub fn invalidate(&self, job_id: &JobId) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(job_id)
            .is_some()
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of jobs with a cached payload or error.
    pub(crate) fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}
