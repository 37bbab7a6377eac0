//! Request validation and canned result payloads for the mock worker.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Value, json};

use crate::jobs::model::{AuditConfig, GapConfig, JobKind, JobRequest, OnPageConfig};

/// Hostname with at least one dot and an alphabetic TLD.
static DOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z]{2,63}$")
        .expect("domain pattern is valid")
});

/// Targets on this TLD are accepted but fail during analysis.
const UNRESOLVABLE_TLD: &str = ".invalid";

pub fn is_valid_domain(domain: &str) -> bool {
    DOMAIN.is_match(domain.trim())
}

/// Check a request's config against its kind. Returns the rejection reason.
pub(crate) fn validate(request: &JobRequest) -> Result<(), String> {
    if request.owner_scope.trim().is_empty() {
        return Err("ownerScope is required".to_string());
    }

    match request.kind {
        JobKind::SiteAudit => {
            let config: AuditConfig = parse(&request.config)?;
            check_domain(&config.domain)
        }
        JobKind::OnPageCheck => {
            let config: OnPageConfig = parse(&request.config)?;
            let host = config
                .url
                .trim()
                .strip_prefix("https://")
                .or_else(|| config.url.trim().strip_prefix("http://"))
                .ok_or_else(|| format!("Invalid URL: {}", config.url))?;
            check_domain(host.split('/').next().unwrap_or_default())?;
            if config.keyword.trim().is_empty() {
                return Err("keyword is required".to_string());
            }
            Ok(())
        }
        JobKind::CompetitorGap => {
            let config: GapConfig = parse(&request.config)?;
            if config.domains.len() < 2 {
                return Err("Gap analysis needs a target and at least one competitor".to_string());
            }
            config.domains.iter().try_for_each(|d| check_domain(d))
        }
    }
}

/// Failure the scripted lifecycle should end in, if any.
pub(crate) fn scripted_failure(request: &JobRequest) -> Option<(String, String)> {
    primary_target(request)
        .filter(|target| target.to_lowercase().ends_with(UNRESOLVABLE_TLD))
        .map(|target| {
            (
                "dns_failure".to_string(),
                format!("Domain {target} does not resolve"),
            )
        })
}

/// Canned result for a completed job.
pub(crate) fn result_for(job_id: &str, request: &JobRequest) -> Value {
    let target = primary_target(request).unwrap_or_default();

    match request.kind {
        JobKind::SiteAudit => json!({
            "jobId": job_id,
            "domain": target,
            "score": 78,
            "pagesCrawled": 42,
            "issues": [
                {"severity": "high", "code": "missing_title", "count": 3},
                {"severity": "medium", "code": "duplicate_meta_description", "count": 7},
                {"severity": "low", "code": "image_missing_alt", "count": 19},
            ],
        }),
        JobKind::OnPageCheck => json!({
            "jobId": job_id,
            "url": target,
            "keyword": request.config.get("keyword").cloned().unwrap_or(Value::Null),
            "score": 64,
            "checks": [
                {"name": "keyword_in_title", "passed": true},
                {"name": "keyword_in_h1", "passed": false},
                {"name": "meta_description_length", "passed": true},
                {"name": "internal_links", "passed": false},
            ],
        }),
        JobKind::CompetitorGap => {
            let domains: Vec<String> = request
                .config
                .get("domains")
                .and_then(|d| serde_json::from_value(d.clone()).ok())
                .unwrap_or_default();
            let keywords = ["technical seo audit", "backlink checker", "keyword research tool"];
            let rows: Vec<Value> = keywords
                .iter()
                .enumerate()
                .map(|(i, keyword)| {
                    let positions: serde_json::Map<String, Value> = domains
                        .iter()
                        .enumerate()
                        .map(|(j, domain)| {
                            // Target missing from the first keyword makes a gap.
                            let position = if i == 0 && j == 0 {
                                Value::Null
                            } else {
                                json!(1 + (i * 3 + j * 2) % 20)
                            };
                            (domain.clone(), position)
                        })
                        .collect();
                    json!({
                        "keyword": keyword,
                        "searchVolume": 1200 - i * 350,
                        "positions": positions,
                    })
                })
                .collect();
            json!({
                "jobId": job_id,
                "target": target,
                "competitors": domains.iter().skip(1).collect::<Vec<_>>(),
                "keywords": rows,
            })
        }
    }
}

fn primary_target(request: &JobRequest) -> Option<String> {
    let config = &request.config;
    let value = match request.kind {
        JobKind::SiteAudit => config.get("domain"),
        JobKind::OnPageCheck => config.get("url"),
        JobKind::CompetitorGap => config.get("domains").and_then(|d| d.get(0)),
    };
    value.and_then(Value::as_str).map(str::to_string)
}

fn parse<T: serde::de::DeserializeOwned>(config: &Value) -> Result<T, String> {
    serde_json::from_value(config.clone()).map_err(|e| format!("Invalid config: {e}"))
}

fn check_domain(domain: &str) -> Result<(), String> {
    if is_valid_domain(domain) {
        Ok(())
    } else {
        Err(format!("Invalid domain: {domain}"))
    }
}
