//! Data-transfer structs for GitHub REST payloads. Host-specific field names
//! stay here; the importer maps them onto the internal entity shapes.

use chrono::{DateTime, Utc};
use http::HeaderMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct UserRef {
    pub id: i64,
    pub login: String,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct RepoPermissions {
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub push: bool,
    #[serde(default)]
    pub pull: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawRepo {
    pub id: i64,
    pub name: String,
    pub full_name: String,
    #[serde(default)]
    pub private: bool,
    pub language: Option<String>,
    #[serde(default)]
    pub permissions: Option<RepoPermissions>,
}

impl RawRepo {
    /// `owner/name` split; GitHub guarantees exactly one slash in `full_name`.
    pub fn owner_and_name(&self) -> (&str, &str) {
        match self.full_name.split_once('/') {
            Some((owner, name)) => (owner, name),
            None => ("", self.name.as_str()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitAuthor {
    pub name: Option<String>,
    pub email: Option<String>,
    pub date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommitDetail {
    pub message: String,
    pub author: Option<GitAuthor>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct CommitStats {
    #[serde(default)]
    pub additions: i64,
    #[serde(default)]
    pub deletions: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawCommit {
    pub sha: String,
    pub commit: CommitDetail,
    pub author: Option<UserRef>,
    #[serde(default)]
    pub stats: Option<CommitStats>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawChangeRequest {
    pub id: i64,
    pub number: i64,
    pub title: String,
    pub state: String,
    pub user: Option<UserRef>,
    #[serde(default)]
    pub additions: Option<i64>,
    #[serde(default)]
    pub deletions: Option<i64>,
    pub merged_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawIssue {
    pub id: i64,
    pub number: i64,
    pub title: String,
    pub state: String,
    pub user: Option<UserRef>,
    /// GitHub's issues endpoint returns pull requests too, flagged by this
    /// stub object.
    #[serde(default)]
    pub pull_request: Option<serde_json::Value>,
    pub closed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RawIssue {
    pub fn is_change_request(&self) -> bool {
        self.pull_request.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookRequest {
    pub url: String,
    pub secret: String,
    pub events: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawWebhook {
    pub id: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitStatus {
    pub limit: i64,
    pub remaining: i64,
    pub reset: DateTime<Utc>,
}

pub fn parse_rate_limit(headers: &HeaderMap) -> Option<RateLimitStatus> {
    let limit = header_i64(headers, "x-ratelimit-limit")?;
    let remaining = header_i64(headers, "x-ratelimit-remaining")?;
    let reset_ts = header_i64(headers, "x-ratelimit-reset")?;
    let reset = DateTime::from_timestamp(reset_ts, 0)?;
    Some(RateLimitStatus {
        limit,
        remaining,
        reset,
    })
}

fn header_i64(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<i64>().ok())
}

pub fn parse_retry_after(headers: &HeaderMap) -> Option<std::time::Duration> {
    let value = headers.get(http::header::RETRY_AFTER)?.to_str().ok()?;
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(std::time::Duration::from_secs(seconds));
    }
    if let Ok(date) = httpdate::parse_http_date(value) {
        let now = std::time::SystemTime::now();
        if let Ok(wait) = date.duration_since(now) {
            return Some(wait);
        }
    }
    None
}
