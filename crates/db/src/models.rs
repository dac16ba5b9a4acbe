use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "sync_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Syncing,
    Active,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "change_request_state", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ChangeRequestState {
    Open,
    Closed,
    Merged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "issue_state", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum IssueState {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "org_role", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OrgRole {
    Admin,
    Member,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserRow {
    pub id: Uuid,
    pub github_id: Option<i64>,
    pub login: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OrgMemberRow {
    pub org_id: Uuid,
    pub user_id: Uuid,
    pub role: OrgRole,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RepositoryRow {
    pub id: Uuid,
    pub github_id: i64,
    pub org_id: Uuid,
    pub name: String,
    pub full_name: String,
    #[sqlx(rename = "private")]
    #[serde(rename = "private")]
    pub is_private: bool,
    pub language: Option<String>,
    pub webhook_id: Option<i64>,
    pub webhook_secret: String,
    pub sync_status: SyncStatus,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CommitRow {
    pub id: Uuid,
    pub repo_id: Uuid,
    pub sha: String,
    pub message: String,
    pub author_user_id: Option<Uuid>,
    pub author_github_id: Option<i64>,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
    pub additions: i32,
    pub deletions: i32,
    pub committed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ChangeRequestRow {
    pub id: Uuid,
    pub repo_id: Uuid,
    pub github_id: i64,
    pub number: i64,
    pub title: String,
    pub state: ChangeRequestState,
    pub author_user_id: Option<Uuid>,
    pub author_github_id: Option<i64>,
    pub author_login: Option<String>,
    pub additions: i32,
    pub deletions: i32,
    pub merged_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub gh_created_at: DateTime<Utc>,
    pub gh_updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct IssueRow {
    pub id: Uuid,
    pub repo_id: Uuid,
    pub github_id: i64,
    pub number: i64,
    pub title: String,
    pub state: IssueState,
    pub author_user_id: Option<Uuid>,
    pub author_github_id: Option<i64>,
    pub author_login: Option<String>,
    pub closed_at: Option<DateTime<Utc>>,
    pub gh_created_at: DateTime<Utc>,
    pub gh_updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuditLogRow {
    pub id: Uuid,
    pub actor_user_id: Option<Uuid>,
    pub org_id: Option<Uuid>,
    pub action: String,
    pub resource: String,
    pub status: String,
    pub ip_address: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewRepository {
    pub github_id: i64,
    pub org_id: Uuid,
    pub name: String,
    pub full_name: String,
    pub is_private: bool,
    pub language: Option<String>,
    pub webhook_id: Option<i64>,
    pub webhook_secret: String,
}

#[derive(Debug, Clone)]
pub struct NewCommit {
    pub repo_id: Uuid,
    pub sha: String,
    pub message: String,
    pub author_user_id: Option<Uuid>,
    pub author_github_id: Option<i64>,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
    pub additions: i32,
    pub deletions: i32,
    pub committed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ChangeRequestUpsert {
    pub repo_id: Uuid,
    pub github_id: i64,
    pub number: i64,
    pub title: String,
    pub state: ChangeRequestState,
    pub author_user_id: Option<Uuid>,
    pub author_github_id: Option<i64>,
    pub author_login: Option<String>,
    pub additions: i32,
    pub deletions: i32,
    pub merged_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub gh_created_at: DateTime<Utc>,
    pub gh_updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct IssueUpsert {
    pub repo_id: Uuid,
    pub github_id: i64,
    pub number: i64,
    pub title: String,
    pub state: IssueState,
    pub author_user_id: Option<Uuid>,
    pub author_github_id: Option<i64>,
    pub author_login: Option<String>,
    pub closed_at: Option<DateTime<Utc>>,
    pub gh_created_at: DateTime<Utc>,
    pub gh_updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAuditLog {
    pub actor_user_id: Option<Uuid>,
    pub org_id: Option<Uuid>,
    pub action: String,
    pub resource: String,
    pub status: String,
    pub ip_address: Option<String>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, FromRow)]
pub struct RepoChildCounts {
    pub commits: i64,
    pub change_requests: i64,
    pub issues: i64,
}
