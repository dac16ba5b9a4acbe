use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::Result;
use crate::models::{
    ChangeRequestUpsert, IssueUpsert, NewAuditLog, NewCommit, NewRepository, OrgMemberRow, OrgRole,
    RepoChildCounts, RepositoryRow, SyncStatus, UserRow,
};

#[async_trait]
pub trait RepositoryStore: Send + Sync {
    /// Inserts the repository row and its connect audit entry in one
    /// transaction. Fails with `Conflict` when `(github_id, org_id)` is taken.
    async fn insert_connected(
        &self,
        repo: NewRepository,
        audit: NewAuditLog,
    ) -> Result<RepositoryRow>;

    /// Deletes the repository (cascading to its activity rows) and writes the
    /// disconnect audit entry in one transaction.
    async fn delete_disconnected(&self, id: Uuid, audit: NewAuditLog) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<RepositoryRow>>;
    async fn get_by_github(&self, github_id: i64, org_id: Uuid) -> Result<Option<RepositoryRow>>;
    async fn list_by_org(&self, org_id: Uuid) -> Result<Vec<RepositoryRow>>;
    async fn list_by_status(&self, status: SyncStatus) -> Result<Vec<RepositoryRow>>;
    async fn set_sync_status(&self, id: Uuid, status: SyncStatus) -> Result<()>;
    async fn mark_synced(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;
    async fn child_counts(&self, id: Uuid) -> Result<RepoChildCounts>;
}

#[async_trait]
pub trait CommitStore: Send + Sync {
    /// Insert-with-skip keyed on `(repo_id, sha)`. Returns whether a new row
    /// was written; a duplicate keeps the first-seen message.
    async fn insert_if_new(&self, commit: NewCommit) -> Result<bool>;
}

#[async_trait]
pub trait ChangeRequestStore: Send + Sync {
    async fn upsert(&self, change_request: ChangeRequestUpsert) -> Result<()>;
}

#[async_trait]
pub trait IssueStore: Send + Sync {
    async fn upsert(&self, issue: IssueUpsert) -> Result<()>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_by_github_id(&self, github_id: i64) -> Result<Option<UserRow>>;
}

#[async_trait]
pub trait MembershipStore: Send + Sync {
    async fn role(&self, org_id: Uuid, user_id: Uuid) -> Result<Option<OrgRole>>;
    /// Members in deterministic `(joined_at, user_id)` order so credential
    /// resolution is stable across imports.
    async fn list_members(&self, org_id: Uuid) -> Result<Vec<OrgMemberRow>>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, entry: NewAuditLog) -> Result<()>;
}

pub trait Database: Send + Sync {
    fn repositories(&self) -> &dyn RepositoryStore;
    fn commits(&self) -> &dyn CommitStore;
    fn change_requests(&self) -> &dyn ChangeRequestStore;
    fn issues(&self) -> &dyn IssueStore;
    fn users(&self) -> &dyn UserStore;
    fn memberships(&self) -> &dyn MembershipStore;
    fn audit_logs(&self) -> &dyn AuditStore;
}
