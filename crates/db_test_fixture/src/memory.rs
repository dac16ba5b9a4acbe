//! In-memory `Database` implementation for unit tests that exercise service
//! logic without Postgres. Mirrors the write semantics of the SQL stores:
//! insert-skip for commits, upsert-by-github-id for change requests and
//! issues, transactional connect/disconnect with audit rows.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use db::{
    AuditLogRow, AuditStore, ChangeRequestRow, ChangeRequestStore, ChangeRequestUpsert,
    CommitRow, CommitStore, Database, DbError, IssueRow, IssueStore, IssueUpsert,
    MembershipStore, NewAuditLog, NewCommit, NewRepository, OrgMemberRow, OrgRole,
    RepoChildCounts, RepositoryRow, RepositoryStore, Result, SyncStatus, UserRow, UserStore,
};
use uuid::Uuid;

#[derive(Default)]
struct MemState {
    users: Vec<UserRow>,
    members: Vec<OrgMemberRow>,
    repositories: Vec<RepositoryRow>,
    commits: Vec<CommitRow>,
    change_requests: Vec<ChangeRequestRow>,
    issues: Vec<IssueRow>,
    audit_logs: Vec<AuditLogRow>,
}

#[derive(Default)]
pub struct MemoryDatabase {
    state: Mutex<MemState>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, github_id: Option<i64>, login: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.state.lock().unwrap().users.push(UserRow {
            id,
            github_id,
            login: login.to_string(),
            name: None,
            email: None,
            created_at: Utc::now(),
        });
        id
    }

    pub fn add_member(&self, org_id: Uuid, user_id: Uuid, role: OrgRole) {
        self.state.lock().unwrap().members.push(OrgMemberRow {
            org_id,
            user_id,
            role,
            joined_at: Utc::now(),
        });
    }

    pub fn add_repository(&self, repo: NewRepository) -> RepositoryRow {
        let row = make_repository_row(repo);
        self.state.lock().unwrap().repositories.push(row.clone());
        row
    }

    pub fn repository(&self, id: Uuid) -> Option<RepositoryRow> {
        let state = self.state.lock().unwrap();
        state.repositories.iter().find(|r| r.id == id).cloned()
    }

    pub fn commit_rows(&self) -> Vec<CommitRow> {
        self.state.lock().unwrap().commits.clone()
    }

    pub fn change_request_rows(&self) -> Vec<ChangeRequestRow> {
        self.state.lock().unwrap().change_requests.clone()
    }

    pub fn issue_rows(&self) -> Vec<IssueRow> {
        self.state.lock().unwrap().issues.clone()
    }

    pub fn audit_rows(&self) -> Vec<AuditLogRow> {
        self.state.lock().unwrap().audit_logs.clone()
    }
}

fn make_repository_row(repo: NewRepository) -> RepositoryRow {
    let now = Utc::now();
    RepositoryRow {
        id: Uuid::new_v4(),
        github_id: repo.github_id,
        org_id: repo.org_id,
        name: repo.name,
        full_name: repo.full_name,
        is_private: repo.is_private,
        language: repo.language,
        webhook_id: repo.webhook_id,
        webhook_secret: repo.webhook_secret,
        sync_status: SyncStatus::Pending,
        last_synced_at: None,
        created_at: now,
        updated_at: now,
    }
}

fn audit_row(entry: NewAuditLog) -> AuditLogRow {
    AuditLogRow {
        id: Uuid::new_v4(),
        actor_user_id: entry.actor_user_id,
        org_id: entry.org_id,
        action: entry.action,
        resource: entry.resource,
        status: entry.status,
        ip_address: entry.ip_address,
        metadata: entry.metadata,
        created_at: Utc::now(),
    }
}

#[async_trait]
impl RepositoryStore for MemoryDatabase {
    async fn insert_connected(
        &self,
        repo: NewRepository,
        audit: NewAuditLog,
    ) -> Result<RepositoryRow> {
        let mut state = self.state.lock().unwrap();
        if state
            .repositories
            .iter()
            .any(|r| r.github_id == repo.github_id && r.org_id == repo.org_id)
        {
            return Err(DbError::Conflict);
        }
        let row = make_repository_row(repo);
        state.repositories.push(row.clone());
        state.audit_logs.push(audit_row(audit));
        Ok(row)
    }

    async fn delete_disconnected(&self, id: Uuid, audit: NewAuditLog) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let before = state.repositories.len();
        state.repositories.retain(|r| r.id != id);
        if state.repositories.len() == before {
            return Err(DbError::NotFound);
        }
        state.commits.retain(|c| c.repo_id != id);
        state.change_requests.retain(|c| c.repo_id != id);
        state.issues.retain(|i| i.repo_id != id);
        state.audit_logs.push(audit_row(audit));
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<RepositoryRow>> {
        let state = self.state.lock().unwrap();
        Ok(state.repositories.iter().find(|r| r.id == id).cloned())
    }

    async fn get_by_github(&self, github_id: i64, org_id: Uuid) -> Result<Option<RepositoryRow>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .repositories
            .iter()
            .find(|r| r.github_id == github_id && r.org_id == org_id)
            .cloned())
    }

    async fn list_by_org(&self, org_id: Uuid) -> Result<Vec<RepositoryRow>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .repositories
            .iter()
            .filter(|r| r.org_id == org_id)
            .cloned()
            .collect())
    }

    async fn list_by_status(&self, status: SyncStatus) -> Result<Vec<RepositoryRow>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .repositories
            .iter()
            .filter(|r| r.sync_status == status)
            .cloned()
            .collect())
    }

    async fn set_sync_status(&self, id: Uuid, status: SyncStatus) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let repo = state
            .repositories
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(DbError::NotFound)?;
        repo.sync_status = status;
        repo.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_synced(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let repo = state
            .repositories
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(DbError::NotFound)?;
        repo.sync_status = SyncStatus::Active;
        repo.last_synced_at = Some(at);
        repo.updated_at = Utc::now();
        Ok(())
    }

    async fn child_counts(&self, id: Uuid) -> Result<RepoChildCounts> {
        let state = self.state.lock().unwrap();
        Ok(RepoChildCounts {
            commits: state.commits.iter().filter(|c| c.repo_id == id).count() as i64,
            change_requests: state
                .change_requests
                .iter()
                .filter(|c| c.repo_id == id)
                .count() as i64,
            issues: state.issues.iter().filter(|i| i.repo_id == id).count() as i64,
        })
    }
}

#[async_trait]
impl CommitStore for MemoryDatabase {
    async fn insert_if_new(&self, commit: NewCommit) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if state
            .commits
            .iter()
            .any(|c| c.repo_id == commit.repo_id && c.sha == commit.sha)
        {
            return Ok(false);
        }
        state.commits.push(CommitRow {
            id: Uuid::new_v4(),
            repo_id: commit.repo_id,
            sha: commit.sha,
            message: commit.message,
            author_user_id: commit.author_user_id,
            author_github_id: commit.author_github_id,
            author_name: commit.author_name,
            author_email: commit.author_email,
            additions: commit.additions,
            deletions: commit.deletions,
            committed_at: commit.committed_at,
            created_at: Utc::now(),
        });
        Ok(true)
    }
}

#[async_trait]
impl ChangeRequestStore for MemoryDatabase {
    async fn upsert(&self, change_request: ChangeRequestUpsert) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        if let Some(existing) = state
            .change_requests
            .iter_mut()
            .find(|c| c.github_id == change_request.github_id)
        {
            existing.title = change_request.title;
            existing.state = change_request.state;
            existing.author_user_id = change_request.author_user_id;
            existing.author_login = change_request.author_login;
            existing.additions = change_request.additions;
            existing.deletions = change_request.deletions;
            existing.merged_at = change_request.merged_at;
            existing.closed_at = change_request.closed_at;
            existing.gh_updated_at = change_request.gh_updated_at;
            existing.updated_at = now;
            return Ok(());
        }
        state.change_requests.push(ChangeRequestRow {
            id: Uuid::new_v4(),
            repo_id: change_request.repo_id,
            github_id: change_request.github_id,
            number: change_request.number,
            title: change_request.title,
            state: change_request.state,
            author_user_id: change_request.author_user_id,
            author_github_id: change_request.author_github_id,
            author_login: change_request.author_login,
            additions: change_request.additions,
            deletions: change_request.deletions,
            merged_at: change_request.merged_at,
            closed_at: change_request.closed_at,
            gh_created_at: change_request.gh_created_at,
            gh_updated_at: change_request.gh_updated_at,
            created_at: now,
            updated_at: now,
        });
        Ok(())
    }
}

#[async_trait]
impl IssueStore for MemoryDatabase {
    async fn upsert(&self, issue: IssueUpsert) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        if let Some(existing) = state
            .issues
            .iter_mut()
            .find(|i| i.github_id == issue.github_id)
        {
            existing.title = issue.title;
            existing.state = issue.state;
            existing.author_user_id = issue.author_user_id;
            existing.author_login = issue.author_login;
            existing.closed_at = issue.closed_at;
            existing.gh_updated_at = issue.gh_updated_at;
            existing.updated_at = now;
            return Ok(());
        }
        state.issues.push(IssueRow {
            id: Uuid::new_v4(),
            repo_id: issue.repo_id,
            github_id: issue.github_id,
            number: issue.number,
            title: issue.title,
            state: issue.state,
            author_user_id: issue.author_user_id,
            author_github_id: issue.author_github_id,
            author_login: issue.author_login,
            closed_at: issue.closed_at,
            gh_created_at: issue.gh_created_at,
            gh_updated_at: issue.gh_updated_at,
            created_at: now,
            updated_at: now,
        });
        Ok(())
    }
}

#[async_trait]
impl UserStore for MemoryDatabase {
    async fn get_by_github_id(&self, github_id: i64) -> Result<Option<UserRow>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .users
            .iter()
            .find(|u| u.github_id == Some(github_id))
            .cloned())
    }
}

#[async_trait]
impl MembershipStore for MemoryDatabase {
    async fn role(&self, org_id: Uuid, user_id: Uuid) -> Result<Option<OrgRole>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .members
            .iter()
            .find(|m| m.org_id == org_id && m.user_id == user_id)
            .map(|m| m.role))
    }

    async fn list_members(&self, org_id: Uuid) -> Result<Vec<OrgMemberRow>> {
        let state = self.state.lock().unwrap();
        let mut members: Vec<OrgMemberRow> = state
            .members
            .iter()
            .filter(|m| m.org_id == org_id)
            .cloned()
            .collect();
        members.sort_by_key(|m| (m.joined_at, m.user_id));
        Ok(members)
    }
}

#[async_trait]
impl AuditStore for MemoryDatabase {
    async fn append(&self, entry: NewAuditLog) -> Result<()> {
        self.state.lock().unwrap().audit_logs.push(audit_row(entry));
        Ok(())
    }
}

impl Database for MemoryDatabase {
    fn repositories(&self) -> &dyn RepositoryStore {
        self
    }

    fn commits(&self) -> &dyn CommitStore {
        self
    }

    fn change_requests(&self) -> &dyn ChangeRequestStore {
        self
    }

    fn issues(&self) -> &dyn IssueStore {
        self
    }

    fn users(&self) -> &dyn UserStore {
        self
    }

    fn memberships(&self) -> &dyn MembershipStore {
        self
    }

    fn audit_logs(&self) -> &dyn AuditStore {
        self
    }
}
