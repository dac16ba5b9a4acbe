use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres};
use tokio::time::{sleep, Duration};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::errors::{DbError, Result};
use crate::models::{
    ChangeRequestUpsert, IssueUpsert, NewAuditLog, NewCommit, NewRepository, OrgMemberRow, OrgRole,
    RepoChildCounts, RepositoryRow, SyncStatus, UserRow,
};
use crate::stores::{
    AuditStore, ChangeRequestStore, CommitStore, Database, IssueStore, MembershipStore,
    RepositoryStore, UserStore,
};

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .map_err(DbError::Migration)
}

#[derive(Clone)]
pub struct PgDatabase {
    pool: PgPool,
    repository_store: Arc<PgRepositoryStore>,
    commit_store: Arc<PgCommitStore>,
    change_request_store: Arc<PgChangeRequestStore>,
    issue_store: Arc<PgIssueStore>,
    user_store: Arc<PgUserStore>,
    membership_store: Arc<PgMembershipStore>,
    audit_store: Arc<PgAuditStore>,
}

impl PgDatabase {
    pub async fn connect(database_url: &str) -> Result<Self> {
        const MAX_ATTEMPTS: u32 = 5;
        const BASE_DELAY_MS: u64 = 500;

        let mut attempts = 0;
        loop {
            match PgPoolOptions::new()
                .max_connections(10)
                .connect(database_url)
                .await
            {
                Ok(pool) => {
                    run_migrations(&pool).await?;
                    return Ok(Self::from_pool(pool));
                }
                Err(err) => {
                    attempts += 1;
                    if attempts >= MAX_ATTEMPTS {
                        return Err(DbError::Query(err));
                    }

                    let exp = (attempts - 1).min(5);
                    let backoff = Duration::from_millis(BASE_DELAY_MS * (1u64 << exp));
                    warn!(
                        attempts,
                        error = %err,
                        wait_ms = backoff.as_millis(),
                        "database connection failed; retrying"
                    );
                    sleep(backoff).await;
                }
            }
        }
    }

    pub fn from_pool(pool: PgPool) -> Self {
        let repository_store = Arc::new(PgRepositoryStore { pool: pool.clone() });
        let commit_store = Arc::new(PgCommitStore { pool: pool.clone() });
        let change_request_store = Arc::new(PgChangeRequestStore { pool: pool.clone() });
        let issue_store = Arc::new(PgIssueStore { pool: pool.clone() });
        let user_store = Arc::new(PgUserStore { pool: pool.clone() });
        let membership_store = Arc::new(PgMembershipStore { pool: pool.clone() });
        let audit_store = Arc::new(PgAuditStore { pool: pool.clone() });

        Self {
            pool,
            repository_store,
            commit_store,
            change_request_store,
            issue_store,
            user_store,
            membership_store,
            audit_store,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl Database for PgDatabase {
    fn repositories(&self) -> &dyn RepositoryStore {
        &*self.repository_store
    }

    fn commits(&self) -> &dyn CommitStore {
        &*self.commit_store
    }

    fn change_requests(&self) -> &dyn ChangeRequestStore {
        &*self.change_request_store
    }

    fn issues(&self) -> &dyn IssueStore {
        &*self.issue_store
    }

    fn users(&self) -> &dyn UserStore {
        &*self.user_store
    }

    fn memberships(&self) -> &dyn MembershipStore {
        &*self.membership_store
    }

    fn audit_logs(&self) -> &dyn AuditStore {
        &*self.audit_store
    }
}

const REPOSITORY_COLUMNS: &str = "id, github_id, org_id, name, full_name, private, language, \
     webhook_id, webhook_secret, sync_status, last_synced_at, created_at, updated_at";

async fn insert_audit<'e, E>(executor: E, entry: NewAuditLog) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO audit_logs (id, actor_user_id, org_id, action, resource, status, ip_address, metadata)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(entry.actor_user_id)
    .bind(entry.org_id)
    .bind(entry.action)
    .bind(entry.resource)
    .bind(entry.status)
    .bind(entry.ip_address)
    .bind(entry.metadata)
    .execute(executor)
    .await
    .map(|_| ())
    .map_err(DbError::Query)
}

#[derive(Clone)]
struct PgRepositoryStore {
    pool: PgPool,
}

#[async_trait]
impl RepositoryStore for PgRepositoryStore {
    #[instrument(skip(self, repo, audit), fields(full_name = %repo.full_name))]
    async fn insert_connected(
        &self,
        repo: NewRepository,
        audit: NewAuditLog,
    ) -> Result<RepositoryRow> {
        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;

        let row = sqlx::query_as::<_, RepositoryRow>(
            r#"
            INSERT INTO repositories (
                id, github_id, org_id, name, full_name, private, language,
                webhook_id, webhook_secret, sync_status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING id, github_id, org_id, name, full_name, private, language,
                      webhook_id, webhook_secret, sync_status, last_synced_at,
                      created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(repo.github_id)
        .bind(repo.org_id)
        .bind(repo.name)
        .bind(repo.full_name)
        .bind(repo.is_private)
        .bind(repo.language)
        .bind(repo.webhook_id)
        .bind(repo.webhook_secret)
        .bind(SyncStatus::Pending)
        .fetch_one(&mut *tx)
        .await
        .map_err(DbError::from_sqlx)?;

        insert_audit(&mut *tx, audit).await?;

        tx.commit().await.map_err(DbError::Query)?;
        Ok(row)
    }

    #[instrument(skip(self, audit))]
    async fn delete_disconnected(&self, id: Uuid, audit: NewAuditLog) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;

        let deleted = sqlx::query("DELETE FROM repositories WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::Query)?;
        if deleted.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }

        insert_audit(&mut *tx, audit).await?;

        tx.commit().await.map_err(DbError::Query)
    }

    async fn get(&self, id: Uuid) -> Result<Option<RepositoryRow>> {
        sqlx::query_as::<_, RepositoryRow>(&format!(
            "SELECT {REPOSITORY_COLUMNS} FROM repositories WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    async fn get_by_github(&self, github_id: i64, org_id: Uuid) -> Result<Option<RepositoryRow>> {
        sqlx::query_as::<_, RepositoryRow>(&format!(
            "SELECT {REPOSITORY_COLUMNS} FROM repositories WHERE github_id = $1 AND org_id = $2"
        ))
        .bind(github_id)
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    async fn list_by_org(&self, org_id: Uuid) -> Result<Vec<RepositoryRow>> {
        sqlx::query_as::<_, RepositoryRow>(&format!(
            "SELECT {REPOSITORY_COLUMNS} FROM repositories WHERE org_id = $1 ORDER BY full_name"
        ))
        .bind(org_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    async fn list_by_status(&self, status: SyncStatus) -> Result<Vec<RepositoryRow>> {
        sqlx::query_as::<_, RepositoryRow>(&format!(
            "SELECT {REPOSITORY_COLUMNS} FROM repositories WHERE sync_status = $1 ORDER BY created_at"
        ))
        .bind(status)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    async fn set_sync_status(&self, id: Uuid, status: SyncStatus) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE repositories
            SET sync_status = $1,
                updated_at = now()
            WHERE id = $2
            "#,
        )
        .bind(status)
        .bind(id)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(DbError::Query)
    }

    async fn mark_synced(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE repositories
            SET sync_status = $1,
                last_synced_at = $2,
                updated_at = now()
            WHERE id = $3
            "#,
        )
        .bind(SyncStatus::Active)
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(DbError::Query)
    }

    async fn child_counts(&self, id: Uuid) -> Result<RepoChildCounts> {
        sqlx::query_as::<_, RepoChildCounts>(
            r#"
            SELECT
                (SELECT COUNT(*) FROM commits WHERE repo_id = $1) AS commits,
                (SELECT COUNT(*) FROM change_requests WHERE repo_id = $1) AS change_requests,
                (SELECT COUNT(*) FROM issues WHERE repo_id = $1) AS issues
            "#,
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::Query)
    }
}

#[derive(Clone)]
struct PgCommitStore {
    pool: PgPool,
}

#[async_trait]
impl CommitStore for PgCommitStore {
    async fn insert_if_new(&self, commit: NewCommit) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO commits (
                id, repo_id, sha, message, author_user_id, author_github_id,
                author_name, author_email, additions, deletions, committed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (repo_id, sha) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(commit.repo_id)
        .bind(commit.sha)
        .bind(commit.message)
        .bind(commit.author_user_id)
        .bind(commit.author_github_id)
        .bind(commit.author_name)
        .bind(commit.author_email)
        .bind(commit.additions)
        .bind(commit.deletions)
        .bind(commit.committed_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;

        Ok(result.rows_affected() > 0)
    }
}

#[derive(Clone)]
struct PgChangeRequestStore {
    pool: PgPool,
}

#[async_trait]
impl ChangeRequestStore for PgChangeRequestStore {
    async fn upsert(&self, change_request: ChangeRequestUpsert) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO change_requests (
                id, repo_id, github_id, number, title, state, author_user_id,
                author_github_id, author_login, additions, deletions, merged_at,
                closed_at, gh_created_at, gh_updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (github_id) DO UPDATE
                SET title = EXCLUDED.title,
                    state = EXCLUDED.state,
                    author_user_id = EXCLUDED.author_user_id,
                    author_login = EXCLUDED.author_login,
                    additions = EXCLUDED.additions,
                    deletions = EXCLUDED.deletions,
                    merged_at = EXCLUDED.merged_at,
                    closed_at = EXCLUDED.closed_at,
                    gh_updated_at = EXCLUDED.gh_updated_at,
                    updated_at = now()
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(change_request.repo_id)
        .bind(change_request.github_id)
        .bind(change_request.number)
        .bind(change_request.title)
        .bind(change_request.state)
        .bind(change_request.author_user_id)
        .bind(change_request.author_github_id)
        .bind(change_request.author_login)
        .bind(change_request.additions)
        .bind(change_request.deletions)
        .bind(change_request.merged_at)
        .bind(change_request.closed_at)
        .bind(change_request.gh_created_at)
        .bind(change_request.gh_updated_at)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(DbError::Query)
    }
}

#[derive(Clone)]
struct PgIssueStore {
    pool: PgPool,
}

#[async_trait]
impl IssueStore for PgIssueStore {
    async fn upsert(&self, issue: IssueUpsert) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO issues (
                id, repo_id, github_id, number, title, state, author_user_id,
                author_github_id, author_login, closed_at, gh_created_at, gh_updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (github_id) DO UPDATE
                SET title = EXCLUDED.title,
                    state = EXCLUDED.state,
                    author_user_id = EXCLUDED.author_user_id,
                    author_login = EXCLUDED.author_login,
                    closed_at = EXCLUDED.closed_at,
                    gh_updated_at = EXCLUDED.gh_updated_at,
                    updated_at = now()
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(issue.repo_id)
        .bind(issue.github_id)
        .bind(issue.number)
        .bind(issue.title)
        .bind(issue.state)
        .bind(issue.author_user_id)
        .bind(issue.author_github_id)
        .bind(issue.author_login)
        .bind(issue.closed_at)
        .bind(issue.gh_created_at)
        .bind(issue.gh_updated_at)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(DbError::Query)
    }
}

#[derive(Clone)]
struct PgUserStore {
    pool: PgPool,
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn get_by_github_id(&self, github_id: i64) -> Result<Option<UserRow>> {
        sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, github_id, login, name, email, created_at
            FROM users
            WHERE github_id = $1
            "#,
        )
        .bind(github_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)
    }
}

#[derive(Clone)]
struct PgMembershipStore {
    pool: PgPool,
}

#[async_trait]
impl MembershipStore for PgMembershipStore {
    async fn role(&self, org_id: Uuid, user_id: Uuid) -> Result<Option<OrgRole>> {
        sqlx::query_scalar::<_, OrgRole>(
            r#"
            SELECT role
            FROM org_members
            WHERE org_id = $1 AND user_id = $2
            "#,
        )
        .bind(org_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    async fn list_members(&self, org_id: Uuid) -> Result<Vec<OrgMemberRow>> {
        sqlx::query_as::<_, OrgMemberRow>(
            r#"
            SELECT org_id, user_id, role, joined_at
            FROM org_members
            WHERE org_id = $1
            ORDER BY joined_at, user_id
            "#,
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)
    }
}

#[derive(Clone)]
struct PgAuditStore {
    pool: PgPool,
}

#[async_trait]
impl AuditStore for PgAuditStore {
    async fn append(&self, entry: NewAuditLog) -> Result<()> {
        insert_audit(&self.pool, entry).await
    }
}
