//! Historical import pipeline: crawls commits, change requests and issues for
//! one connected repository and writes them through the idempotent stores.
//! The three streams run concurrently and fail independently; the repository
//! only lands in the error state when nothing at all was imported.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use common::config::ImporterConfig;
use common::{Clock, CoreError, Result};
use db::{
    ChangeRequestState, ChangeRequestUpsert, Database, IssueState, IssueUpsert, NewCommit,
    RepositoryRow, SyncStatus,
};
use gh_client::{
    CredentialService, GithubApiError, HostClient, HostClientFactory, HostCredential,
    RawChangeRequest, RawCommit, RawIssue,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportSummary {
    pub commits: u64,
    pub change_requests: u64,
    pub issues: u64,
    /// One entry per stream that failed; the other streams' results stand.
    pub errors: Vec<String>,
}

pub struct ImportPipeline {
    db: Arc<dyn Database>,
    credentials: Arc<dyn CredentialService>,
    clients: Arc<dyn HostClientFactory>,
    clock: Arc<dyn Clock>,
    config: ImporterConfig,
}

impl ImportPipeline {
    pub fn new(
        db: Arc<dyn Database>,
        credentials: Arc<dyn CredentialService>,
        clients: Arc<dyn HostClientFactory>,
        clock: Arc<dyn Clock>,
        config: ImporterConfig,
    ) -> Self {
        Self {
            db,
            credentials,
            clients,
            clock,
            config,
        }
    }

    /// Runs the full backfill for one repository. Moves the repository to
    /// `syncing` first, then to `active` when at least one record landed, or
    /// to `error` when every stream came up empty or failed.
    pub async fn import_historical_data(
        &self,
        repository_id: Uuid,
        days: u32,
    ) -> Result<ImportSummary> {
        let repo = self
            .db
            .repositories()
            .get(repository_id)
            .await
            .map_err(CoreError::db)?
            .ok_or_else(|| CoreError::not_found(format!("repository {repository_id}")))?;

        self.db
            .repositories()
            .set_sync_status(repo.id, SyncStatus::Syncing)
            .await
            .map_err(CoreError::db)?;

        match self.run_import(&repo, days).await {
            Ok(summary) => Ok(summary),
            Err(err) => {
                if let Err(status_err) = self
                    .db
                    .repositories()
                    .set_sync_status(repo.id, SyncStatus::Error)
                    .await
                {
                    warn!(
                        repo = %repo.full_name,
                        error = %status_err,
                        "failed to record error sync status"
                    );
                }
                Err(err)
            }
        }
    }

    /// Records the error status for a run that was cut off before
    /// `import_historical_data` could reach its own error branch, e.g. when a
    /// worker deadline drops the future mid-crawl.
    pub async fn mark_import_failed(&self, repository_id: Uuid) {
        if let Err(err) = self
            .db
            .repositories()
            .set_sync_status(repository_id, SyncStatus::Error)
            .await
        {
            warn!(
                repository_id = %repository_id,
                error = %err,
                "failed to record error sync status"
            );
        }
    }

    async fn run_import(&self, repo: &RepositoryRow, days: u32) -> Result<ImportSummary> {
        let credential = self.resolve_credential(repo).await?;
        let client = self.clients.client_for(&credential);

        let cutoff = day_start(self.clock.now() - chrono::Duration::days(i64::from(days)));
        let (owner, name) = split_full_name(&repo.full_name);

        info!(repo = %repo.full_name, %cutoff, "starting historical import");

        let (commits, change_requests, issues) = tokio::join!(
            self.crawl_commits(client.as_ref(), repo, owner, name, cutoff),
            self.crawl_change_requests(client.as_ref(), repo, owner, name, cutoff),
            self.crawl_issues(client.as_ref(), repo, owner, name, cutoff),
        );

        let mut summary = ImportSummary::default();
        match commits {
            Ok(count) => summary.commits = count,
            Err(err) => {
                warn!(repo = %repo.full_name, error = %err, "commit stream failed");
                summary.errors.push(format!("commits: {err}"));
            }
        }
        match change_requests {
            Ok(count) => summary.change_requests = count,
            Err(err) => {
                warn!(repo = %repo.full_name, error = %err, "change request stream failed");
                summary.errors.push(format!("change requests: {err}"));
            }
        }
        match issues {
            Ok(count) => summary.issues = count,
            Err(err) => {
                warn!(repo = %repo.full_name, error = %err, "issue stream failed");
                summary.errors.push(format!("issues: {err}"));
            }
        }

        let imported = summary.commits + summary.change_requests + summary.issues;
        if imported == 0 {
            let detail = if summary.errors.is_empty() {
                "no records in window".to_string()
            } else {
                summary.errors.join("; ")
            };
            return Err(CoreError::External(anyhow::anyhow!(
                "historical import of {} produced nothing: {detail}",
                repo.full_name
            )));
        }

        self.db
            .repositories()
            .mark_synced(repo.id, self.clock.now())
            .await
            .map_err(CoreError::db)?;

        info!(
            repo = %repo.full_name,
            commits = summary.commits,
            change_requests = summary.change_requests,
            issues = summary.issues,
            stream_errors = summary.errors.len(),
            "historical import finished"
        );
        Ok(summary)
    }

    /// Walks the org's members in `(joined_at, user_id)` order and takes the
    /// first one with a stored credential, so repeated imports pick the same
    /// token.
    async fn resolve_credential(&self, repo: &RepositoryRow) -> Result<HostCredential> {
        let members = self
            .db
            .memberships()
            .list_members(repo.org_id)
            .await
            .map_err(CoreError::db)?;
        for member in members {
            match self.credentials.credential_for(member.user_id).await {
                Ok(Some(credential)) => return Ok(credential),
                Ok(None) => continue,
                Err(err) => return Err(CoreError::Auth(err.to_string())),
            }
        }
        Err(CoreError::auth(
            "no user with github token for this repository",
        ))
    }

    /// Holds the crawl when the remaining budget cannot cover a full page.
    async fn wait_for_budget(&self, client: &dyn HostClient) {
        match client.rate_limit().await {
            Ok(status) if status.remaining < i64::from(self.config.page_size) => {
                let wait = until(self.clock.now(), status.reset);
                warn!(
                    remaining = status.remaining,
                    wait_secs = wait.as_secs(),
                    "rate budget low, pausing before next page"
                );
                self.clock.sleep(wait).await;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "rate limit probe failed, continuing");
            }
        }
    }

    /// Sleeps out a mid-crawl rate-limit rejection. The extra second makes
    /// sure the reset has actually happened server-side.
    async fn pause_for_rate_limit(
        &self,
        client: &dyn HostClient,
        reset: Option<DateTime<Utc>>,
        retry_after: Option<Duration>,
    ) {
        let wait = if let Some(retry_after) = retry_after {
            retry_after
        } else if let Some(reset) = reset {
            until(self.clock.now(), reset)
        } else if let Ok(status) = client.rate_limit().await {
            until(self.clock.now(), status.reset)
        } else {
            Duration::from_secs(self.config.rate_limit_fallback_secs)
        };
        let wait = wait + Duration::from_secs(1);
        warn!(wait_secs = wait.as_secs(), "rate limited mid-crawl, sleeping until reset");
        self.clock.sleep(wait).await;
    }

    async fn crawl_commits(
        &self,
        client: &dyn HostClient,
        repo: &RepositoryRow,
        owner: &str,
        name: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let page_size = self.config.page_size;
        let mut page = 1u32;
        let mut imported = 0u64;
        loop {
            self.wait_for_budget(client).await;
            let batch = match client
                .list_commits(owner, name, cutoff, page, page_size)
                .await
            {
                Ok(batch) => batch,
                Err(GithubApiError::RateLimited {
                    reset, retry_after, ..
                }) => {
                    self.pause_for_rate_limit(client, reset, retry_after).await;
                    continue;
                }
                Err(err) if err.is_not_found() => {
                    info!(repo = %repo.full_name, "commit listing returned 404, stopping stream");
                    return Ok(imported);
                }
                Err(err) => return Err(CoreError::external(err)),
            };

            let fetched = batch.len();
            for raw in batch {
                let commit = self.map_commit(repo, raw).await;
                let sha = commit.sha.clone();
                match self.db.commits().insert_if_new(commit).await {
                    Ok(_) => imported += 1,
                    Err(err) => {
                        warn!(repo = %repo.full_name, sha = %sha, error = %err, "skipping commit that failed to write");
                    }
                }
            }

            if fetched < page_size as usize {
                break;
            }
            page += 1;
            self.clock
                .sleep(Duration::from_millis(self.config.page_delay_ms))
                .await;
        }
        Ok(imported)
    }

    async fn crawl_change_requests(
        &self,
        client: &dyn HostClient,
        repo: &RepositoryRow,
        owner: &str,
        name: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let page_size = self.config.page_size;
        let mut page = 1u32;
        let mut imported = 0u64;
        loop {
            self.wait_for_budget(client).await;
            let batch = match client
                .list_change_requests(owner, name, page, page_size)
                .await
            {
                Ok(batch) => batch,
                Err(GithubApiError::RateLimited {
                    reset, retry_after, ..
                }) => {
                    self.pause_for_rate_limit(client, reset, retry_after).await;
                    continue;
                }
                Err(err) if err.is_not_found() => {
                    info!(repo = %repo.full_name, "change request listing returned 404, stopping stream");
                    return Ok(imported);
                }
                Err(err) => return Err(CoreError::external(err)),
            };

            let fetched = batch.len();
            let mut past_cutoff = false;
            for raw in batch {
                if raw.updated_at < cutoff {
                    past_cutoff = true;
                    continue;
                }
                let upsert = self.map_change_request(repo, raw).await;
                let number = upsert.number;
                match self.db.change_requests().upsert(upsert).await {
                    Ok(()) => imported += 1,
                    Err(err) => {
                        warn!(repo = %repo.full_name, number, error = %err, "skipping change request that failed to write");
                    }
                }
            }

            if fetched < page_size as usize {
                break;
            }
            // Listing is sorted by updated desc, so once a page reaches past
            // the cutoff no later page can contain anything newer.
            if past_cutoff {
                break;
            }
            page += 1;
            self.clock
                .sleep(Duration::from_millis(self.config.page_delay_ms))
                .await;
        }
        Ok(imported)
    }

    async fn crawl_issues(
        &self,
        client: &dyn HostClient,
        repo: &RepositoryRow,
        owner: &str,
        name: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let page_size = self.config.page_size;
        let mut page = 1u32;
        let mut imported = 0u64;
        loop {
            self.wait_for_budget(client).await;
            let batch = match client.list_issues(owner, name, page, page_size).await {
                Ok(batch) => batch,
                Err(GithubApiError::RateLimited {
                    reset, retry_after, ..
                }) => {
                    self.pause_for_rate_limit(client, reset, retry_after).await;
                    continue;
                }
                Err(err) if err.is_not_found() => {
                    info!(repo = %repo.full_name, "issue listing returned 404, stopping stream");
                    return Ok(imported);
                }
                Err(err) => return Err(CoreError::external(err)),
            };

            let fetched = batch.len();
            let mut past_cutoff = false;
            for raw in batch {
                if raw.updated_at < cutoff {
                    past_cutoff = true;
                    continue;
                }
                // The issues endpoint lists pull requests too; those are
                // already covered by the change request stream.
                if raw.is_change_request() {
                    continue;
                }
                let upsert = self.map_issue(repo, raw).await;
                let number = upsert.number;
                match self.db.issues().upsert(upsert).await {
                    Ok(()) => imported += 1,
                    Err(err) => {
                        warn!(repo = %repo.full_name, number, error = %err, "skipping issue that failed to write");
                    }
                }
            }

            if fetched < page_size as usize {
                break;
            }
            if past_cutoff {
                break;
            }
            page += 1;
            self.clock
                .sleep(Duration::from_millis(self.config.page_delay_ms))
                .await;
        }
        Ok(imported)
    }

    /// Maps a host author onto a platform user. Authors without an account on
    /// the platform stay unlinked; lookup failures degrade to unlinked too.
    async fn resolve_author(&self, github_id: i64) -> Option<Uuid> {
        match self.db.users().get_by_github_id(github_id).await {
            Ok(user) => user.map(|u| u.id),
            Err(err) => {
                warn!(github_id, error = %err, "author lookup failed, importing unlinked");
                None
            }
        }
    }

    async fn map_commit(&self, repo: &RepositoryRow, raw: RawCommit) -> NewCommit {
        let author_user_id = match &raw.author {
            Some(user) => self.resolve_author(user.id).await,
            None => None,
        };
        let stats = raw.stats.unwrap_or_default();
        let git_author = raw.commit.author.as_ref();
        NewCommit {
            repo_id: repo.id,
            sha: raw.sha,
            message: raw.commit.message.clone(),
            author_user_id,
            author_github_id: raw.author.as_ref().map(|u| u.id),
            author_name: git_author.and_then(|a| a.name.clone()),
            author_email: git_author.and_then(|a| a.email.clone()),
            additions: stats.additions as i32,
            deletions: stats.deletions as i32,
            committed_at: git_author
                .and_then(|a| a.date)
                .unwrap_or_else(|| self.clock.now()),
        }
    }

    async fn map_change_request(
        &self,
        repo: &RepositoryRow,
        raw: RawChangeRequest,
    ) -> ChangeRequestUpsert {
        let author_user_id = match &raw.user {
            Some(user) => self.resolve_author(user.id).await,
            None => None,
        };
        let state = if raw.merged_at.is_some() {
            ChangeRequestState::Merged
        } else if raw.state == "open" {
            ChangeRequestState::Open
        } else {
            ChangeRequestState::Closed
        };
        ChangeRequestUpsert {
            repo_id: repo.id,
            github_id: raw.id,
            number: raw.number,
            title: raw.title,
            state,
            author_user_id,
            author_github_id: raw.user.as_ref().map(|u| u.id),
            author_login: raw.user.as_ref().map(|u| u.login.clone()),
            additions: raw.additions.unwrap_or(0) as i32,
            deletions: raw.deletions.unwrap_or(0) as i32,
            merged_at: raw.merged_at,
            closed_at: raw.closed_at,
            gh_created_at: raw.created_at,
            gh_updated_at: raw.updated_at,
        }
    }

    async fn map_issue(&self, repo: &RepositoryRow, raw: RawIssue) -> IssueUpsert {
        let author_user_id = match &raw.user {
            Some(user) => self.resolve_author(user.id).await,
            None => None,
        };
        let state = if raw.state == "open" {
            IssueState::Open
        } else {
            IssueState::Closed
        };
        IssueUpsert {
            repo_id: repo.id,
            github_id: raw.id,
            number: raw.number,
            title: raw.title,
            state,
            author_user_id,
            author_github_id: raw.user.as_ref().map(|u| u.id),
            author_login: raw.user.as_ref().map(|u| u.login.clone()),
            closed_at: raw.closed_at,
            gh_created_at: raw.created_at,
            gh_updated_at: raw.updated_at,
        }
    }
}

/// Truncates to the start of the UTC day so re-runs within the same day use
/// the same cutoff.
fn day_start(at: DateTime<Utc>) -> DateTime<Utc> {
    at.date_naive().and_time(NaiveTime::MIN).and_utc()
}

fn until(now: DateTime<Utc>, reset: DateTime<Utc>) -> Duration {
    (reset - now).to_std().unwrap_or_default()
}

fn split_full_name(full_name: &str) -> (&str, &str) {
    full_name.split_once('/').unwrap_or(("", full_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn day_start_truncates_to_midnight() {
        let at = Utc.with_ymd_and_hms(2024, 5, 10, 17, 42, 3).unwrap();
        let start = day_start(at);
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 5, 10, 0, 0, 0).unwrap());
    }

    #[test]
    fn until_saturates_when_reset_is_past() {
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap();
        let reset = Utc.with_ymd_and_hms(2024, 5, 10, 11, 0, 0).unwrap();
        assert_eq!(until(now, reset), Duration::ZERO);
    }
}
