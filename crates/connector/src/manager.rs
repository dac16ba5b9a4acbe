//! Connection lifecycle for source-code repositories: connect, disconnect,
//! and the cached listings around them. Connecting validates access against
//! both the platform org and the host, provisions a webhook best-effort,
//! writes the repository inside a transaction and queues the historical
//! import.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use cache::Cache;
use common::config::{ConnectorConfig, QueueConfig};
use common::{CoreError, Result};
use db::{
    Database, DbError, NewAuditLog, NewRepository, RepoChildCounts, RepositoryRow,
};
use gh_client::{CredentialService, HostClient, HostClientFactory, RawRepo};
use importer::ImportJob;
use queue::{JobQueue, RetryPolicy};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

const ACTION_CONNECT: &str = "REPOSITORY_CONNECTED";
const ACTION_DISCONNECT: &str = "REPOSITORY_DISCONNECTED";
const LIST_PAGE_SIZE: u32 = 100;

/// A connected repository together with its imported activity counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedRepository {
    #[serde(flatten)]
    pub repository: RepositoryRow,
    pub counts: RepoChildCounts,
}

/// One host repository the acting user could connect to the org.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailableRepo {
    pub github_id: i64,
    pub name: String,
    pub full_name: String,
    pub private: bool,
    pub language: Option<String>,
    pub already_connected: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedConnect {
    pub github_id: i64,
    pub reason: String,
}

#[derive(Debug, Default, Serialize)]
pub struct ConnectManyReport {
    pub connected: Vec<ConnectedRepository>,
    pub failed: Vec<FailedConnect>,
}

pub struct ConnectionManager {
    db: Arc<dyn Database>,
    cache: Arc<dyn Cache>,
    credentials: Arc<dyn CredentialService>,
    clients: Arc<dyn HostClientFactory>,
    import_queue: Arc<dyn JobQueue<ImportJob>>,
    config: ConnectorConfig,
    retry_policy: RetryPolicy,
}

impl ConnectionManager {
    pub fn new(
        db: Arc<dyn Database>,
        cache: Arc<dyn Cache>,
        credentials: Arc<dyn CredentialService>,
        clients: Arc<dyn HostClientFactory>,
        import_queue: Arc<dyn JobQueue<ImportJob>>,
        config: ConnectorConfig,
        queue_config: &QueueConfig,
    ) -> Self {
        let retry_policy = RetryPolicy {
            max_attempts: queue_config.max_attempts,
            backoff_base: Duration::from_secs(queue_config.backoff_base_secs),
            backoff_max: Duration::from_secs(queue_config.backoff_max_secs),
            jitter_frac: queue_config.jitter_frac,
        };
        Self {
            db,
            cache,
            credentials,
            clients,
            import_queue,
            config,
            retry_policy,
        }
    }

    /// Connects one host repository to the org. Failed attempts leave an
    /// audit trail too.
    pub async fn connect(
        &self,
        actor: Uuid,
        github_id: i64,
        org_id: Uuid,
        request_ip: Option<&str>,
    ) -> Result<ConnectedRepository> {
        match self.try_connect(actor, github_id, org_id, request_ip).await {
            Ok(connected) => Ok(connected),
            Err(err) => {
                self.audit_failure(
                    actor,
                    org_id,
                    ACTION_CONNECT,
                    format!("github:{github_id}"),
                    request_ip,
                    &err,
                )
                .await;
                Err(err)
            }
        }
    }

    async fn try_connect(
        &self,
        actor: Uuid,
        github_id: i64,
        org_id: Uuid,
        request_ip: Option<&str>,
    ) -> Result<ConnectedRepository> {
        let role = self
            .db
            .memberships()
            .role(org_id, actor)
            .await
            .map_err(CoreError::db)?;
        if role.is_none() {
            return Err(CoreError::permission(format!(
                "user {actor} is not a member of org {org_id}"
            )));
        }

        if self
            .db
            .repositories()
            .get_by_github(github_id, org_id)
            .await
            .map_err(CoreError::db)?
            .is_some()
        {
            return Err(CoreError::conflict(format!(
                "repository {github_id} is already connected to org {org_id}"
            )));
        }

        let client = self.client_for(actor).await?;
        let summary = self.find_accessible_repo(client.as_ref(), github_id).await?;
        let (owner, name) = summary.owner_and_name();

        let detail = match client.get_repo(owner, name).await {
            Ok(detail) => detail,
            Err(err) if err.is_not_found() => {
                return Err(CoreError::not_found(format!(
                    "repository {} not found on the host",
                    summary.full_name
                )))
            }
            Err(err) if err.is_forbidden() => {
                return Err(CoreError::permission(format!(
                    "host denied access to {}",
                    summary.full_name
                )))
            }
            Err(err) => return Err(CoreError::external(err)),
        };

        let admin = detail.permissions.map(|p| p.admin).unwrap_or(false);
        if !admin {
            return Err(CoreError::permission(format!(
                "admin access to {} is required to install the webhook",
                detail.full_name
            )));
        }

        let secret = crate::webhook::generate_secret();
        let outcome =
            crate::webhook::provision(client.as_ref(), owner, name, &self.config.webhook_url, &secret)
                .await;
        if let Some(warning) = &outcome.warning {
            warn!(repo = %detail.full_name, warning = %warning, "continuing connect without webhook");
        }

        let audit = NewAuditLog {
            actor_user_id: Some(actor),
            org_id: Some(org_id),
            action: ACTION_CONNECT.to_string(),
            resource: detail.full_name.clone(),
            status: "success".to_string(),
            ip_address: request_ip.map(str::to_string),
            metadata: json!({
                "github_id": github_id,
                "webhook_installed": outcome.hook_id.is_some(),
            }),
        };
        let row = self
            .db
            .repositories()
            .insert_connected(
                NewRepository {
                    github_id,
                    org_id,
                    name: detail.name.clone(),
                    full_name: detail.full_name.clone(),
                    is_private: detail.private,
                    language: detail.language.clone(),
                    webhook_id: outcome.hook_id,
                    webhook_secret: secret,
                },
                audit,
            )
            .await
            .map_err(|err| match err {
                DbError::Conflict => CoreError::conflict(format!(
                    "repository {github_id} is already connected to org {org_id}"
                )),
                other => CoreError::db(other),
            })?;

        self.invalidate_caches(actor, org_id).await;

        let job = ImportJob {
            repository_id: row.id,
            days: self.config.import_days,
        };
        if let Err(err) = self.import_queue.enqueue(job, self.retry_policy).await {
            // The startup sweep re-enqueues pending repositories, so a full
            // queue here costs latency, not data.
            warn!(repo = %row.full_name, error = %err, "failed to enqueue historical import");
        }

        info!(repo = %row.full_name, org_id = %org_id, "repository connected");

        let counts = self
            .db
            .repositories()
            .child_counts(row.id)
            .await
            .map_err(CoreError::db)?;
        Ok(ConnectedRepository {
            repository: row,
            counts,
        })
    }

    /// Disconnects a repository, removing its webhook best-effort first. The
    /// delete cascades to imported activity.
    pub async fn disconnect(
        &self,
        actor: Uuid,
        repository_id: Uuid,
        request_ip: Option<&str>,
    ) -> Result<()> {
        match self.try_disconnect(actor, repository_id, request_ip).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.audit_failure(
                    actor,
                    Uuid::nil(),
                    ACTION_DISCONNECT,
                    format!("repository:{repository_id}"),
                    request_ip,
                    &err,
                )
                .await;
                Err(err)
            }
        }
    }

    async fn try_disconnect(
        &self,
        actor: Uuid,
        repository_id: Uuid,
        request_ip: Option<&str>,
    ) -> Result<()> {
        let repo = self
            .db
            .repositories()
            .get(repository_id)
            .await
            .map_err(CoreError::db)?
            .ok_or_else(|| CoreError::not_found(format!("repository {repository_id}")))?;

        let role = self
            .db
            .memberships()
            .role(repo.org_id, actor)
            .await
            .map_err(CoreError::db)?;
        if role.is_none() {
            return Err(CoreError::permission(format!(
                "user {actor} is not a member of org {}",
                repo.org_id
            )));
        }

        if let Some(hook_id) = repo.webhook_id {
            match self.credentials.credential_for(actor).await {
                Ok(Some(credential)) => {
                    let client = self.clients.client_for(&credential);
                    let (owner, name) = split_full_name(&repo.full_name);
                    let outcome = crate::webhook::remove(client.as_ref(), owner, name, hook_id).await;
                    if let Some(warning) = outcome.warning {
                        warn!(repo = %repo.full_name, warning = %warning, "continuing disconnect despite webhook failure");
                    }
                }
                Ok(None) => {
                    warn!(repo = %repo.full_name, "no credential for actor, leaving remote webhook behind");
                }
                Err(err) => {
                    warn!(repo = %repo.full_name, error = %err, "credential lookup failed, leaving remote webhook behind");
                }
            }
        }

        let audit = NewAuditLog {
            actor_user_id: Some(actor),
            org_id: Some(repo.org_id),
            action: ACTION_DISCONNECT.to_string(),
            resource: repo.full_name.clone(),
            status: "success".to_string(),
            ip_address: request_ip.map(str::to_string),
            metadata: json!({ "github_id": repo.github_id }),
        };
        self.db
            .repositories()
            .delete_disconnected(repository_id, audit)
            .await
            .map_err(|err| match err {
                DbError::NotFound => {
                    CoreError::not_found(format!("repository {repository_id}"))
                }
                other => CoreError::db(other),
            })?;

        self.invalidate_caches(actor, repo.org_id).await;
        info!(repo = %repo.full_name, org_id = %repo.org_id, "repository disconnected");
        Ok(())
    }

    /// Connects a batch sequentially. Individual failures are reported, not
    /// raised, so one bad repository does not sink the rest.
    pub async fn connect_many(
        &self,
        actor: Uuid,
        github_ids: &[i64],
        org_id: Uuid,
        request_ip: Option<&str>,
    ) -> ConnectManyReport {
        let mut report = ConnectManyReport::default();
        for &github_id in github_ids {
            match self.connect(actor, github_id, org_id, request_ip).await {
                Ok(connected) => report.connected.push(connected),
                Err(err) => report.failed.push(FailedConnect {
                    github_id,
                    reason: err.to_string(),
                }),
            }
        }
        report
    }

    /// Lists the actor's host repositories, flagging those already connected
    /// to the org. Cached per `(actor, org, page)`.
    pub async fn list_available(
        &self,
        actor: Uuid,
        org_id: Uuid,
        page: u32,
    ) -> Result<Vec<AvailableRepo>> {
        if page == 0 {
            return Err(CoreError::Validation("pages are 1-based".to_string()));
        }

        let key = format!("gh:available:{actor}:{org_id}:{page}");
        if let Some(cached) = self.cache_read(&key).await {
            if let Ok(parsed) = serde_json::from_str::<Vec<AvailableRepo>>(&cached) {
                return Ok(parsed);
            }
        }

        let client = self.client_for(actor).await?;
        let repos = client
            .list_user_repos(page, LIST_PAGE_SIZE)
            .await
            .map_err(CoreError::external)?;

        let connected = self
            .db
            .repositories()
            .list_by_org(org_id)
            .await
            .map_err(CoreError::db)?;
        let connected_ids: HashSet<i64> = connected.iter().map(|r| r.github_id).collect();

        let available: Vec<AvailableRepo> = repos
            .into_iter()
            .map(|repo| AvailableRepo {
                already_connected: connected_ids.contains(&repo.id),
                github_id: repo.id,
                name: repo.name,
                full_name: repo.full_name,
                private: repo.private,
                language: repo.language,
            })
            .collect();

        self.cache_write(
            &key,
            &available,
            Duration::from_secs(self.config.available_ttl_secs),
        )
        .await;
        Ok(available)
    }

    /// Lists the org's connected repositories with activity counts. Cached
    /// per org.
    pub async fn list_connected(&self, org_id: Uuid) -> Result<Vec<ConnectedRepository>> {
        let key = format!("org:connected:{org_id}");
        if let Some(cached) = self.cache_read(&key).await {
            if let Ok(parsed) = serde_json::from_str::<Vec<ConnectedRepository>>(&cached) {
                return Ok(parsed);
            }
        }

        let repos = self
            .db
            .repositories()
            .list_by_org(org_id)
            .await
            .map_err(CoreError::db)?;
        let mut connected = Vec::with_capacity(repos.len());
        for repo in repos {
            let counts = self
                .db
                .repositories()
                .child_counts(repo.id)
                .await
                .map_err(CoreError::db)?;
            connected.push(ConnectedRepository {
                repository: repo,
                counts,
            });
        }

        self.cache_write(
            &key,
            &connected,
            Duration::from_secs(self.config.connected_ttl_secs),
        )
        .await;
        Ok(connected)
    }

    async fn client_for(&self, actor: Uuid) -> Result<Arc<dyn HostClient>> {
        match self.credentials.credential_for(actor).await {
            Ok(Some(credential)) => Ok(self.clients.client_for(&credential)),
            Ok(None) => Err(CoreError::auth("github token not found")),
            Err(err) => Err(CoreError::Auth(err.to_string())),
        }
    }

    /// Scans the actor's accessible repositories for the requested id. A
    /// repository the scan never reaches is treated as not found.
    async fn find_accessible_repo(
        &self,
        client: &dyn HostClient,
        github_id: i64,
    ) -> Result<RawRepo> {
        let mut page = 1u32;
        loop {
            let repos = client
                .list_user_repos(page, LIST_PAGE_SIZE)
                .await
                .map_err(|err| {
                    if err.is_forbidden() {
                        CoreError::permission("host denied repository listing".to_string())
                    } else {
                        CoreError::external(err)
                    }
                })?;
            let fetched = repos.len();
            if let Some(repo) = repos.into_iter().find(|r| r.id == github_id) {
                return Ok(repo);
            }
            if fetched < LIST_PAGE_SIZE as usize {
                return Err(CoreError::not_found(format!(
                    "repository {github_id} is not accessible to this user"
                )));
            }
            page += 1;
        }
    }

    async fn cache_read(&self, key: &str) -> Option<String> {
        match self.cache.get(key).await {
            Ok(value) => value,
            Err(err) => {
                warn!(key, error = %err, "cache read failed");
                None
            }
        }
    }

    async fn cache_write<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let serialized = match serde_json::to_string(value) {
            Ok(serialized) => serialized,
            Err(err) => {
                warn!(key, error = %err, "cache encode failed");
                return;
            }
        };
        if let Err(err) = self.cache.set_with_ttl(key, serialized, ttl).await {
            warn!(key, error = %err, "cache write failed");
        }
    }

    async fn invalidate_caches(&self, actor: Uuid, org_id: Uuid) {
        if let Err(err) = self
            .cache
            .delete_by_pattern(&format!("gh:available:{actor}:*"))
            .await
        {
            warn!(error = %err, "failed to invalidate available-repos cache");
        }
        if let Err(err) = self.cache.delete(&format!("org:connected:{org_id}")).await {
            warn!(error = %err, "failed to invalidate connected-repos cache");
        }
    }

    async fn audit_failure(
        &self,
        actor: Uuid,
        org_id: Uuid,
        action: &str,
        resource: String,
        request_ip: Option<&str>,
        err: &CoreError,
    ) {
        let entry = NewAuditLog {
            actor_user_id: Some(actor),
            org_id: (!org_id.is_nil()).then_some(org_id),
            action: action.to_string(),
            resource,
            status: "failure".to_string(),
            ip_address: request_ip.map(str::to_string),
            metadata: json!({ "error": err.to_string() }),
        };
        if let Err(audit_err) = self.db.audit_logs().append(entry).await {
            warn!(error = %audit_err, "failed to record audit entry");
        }
    }
}

fn split_full_name(full_name: &str) -> (&str, &str) {
    full_name.split_once('/').unwrap_or(("", full_name))
}
