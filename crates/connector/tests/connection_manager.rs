use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cache::{Cache, MemoryCache};
use chrono::{DateTime, Utc};
use common::config::{ConnectorConfig, QueueConfig};
use common::CoreError;
use connector::ConnectionManager;
use db::{Database, OrgRole, SyncStatus};
use db_test_fixture::MemoryDatabase;
use gh_client::{
    CredentialError, CredentialService, GithubApiError, HostClient, HostClientFactory,
    HostCredential, RateLimitStatus, RawChangeRequest, RawCommit, RawIssue, RawRepo, RawWebhook,
    RepoPermissions, WebhookRequest,
};
use importer::ImportJob;
use queue::{InProcessQueue, JobQueue};
use uuid::Uuid;

#[derive(Default)]
struct StubClient {
    repos: Vec<RawRepo>,
    fail_webhook: bool,
    list_calls: AtomicU32,
    created_hooks: Mutex<Vec<WebhookRequest>>,
    deleted_hooks: Mutex<Vec<i64>>,
}

#[async_trait]
impl HostClient for StubClient {
    async fn list_user_repos(&self, page: u32, _per_page: u32) -> Result<Vec<RawRepo>, GithubApiError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if page == 1 {
            Ok(self.repos.clone())
        } else {
            Ok(Vec::new())
        }
    }

    async fn get_repo(&self, owner: &str, name: &str) -> Result<RawRepo, GithubApiError> {
        let full_name = format!("{owner}/{name}");
        self.repos
            .iter()
            .find(|r| r.full_name == full_name)
            .cloned()
            .ok_or(GithubApiError::Http {
                status: http::StatusCode::NOT_FOUND,
                endpoint: format!("repos/{full_name}"),
            })
    }

    async fn create_webhook(
        &self,
        _owner: &str,
        _name: &str,
        webhook: &WebhookRequest,
    ) -> Result<RawWebhook, GithubApiError> {
        if self.fail_webhook {
            return Err(GithubApiError::Http {
                status: http::StatusCode::INTERNAL_SERVER_ERROR,
                endpoint: "hooks".to_string(),
            });
        }
        self.created_hooks.lock().unwrap().push(webhook.clone());
        Ok(RawWebhook { id: 777 })
    }

    async fn delete_webhook(
        &self,
        _owner: &str,
        _name: &str,
        hook_id: i64,
    ) -> Result<(), GithubApiError> {
        self.deleted_hooks.lock().unwrap().push(hook_id);
        Ok(())
    }

    async fn list_commits(
        &self,
        _owner: &str,
        _name: &str,
        _since: DateTime<Utc>,
        _page: u32,
        _per_page: u32,
    ) -> Result<Vec<RawCommit>, GithubApiError> {
        Ok(Vec::new())
    }

    async fn list_change_requests(
        &self,
        _owner: &str,
        _name: &str,
        _page: u32,
        _per_page: u32,
    ) -> Result<Vec<RawChangeRequest>, GithubApiError> {
        Ok(Vec::new())
    }

    async fn list_issues(
        &self,
        _owner: &str,
        _name: &str,
        _page: u32,
        _per_page: u32,
    ) -> Result<Vec<RawIssue>, GithubApiError> {
        Ok(Vec::new())
    }

    async fn rate_limit(&self) -> Result<RateLimitStatus, GithubApiError> {
        Ok(RateLimitStatus {
            limit: 5000,
            remaining: 5000,
            reset: Utc::now(),
        })
    }
}

struct SharedFactory(Arc<StubClient>);

impl HostClientFactory for SharedFactory {
    fn client_for(&self, _credential: &HostCredential) -> Arc<dyn HostClient> {
        self.0.clone()
    }
}

struct FixedToken;

#[async_trait]
impl CredentialService for FixedToken {
    async fn credential_for(
        &self,
        _user_id: Uuid,
    ) -> Result<Option<HostCredential>, CredentialError> {
        Ok(Some(HostCredential {
            token: "token".to_string(),
        }))
    }
}

fn raw_repo(id: i64, full_name: &str, admin: bool) -> RawRepo {
    let name = full_name
        .split_once('/')
        .map(|(_, n)| n)
        .unwrap_or(full_name);
    RawRepo {
        id,
        name: name.to_string(),
        full_name: full_name.to_string(),
        private: false,
        language: Some("Rust".to_string()),
        permissions: Some(RepoPermissions {
            admin,
            push: true,
            pull: true,
        }),
    }
}

struct World {
    db: Arc<MemoryDatabase>,
    client: Arc<StubClient>,
    queue: Arc<InProcessQueue<ImportJob>>,
    manager: ConnectionManager,
    org_id: Uuid,
    actor: Uuid,
}

fn world(client: StubClient) -> World {
    let db = Arc::new(MemoryDatabase::new());
    let org_id = Uuid::new_v4();
    let actor = db.add_user(Some(1), "owner");
    db.add_member(org_id, actor, OrgRole::Admin);

    let client = Arc::new(client);
    let queue = Arc::new(InProcessQueue::default());
    let manager = ConnectionManager::new(
        db.clone() as Arc<dyn Database>,
        Arc::new(MemoryCache::new(64)) as Arc<dyn Cache>,
        Arc::new(FixedToken),
        Arc::new(SharedFactory(client.clone())),
        queue.clone() as Arc<dyn JobQueue<ImportJob>>,
        ConnectorConfig {
            webhook_url: "https://platform.example.com/hooks/github".to_string(),
            available_ttl_secs: 300,
            connected_ttl_secs: 60,
            import_days: 90,
        },
        &QueueConfig::default(),
    );
    World {
        db,
        client,
        queue,
        manager,
        org_id,
        actor,
    }
}

#[tokio::test]
async fn connect_persists_audits_and_enqueues_import() {
    let w = world(StubClient {
        repos: vec![raw_repo(42, "acme/widget", true)],
        ..StubClient::default()
    });

    let connected = w
        .manager
        .connect(w.actor, 42, w.org_id, Some("10.0.0.1"))
        .await
        .unwrap();

    let repo = &connected.repository;
    assert_eq!(repo.github_id, 42);
    assert_eq!(repo.full_name, "acme/widget");
    assert_eq!(repo.sync_status, SyncStatus::Pending);
    assert_eq!(repo.webhook_id, Some(777));
    assert_eq!(repo.webhook_secret.len(), 64);
    assert_eq!(connected.counts.commits, 0);

    let hooks = w.client.created_hooks.lock().unwrap().clone();
    assert_eq!(hooks.len(), 1);
    assert_eq!(hooks[0].url, "https://platform.example.com/hooks/github");
    assert_eq!(hooks[0].secret, repo.webhook_secret);

    let audits = w.db.audit_rows();
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].action, "REPOSITORY_CONNECTED");
    assert_eq!(audits[0].status, "success");
    assert_eq!(audits[0].ip_address.as_deref(), Some("10.0.0.1"));

    let job = w.queue.claim().await.unwrap();
    assert_eq!(job.payload.repository_id, repo.id);
    assert_eq!(job.payload.days, 90);
}

#[tokio::test]
async fn duplicate_connect_is_a_conflict_and_leaves_a_failure_audit() {
    let w = world(StubClient {
        repos: vec![raw_repo(42, "acme/widget", true)],
        ..StubClient::default()
    });

    w.manager.connect(w.actor, 42, w.org_id, None).await.unwrap();
    let err = w
        .manager
        .connect(w.actor, 42, w.org_id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));

    let audits = w.db.audit_rows();
    assert_eq!(audits.len(), 2);
    assert_eq!(audits[1].status, "failure");
}

#[tokio::test]
async fn non_member_cannot_connect() {
    let w = world(StubClient {
        repos: vec![raw_repo(42, "acme/widget", true)],
        ..StubClient::default()
    });
    let stranger = w.db.add_user(Some(2), "stranger");

    let err = w
        .manager
        .connect(stranger, 42, w.org_id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Permission(_)));
}

#[tokio::test]
async fn missing_admin_permission_is_rejected() {
    let w = world(StubClient {
        repos: vec![raw_repo(42, "acme/widget", false)],
        ..StubClient::default()
    });

    let err = w
        .manager
        .connect(w.actor, 42, w.org_id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Permission(_)));
    let repos = w.db.repositories().list_by_org(w.org_id).await.unwrap();
    assert!(repos.is_empty());
}

#[tokio::test]
async fn inaccessible_repository_is_not_found() {
    let w = world(StubClient {
        repos: vec![raw_repo(42, "acme/widget", true)],
        ..StubClient::default()
    });

    let err = w
        .manager
        .connect(w.actor, 999, w.org_id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NotFound(_)));
}

#[tokio::test]
async fn webhook_failure_still_connects() {
    let w = world(StubClient {
        repos: vec![raw_repo(42, "acme/widget", true)],
        fail_webhook: true,
        ..StubClient::default()
    });

    let connected = w
        .manager
        .connect(w.actor, 42, w.org_id, None)
        .await
        .unwrap();
    assert_eq!(connected.repository.webhook_id, None);
    assert_eq!(connected.repository.sync_status, SyncStatus::Pending);

    // The import job is queued regardless of webhook state.
    assert!(w.queue.claim().await.is_some());
}

#[tokio::test]
async fn disconnect_deletes_row_and_remote_webhook() {
    let w = world(StubClient {
        repos: vec![raw_repo(42, "acme/widget", true)],
        ..StubClient::default()
    });

    let connected = w
        .manager
        .connect(w.actor, 42, w.org_id, None)
        .await
        .unwrap();
    w.manager
        .disconnect(w.actor, connected.repository.id, None)
        .await
        .unwrap();

    assert!(w.db.repository(connected.repository.id).is_none());
    assert_eq!(w.client.deleted_hooks.lock().unwrap().clone(), vec![777]);

    let audits = w.db.audit_rows();
    assert_eq!(audits.len(), 2);
    assert_eq!(audits[1].action, "REPOSITORY_DISCONNECTED");
    assert_eq!(audits[1].status, "success");
}

#[tokio::test]
async fn disconnect_then_reconnect_succeeds() {
    let w = world(StubClient {
        repos: vec![raw_repo(42, "acme/widget", true)],
        ..StubClient::default()
    });

    let first = w.manager.connect(w.actor, 42, w.org_id, None).await.unwrap();
    w.manager
        .disconnect(w.actor, first.repository.id, None)
        .await
        .unwrap();

    let second = w.manager.connect(w.actor, 42, w.org_id, None).await.unwrap();
    assert_ne!(second.repository.id, first.repository.id);
    assert_eq!(second.repository.github_id, 42);
}

#[tokio::test]
async fn connect_many_reports_per_repository_outcomes() {
    let w = world(StubClient {
        repos: vec![
            raw_repo(42, "acme/widget", true),
            raw_repo(43, "acme/gadget", false),
        ],
        ..StubClient::default()
    });

    let report = w
        .manager
        .connect_many(w.actor, &[42, 43, 999], w.org_id, None)
        .await;

    assert_eq!(report.connected.len(), 1);
    assert_eq!(report.connected[0].repository.github_id, 42);
    assert_eq!(report.failed.len(), 2);
    assert_eq!(report.failed[0].github_id, 43);
    assert_eq!(report.failed[1].github_id, 999);
}

#[tokio::test]
async fn list_available_is_cached_until_a_connect_invalidates_it() {
    let w = world(StubClient {
        repos: vec![raw_repo(42, "acme/widget", true)],
        ..StubClient::default()
    });

    let first = w.manager.list_available(w.actor, w.org_id, 1).await.unwrap();
    assert_eq!(first.len(), 1);
    assert!(!first[0].already_connected);
    assert_eq!(w.client.list_calls.load(Ordering::SeqCst), 1);

    // Second read comes from cache.
    w.manager.list_available(w.actor, w.org_id, 1).await.unwrap();
    assert_eq!(w.client.list_calls.load(Ordering::SeqCst), 1);

    // Connecting invalidates the actor's availability pages.
    w.manager.connect(w.actor, 42, w.org_id, None).await.unwrap();
    let calls_after_connect = w.client.list_calls.load(Ordering::SeqCst);

    let refreshed = w.manager.list_available(w.actor, w.org_id, 1).await.unwrap();
    assert!(refreshed[0].already_connected);
    assert_eq!(
        w.client.list_calls.load(Ordering::SeqCst),
        calls_after_connect + 1
    );
}

#[tokio::test]
async fn list_connected_serves_counts_and_caches() {
    let w = world(StubClient {
        repos: vec![raw_repo(42, "acme/widget", true)],
        ..StubClient::default()
    });
    w.manager.connect(w.actor, 42, w.org_id, None).await.unwrap();

    let connected = w.manager.list_connected(w.org_id).await.unwrap();
    assert_eq!(connected.len(), 1);
    assert_eq!(connected[0].repository.github_id, 42);
    assert_eq!(connected[0].counts.commits, 0);

    let again = w.manager.list_connected(w.org_id).await.unwrap();
    assert_eq!(again.len(), 1);
}
