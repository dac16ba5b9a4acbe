use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use common::config::ImporterConfig;
use common::{Clock, CoreError};
use db::{Database, NewRepository, OrgRole, RepositoryRow, SyncStatus};
use db_test_fixture::MemoryDatabase;
use gh_client::{
    CommitDetail, CommitStats, CredentialError, CredentialService, GitAuthor, GithubApiError,
    HostClient, HostClientFactory, HostCredential, RateLimitStatus, RawChangeRequest, RawCommit,
    RawIssue, RawRepo, RawWebhook, UserRef, WebhookRequest,
};
use importer::{ImportPipeline, ImportSummary};
use uuid::Uuid;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

fn recent() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 20, 8, 0, 0).unwrap()
}

struct FrozenClock {
    now: Mutex<DateTime<Utc>>,
    sleeps: Mutex<Vec<Duration>>,
}

impl FrozenClock {
    fn new(at: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(at),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

#[async_trait]
impl Clock for FrozenClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
        let mut now = self.now.lock().unwrap();
        *now += chrono::Duration::from_std(duration).unwrap_or_default();
    }
}

#[derive(Default)]
struct StubClient {
    commit_pages: Vec<Vec<RawCommit>>,
    change_request_pages: Vec<Vec<RawChangeRequest>>,
    issue_pages: Vec<Vec<RawIssue>>,
    fail_commits: bool,
    fail_change_requests: bool,
    fail_issues: bool,
    budgets: Mutex<VecDeque<RateLimitStatus>>,
    commit_calls: AtomicU32,
}

impl StubClient {
    fn push_budget(&self, remaining: i64, reset: DateTime<Utc>) {
        self.budgets.lock().unwrap().push_back(RateLimitStatus {
            limit: 5000,
            remaining,
            reset,
        });
    }

    fn server_error(endpoint: &str) -> GithubApiError {
        GithubApiError::Http {
            status: http::StatusCode::INTERNAL_SERVER_ERROR,
            endpoint: endpoint.to_string(),
        }
    }
}

#[async_trait]
impl HostClient for StubClient {
    async fn list_user_repos(&self, _page: u32, _per_page: u32) -> Result<Vec<RawRepo>, GithubApiError> {
        Ok(Vec::new())
    }

    async fn get_repo(&self, _owner: &str, _name: &str) -> Result<RawRepo, GithubApiError> {
        Err(Self::server_error("repos"))
    }

    async fn create_webhook(
        &self,
        _owner: &str,
        _name: &str,
        _webhook: &WebhookRequest,
    ) -> Result<RawWebhook, GithubApiError> {
        Err(Self::server_error("hooks"))
    }

    async fn delete_webhook(
        &self,
        _owner: &str,
        _name: &str,
        _hook_id: i64,
    ) -> Result<(), GithubApiError> {
        Ok(())
    }

    async fn list_commits(
        &self,
        _owner: &str,
        _name: &str,
        _since: DateTime<Utc>,
        page: u32,
        _per_page: u32,
    ) -> Result<Vec<RawCommit>, GithubApiError> {
        self.commit_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_commits {
            return Err(Self::server_error("commits"));
        }
        Ok(self
            .commit_pages
            .get(page as usize - 1)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_change_requests(
        &self,
        _owner: &str,
        _name: &str,
        page: u32,
        _per_page: u32,
    ) -> Result<Vec<RawChangeRequest>, GithubApiError> {
        if self.fail_change_requests {
            return Err(Self::server_error("pulls"));
        }
        Ok(self
            .change_request_pages
            .get(page as usize - 1)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_issues(
        &self,
        _owner: &str,
        _name: &str,
        page: u32,
        _per_page: u32,
    ) -> Result<Vec<RawIssue>, GithubApiError> {
        if self.fail_issues {
            return Err(Self::server_error("issues"));
        }
        Ok(self
            .issue_pages
            .get(page as usize - 1)
            .cloned()
            .unwrap_or_default())
    }

    async fn rate_limit(&self) -> Result<RateLimitStatus, GithubApiError> {
        if let Some(status) = self.budgets.lock().unwrap().pop_front() {
            return Ok(status);
        }
        Ok(RateLimitStatus {
            limit: 5000,
            remaining: 5000,
            reset: now() + chrono::Duration::hours(1),
        })
    }
}

struct StubFactory {
    client: Arc<StubClient>,
}

impl HostClientFactory for StubFactory {
    fn client_for(&self, _credential: &HostCredential) -> Arc<dyn HostClient> {
        self.client.clone()
    }
}

struct StubCredentials {
    token: Option<String>,
}

#[async_trait]
impl CredentialService for StubCredentials {
    async fn credential_for(
        &self,
        _user_id: Uuid,
    ) -> Result<Option<HostCredential>, CredentialError> {
        Ok(self
            .token
            .clone()
            .map(|token| HostCredential { token }))
    }
}

fn commit(sha: &str, message: &str, at: DateTime<Utc>) -> RawCommit {
    RawCommit {
        sha: sha.to_string(),
        commit: CommitDetail {
            message: message.to_string(),
            author: Some(GitAuthor {
                name: Some("Dev".to_string()),
                email: Some("dev@example.com".to_string()),
                date: Some(at),
            }),
        },
        author: Some(UserRef {
            id: 9001,
            login: "maintainer".to_string(),
        }),
        stats: Some(CommitStats {
            additions: 3,
            deletions: 1,
        }),
    }
}

fn change_request(id: i64, number: i64, title: &str, updated: DateTime<Utc>) -> RawChangeRequest {
    RawChangeRequest {
        id,
        number,
        title: title.to_string(),
        state: "open".to_string(),
        user: Some(UserRef {
            id: 9001,
            login: "maintainer".to_string(),
        }),
        additions: Some(10),
        deletions: Some(2),
        merged_at: None,
        closed_at: None,
        created_at: updated - chrono::Duration::days(1),
        updated_at: updated,
    }
}

fn issue(id: i64, number: i64, title: &str, updated: DateTime<Utc>, is_pr: bool) -> RawIssue {
    RawIssue {
        id,
        number,
        title: title.to_string(),
        state: "open".to_string(),
        user: None,
        pull_request: is_pr.then(|| serde_json::json!({"url": "https://example.com"})),
        closed_at: None,
        created_at: updated - chrono::Duration::days(1),
        updated_at: updated,
    }
}

fn setup_repo(db: &MemoryDatabase) -> RepositoryRow {
    let org_id = Uuid::new_v4();
    let user = db.add_user(Some(9001), "maintainer");
    db.add_member(org_id, user, OrgRole::Admin);
    db.add_repository(NewRepository {
        github_id: 42,
        org_id,
        name: "widget".to_string(),
        full_name: "acme/widget".to_string(),
        is_private: false,
        language: Some("Rust".to_string()),
        webhook_id: None,
        webhook_secret: "secret".to_string(),
    })
}

struct Harness {
    db: Arc<MemoryDatabase>,
    client: Arc<StubClient>,
    clock: Arc<FrozenClock>,
    pipeline: ImportPipeline,
    repo: RepositoryRow,
}

fn harness(client: StubClient) -> Harness {
    harness_with_token(client, Some("token".to_string()))
}

fn harness_with_token(client: StubClient, token: Option<String>) -> Harness {
    let db = Arc::new(MemoryDatabase::new());
    let repo = setup_repo(&db);
    let client = Arc::new(client);
    let clock = Arc::new(FrozenClock::new(now()));
    let pipeline = ImportPipeline::new(
        db.clone() as Arc<dyn Database>,
        Arc::new(StubCredentials { token }),
        Arc::new(StubFactory {
            client: client.clone(),
        }),
        clock.clone() as Arc<dyn Clock>,
        ImporterConfig {
            page_delay_ms: 0,
            ..ImporterConfig::default()
        },
    );
    Harness {
        db,
        client,
        clock,
        pipeline,
        repo,
    }
}

async fn run(h: &Harness) -> Result<ImportSummary, CoreError> {
    h.pipeline.import_historical_data(h.repo.id, 90).await
}

#[tokio::test]
async fn first_import_fills_all_three_streams() {
    let h = harness(StubClient {
        commit_pages: vec![vec![commit("aaa", "first", recent())]],
        change_request_pages: vec![vec![change_request(100, 1, "feat", recent())]],
        issue_pages: vec![vec![issue(200, 2, "bug", recent(), false)]],
        ..StubClient::default()
    });

    let summary = run(&h).await.unwrap();
    assert_eq!(summary.commits, 1);
    assert_eq!(summary.change_requests, 1);
    assert_eq!(summary.issues, 1);
    assert!(summary.errors.is_empty());

    let repo = h.db.repository(h.repo.id).unwrap();
    assert_eq!(repo.sync_status, SyncStatus::Active);
    assert_eq!(repo.last_synced_at, Some(h.clock.now()));

    // Authors resolve to the platform user via github_id.
    let commits = h.db.commit_rows();
    assert!(commits[0].author_user_id.is_some());
    assert_eq!(commits[0].author_github_id, Some(9001));
}

#[tokio::test]
async fn reimport_keeps_first_commit_message_and_refreshes_change_requests() {
    let h = harness(StubClient {
        commit_pages: vec![vec![commit("aaa", "original message", recent())]],
        change_request_pages: vec![vec![change_request(100, 1, "draft title", recent())]],
        ..StubClient::default()
    });
    run(&h).await.unwrap();

    let h2 = Harness {
        pipeline: ImportPipeline::new(
            h.db.clone() as Arc<dyn Database>,
            Arc::new(StubCredentials {
                token: Some("token".to_string()),
            }),
            Arc::new(StubFactory {
                client: Arc::new(StubClient {
                    commit_pages: vec![vec![commit("aaa", "rewritten message", recent())]],
                    change_request_pages: vec![vec![change_request(
                        100,
                        1,
                        "final title",
                        recent(),
                    )]],
                    ..StubClient::default()
                }),
            }),
            h.clock.clone() as Arc<dyn Clock>,
            ImporterConfig {
                page_delay_ms: 0,
                ..ImporterConfig::default()
            },
        ),
        ..h
    };
    run(&h2).await.unwrap();

    let commits = h2.db.commit_rows();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].message, "original message");

    let change_requests = h2.db.change_request_rows();
    assert_eq!(change_requests.len(), 1);
    assert_eq!(change_requests[0].title, "final title");
}

#[tokio::test]
async fn failed_stream_is_isolated_and_repository_still_activates() {
    let h = harness(StubClient {
        commit_pages: vec![vec![commit("aaa", "first", recent())]],
        fail_change_requests: true,
        issue_pages: vec![vec![issue(200, 2, "bug", recent(), false)]],
        ..StubClient::default()
    });

    let summary = run(&h).await.unwrap();
    assert_eq!(summary.commits, 1);
    assert_eq!(summary.change_requests, 0);
    assert_eq!(summary.issues, 1);
    assert_eq!(summary.errors.len(), 1);
    assert!(summary.errors[0].starts_with("change requests:"));

    let repo = h.db.repository(h.repo.id).unwrap();
    assert_eq!(repo.sync_status, SyncStatus::Active);
}

#[tokio::test]
async fn total_failure_marks_repository_error() {
    let h = harness(StubClient {
        fail_commits: true,
        fail_change_requests: true,
        fail_issues: true,
        ..StubClient::default()
    });

    let err = run(&h).await.unwrap_err();
    assert!(matches!(err, CoreError::External(_)));

    let repo = h.db.repository(h.repo.id).unwrap();
    assert_eq!(repo.sync_status, SyncStatus::Error);
}

#[tokio::test]
async fn missing_credential_fails_with_auth_error() {
    let h = harness_with_token(StubClient::default(), None);

    let err = run(&h).await.unwrap_err();
    assert!(matches!(err, CoreError::Auth(_)));

    let repo = h.db.repository(h.repo.id).unwrap();
    assert_eq!(repo.sync_status, SyncStatus::Error);
}

#[tokio::test]
async fn pagination_walks_until_a_short_page() {
    let page = |offset: i64| -> Vec<RawCommit> {
        (0..100)
            .map(|i| commit(&format!("sha{}", offset + i), "msg", recent()))
            .collect()
    };
    let h = harness(StubClient {
        commit_pages: vec![
            page(0),
            page(100),
            (0..50)
                .map(|i| commit(&format!("sha{}", 200 + i), "msg", recent()))
                .collect(),
        ],
        ..StubClient::default()
    });

    let summary = run(&h).await.unwrap();
    assert_eq!(summary.commits, 250);
    assert_eq!(h.client.commit_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn pull_requests_on_the_issues_endpoint_are_skipped() {
    let h = harness(StubClient {
        issue_pages: vec![vec![
            issue(200, 2, "real issue", recent(), false),
            issue(201, 3, "actually a pr", recent(), true),
        ]],
        ..StubClient::default()
    });

    let summary = run(&h).await.unwrap();
    assert_eq!(summary.issues, 1);
    let issues = h.db.issue_rows();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].github_id, 200);
}

#[tokio::test]
async fn change_requests_older_than_the_cutoff_are_dropped() {
    let stale = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
    let h = harness(StubClient {
        change_request_pages: vec![vec![
            change_request(100, 1, "fresh", recent()),
            change_request(101, 2, "stale", stale),
        ]],
        commit_pages: vec![vec![commit("aaa", "first", recent())]],
        ..StubClient::default()
    });

    let summary = run(&h).await.unwrap();
    assert_eq!(summary.change_requests, 1);
    assert_eq!(h.db.change_request_rows()[0].github_id, 100);
}

#[tokio::test]
async fn low_budget_pauses_until_reset_before_the_next_page() {
    let client = StubClient {
        commit_pages: vec![vec![commit("aaa", "first", recent())]],
        ..StubClient::default()
    };
    // First probe reports a nearly spent budget resetting in 30s.
    client.push_budget(5, now() + chrono::Duration::seconds(30));

    let h = harness(client);
    let summary = run(&h).await.unwrap();
    assert_eq!(summary.commits, 1);

    let sleeps = h.clock.sleeps();
    assert!(sleeps.contains(&Duration::from_secs(30)), "sleeps: {sleeps:?}");
}
