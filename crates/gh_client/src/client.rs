use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;
use url::Url;

use crate::credentials::HostCredential;
use crate::error::{GithubApiError, Result};
use crate::payloads::{
    parse_rate_limit, parse_retry_after, RateLimitStatus, RawChangeRequest, RawCommit, RawIssue,
    RawRepo, RawWebhook, WebhookRequest,
};

/// Authenticated client to the source-code host's REST API. One instance per
/// credential; the rate-limit budget it reports is the credential's.
#[async_trait]
pub trait HostClient: Send + Sync {
    async fn list_user_repos(&self, page: u32, per_page: u32) -> Result<Vec<RawRepo>>;
    async fn get_repo(&self, owner: &str, name: &str) -> Result<RawRepo>;
    async fn create_webhook(
        &self,
        owner: &str,
        name: &str,
        webhook: &WebhookRequest,
    ) -> Result<RawWebhook>;
    async fn delete_webhook(&self, owner: &str, name: &str, hook_id: i64) -> Result<()>;
    async fn list_commits(
        &self,
        owner: &str,
        name: &str,
        since: DateTime<Utc>,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<RawCommit>>;
    async fn list_change_requests(
        &self,
        owner: &str,
        name: &str,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<RawChangeRequest>>;
    async fn list_issues(
        &self,
        owner: &str,
        name: &str,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<RawIssue>>;
    async fn rate_limit(&self) -> Result<RateLimitStatus>;
}

/// Builds a `HostClient` for a decrypted credential. Injected so tests can
/// substitute stub clients without touching the network.
pub trait HostClientFactory: Send + Sync {
    fn client_for(&self, credential: &HostCredential) -> Arc<dyn HostClient>;
}

pub struct RestClientFactory {
    http: reqwest::Client,
    base: Url,
}

impl RestClientFactory {
    pub fn new(base: Url, user_agent: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|err| GithubApiError::Transport {
                endpoint: "client".to_string(),
                source: err.into(),
            })?;
        Ok(Self { http, base })
    }
}

impl HostClientFactory for RestClientFactory {
    fn client_for(&self, credential: &HostCredential) -> Arc<dyn HostClient> {
        Arc::new(RestHostClient::new(
            self.http.clone(),
            self.base.clone(),
            credential.token.clone(),
        ))
    }
}

pub struct RestHostClient {
    http: reqwest::Client,
    base: Url,
    token: String,
}

impl RestHostClient {
    pub fn new(http: reqwest::Client, base: Url, token: String) -> Self {
        Self { http, base, token }
    }

    fn join(&self, path: &str) -> Result<Url> {
        self.base.join(path).map_err(|err| GithubApiError::Decode {
            endpoint: path.to_string(),
            source: err.into(),
        })
    }

    fn with_query(url: &mut Url, params: &[(&str, String)]) {
        let mut query_pairs = url.query_pairs_mut();
        for (key, val) in params {
            query_pairs.append_pair(key, val);
        }
    }

    async fn send(
        &self,
        method: http::Method,
        url: Url,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response> {
        let endpoint = url.path().trim_start_matches('/').to_string();
        debug!(endpoint = %endpoint, method = %method, "dispatching github request");

        let mut builder = self
            .http
            .request(method, url)
            .header(http::header::ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .header(
                http::header::AUTHORIZATION,
                format!("token {}", self.token),
            );
        if let Some(body) = body {
            builder = builder.json(&body);
        }

        let response = builder
            .send()
            .await
            .map_err(|err| GithubApiError::Transport {
                endpoint: endpoint.clone(),
                source: err.into(),
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        Err(classify_error(status, endpoint, response.headers()))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        let endpoint = url.path().trim_start_matches('/').to_string();
        let response = self.send(http::Method::GET, url, None).await?;
        response
            .json::<T>()
            .await
            .map_err(|err| GithubApiError::Decode {
                endpoint,
                source: err.into(),
            })
    }
}

/// 403/429 responses that carry rate-limit evidence become `RateLimited`;
/// a plain 403 stays `Http` so permission checks can see it.
fn classify_error(status: StatusCode, endpoint: String, headers: &http::HeaderMap) -> GithubApiError {
    let retry_after = parse_retry_after(headers);
    let rate = parse_rate_limit(headers);
    let exhausted = rate.map(|r| r.remaining == 0).unwrap_or(false);

    if status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN && (exhausted || retry_after.is_some()))
    {
        return GithubApiError::RateLimited {
            endpoint,
            reset: rate.map(|r| r.reset),
            retry_after,
        };
    }
    GithubApiError::Http { status, endpoint }
}

#[async_trait]
impl HostClient for RestHostClient {
    async fn list_user_repos(&self, page: u32, per_page: u32) -> Result<Vec<RawRepo>> {
        let mut url = self.join("user/repos")?;
        Self::with_query(
            &mut url,
            &[
                ("sort", "pushed".to_string()),
                ("direction", "desc".to_string()),
                ("page", page.to_string()),
                ("per_page", per_page.to_string()),
            ],
        );
        self.get_json(url).await
    }

    async fn get_repo(&self, owner: &str, name: &str) -> Result<RawRepo> {
        let url = self.join(&format!("repos/{owner}/{name}"))?;
        self.get_json(url).await
    }

    async fn create_webhook(
        &self,
        owner: &str,
        name: &str,
        webhook: &WebhookRequest,
    ) -> Result<RawWebhook> {
        let url = self.join(&format!("repos/{owner}/{name}/hooks"))?;
        let endpoint = url.path().trim_start_matches('/').to_string();
        let body = json!({
            "name": "web",
            "active": true,
            "events": webhook.events,
            "config": {
                "url": webhook.url,
                "secret": webhook.secret,
                "content_type": "json",
            },
        });
        let response = self.send(http::Method::POST, url, Some(body)).await?;
        response
            .json::<RawWebhook>()
            .await
            .map_err(|err| GithubApiError::Decode {
                endpoint,
                source: err.into(),
            })
    }

    async fn delete_webhook(&self, owner: &str, name: &str, hook_id: i64) -> Result<()> {
        let url = self.join(&format!("repos/{owner}/{name}/hooks/{hook_id}"))?;
        self.send(http::Method::DELETE, url, None).await.map(|_| ())
    }

    async fn list_commits(
        &self,
        owner: &str,
        name: &str,
        since: DateTime<Utc>,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<RawCommit>> {
        let mut url = self.join(&format!("repos/{owner}/{name}/commits"))?;
        Self::with_query(
            &mut url,
            &[
                ("since", since.to_rfc3339()),
                ("page", page.to_string()),
                ("per_page", per_page.to_string()),
            ],
        );
        self.get_json(url).await
    }

    async fn list_change_requests(
        &self,
        owner: &str,
        name: &str,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<RawChangeRequest>> {
        let mut url = self.join(&format!("repos/{owner}/{name}/pulls"))?;
        Self::with_query(
            &mut url,
            &[
                ("state", "all".to_string()),
                ("sort", "updated".to_string()),
                ("direction", "desc".to_string()),
                ("page", page.to_string()),
                ("per_page", per_page.to_string()),
            ],
        );
        self.get_json(url).await
    }

    async fn list_issues(
        &self,
        owner: &str,
        name: &str,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<RawIssue>> {
        let mut url = self.join(&format!("repos/{owner}/{name}/issues"))?;
        Self::with_query(
            &mut url,
            &[
                ("state", "all".to_string()),
                ("sort", "updated".to_string()),
                ("direction", "desc".to_string()),
                ("page", page.to_string()),
                ("per_page", per_page.to_string()),
            ],
        );
        self.get_json(url).await
    }

    async fn rate_limit(&self) -> Result<RateLimitStatus> {
        #[derive(serde::Deserialize)]
        struct RateLimitBody {
            resources: Resources,
        }
        #[derive(serde::Deserialize)]
        struct Resources {
            core: CoreBudget,
        }
        #[derive(serde::Deserialize)]
        struct CoreBudget {
            limit: i64,
            remaining: i64,
            reset: i64,
        }

        let url = self.join("rate_limit")?;
        let body: RateLimitBody = self.get_json(url).await?;
        let reset = DateTime::from_timestamp(body.resources.core.reset, 0)
            .unwrap_or_else(Utc::now);
        Ok(RateLimitStatus {
            limit: body.resources.core.limit,
            remaining: body.resources.core.remaining,
            reset,
        })
    }
}
