use std::time::Duration;

use chrono::{DateTime, Utc};
use http::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum GithubApiError {
    #[error("github api error: {status} for {endpoint}")]
    Http {
        status: StatusCode,
        endpoint: String,
    },
    #[error("github rate limit hit for {endpoint}")]
    RateLimited {
        endpoint: String,
        reset: Option<DateTime<Utc>>,
        retry_after: Option<Duration>,
    },
    #[error("transport error for {endpoint}: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("decode error for {endpoint}: {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: anyhow::Error,
    },
}

impl GithubApiError {
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            GithubApiError::Http { status, .. } => Some(*status),
            GithubApiError::RateLimited { .. } => Some(StatusCode::FORBIDDEN),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            GithubApiError::Http {
                status: StatusCode::NOT_FOUND,
                ..
            }
        )
    }

    pub fn is_forbidden(&self) -> bool {
        matches!(
            self,
            GithubApiError::Http {
                status: StatusCode::FORBIDDEN,
                ..
            }
        )
    }
}

pub type Result<T> = std::result::Result<T, GithubApiError>;
