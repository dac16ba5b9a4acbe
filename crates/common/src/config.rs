use std::path::Path;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub github: GithubConfig,
    pub connector: ConnectorConfig,
    pub importer: ImporterConfig,
    pub queue: QueueConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path(".")
    }

    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        Config::builder()
            .add_source(
                File::with_name(
                    path.as_ref()
                        .join("config/default")
                        .to_string_lossy()
                        .as_ref(),
                )
                .required(false),
            )
            .add_source(
                File::with_name(
                    path.as_ref()
                        .join("config/local")
                        .to_string_lossy()
                        .as_ref(),
                )
                .required(false),
            )
            .add_source(Environment::default().separator("__"))
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default)]
    pub test_admin_url: Option<String>,
}

/// A stored, already-decrypted GitHub credential for one platform user.
/// Production deployments swap this table for their own credential service.
#[derive(Debug, Clone, Deserialize)]
pub struct UserToken {
    pub user_id: Uuid,
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubConfig {
    #[serde(default)]
    pub tokens: Vec<UserToken>,
    pub user_agent: String,
    #[serde(default = "GithubConfig::default_api_base")]
    pub api_base: String,
}

impl GithubConfig {
    fn default_api_base() -> String {
        "https://api.github.com/".to_string()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorConfig {
    pub webhook_url: String,
    #[serde(default = "ConnectorConfig::default_available_ttl_secs")]
    pub available_ttl_secs: u64,
    #[serde(default = "ConnectorConfig::default_connected_ttl_secs")]
    pub connected_ttl_secs: u64,
    #[serde(default = "ConnectorConfig::default_import_days")]
    pub import_days: u32,
}

impl ConnectorConfig {
    const fn default_available_ttl_secs() -> u64 {
        300
    }

    const fn default_connected_ttl_secs() -> u64 {
        60
    }

    const fn default_import_days() -> u32 {
        90
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImporterConfig {
    #[serde(default = "ImporterConfig::default_page_size")]
    pub page_size: u32,
    #[serde(default = "ImporterConfig::default_page_delay_ms")]
    pub page_delay_ms: u64,
    #[serde(default = "ImporterConfig::default_rate_limit_fallback_secs")]
    pub rate_limit_fallback_secs: u64,
    #[serde(default = "ImporterConfig::default_worker_concurrency")]
    pub worker_concurrency: usize,
    #[serde(default = "ImporterConfig::default_job_timeout_secs")]
    pub job_timeout_secs: u64,
}

impl ImporterConfig {
    const fn default_page_size() -> u32 {
        100
    }

    const fn default_page_delay_ms() -> u64 {
        500
    }

    const fn default_rate_limit_fallback_secs() -> u64 {
        60
    }

    const fn default_worker_concurrency() -> usize {
        3
    }

    const fn default_job_timeout_secs() -> u64 {
        1800
    }
}

impl Default for ImporterConfig {
    fn default() -> Self {
        Self {
            page_size: Self::default_page_size(),
            page_delay_ms: Self::default_page_delay_ms(),
            rate_limit_fallback_secs: Self::default_rate_limit_fallback_secs(),
            worker_concurrency: Self::default_worker_concurrency(),
            job_timeout_secs: Self::default_job_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "QueueConfig::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "QueueConfig::default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "QueueConfig::default_backoff_max_secs")]
    pub backoff_max_secs: u64,
    #[serde(default = "QueueConfig::default_jitter_frac")]
    pub jitter_frac: f32,
    #[serde(default = "QueueConfig::default_stalled_after_secs")]
    pub stalled_after_secs: u64,
}

impl QueueConfig {
    const fn default_max_attempts() -> u32 {
        3
    }

    const fn default_backoff_base_secs() -> u64 {
        5
    }

    const fn default_backoff_max_secs() -> u64 {
        300
    }

    const fn default_jitter_frac() -> f32 {
        0.2
    }

    const fn default_stalled_after_secs() -> u64 {
        600
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            backoff_base_secs: Self::default_backoff_base_secs(),
            backoff_max_secs: Self::default_backoff_max_secs(),
            jitter_frac: Self::default_jitter_frac(),
            stalled_after_secs: Self::default_stalled_after_secs(),
        }
    }
}
