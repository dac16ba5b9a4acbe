use std::fmt::Debug;

pub type Result<T, E = CoreError> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("authentication error: {0}")]
    Auth(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("database error: {0}")]
    Database(#[source] anyhow::Error),
    #[error("external api error: {0}")]
    External(#[source] anyhow::Error),
}

impl CoreError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn permission(msg: impl Into<String>) -> Self {
        Self::Permission(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    pub fn db(err: impl Into<anyhow::Error>) -> Self {
        Self::Database(err.into())
    }

    pub fn external(err: impl Into<anyhow::Error>) -> Self {
        Self::External(err.into())
    }
}
