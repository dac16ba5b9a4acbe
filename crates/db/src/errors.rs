#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("query error: {0}")]
    Query(#[source] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("not found")]
    NotFound,
    #[error("duplicate key")]
    Conflict,
}

impl DbError {
    /// Folds unique-constraint violations into `Conflict` so callers can
    /// distinguish a lost insert race from an infrastructure failure.
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return DbError::Conflict;
            }
        }
        DbError::Query(err)
    }
}

pub type Result<T> = std::result::Result<T, DbError>;
