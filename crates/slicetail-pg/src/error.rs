use thiserror::Error;

use slicetail_query::DaoError;

#[derive(Debug, Error)]
pub enum PgError {
    #[error("postgres error: {0}")]
    Postgres(String),

    #[error("connection failed: {0}")]
    Connection(String),
}

impl From<tokio_postgres::Error> for PgError {
    fn from(e: tokio_postgres::Error) -> Self {
        let detail = match e.as_db_error() {
            Some(db) => format!("{} [{}]", db.message(), db.code().code()),
            None => e.to_string(),
        };
        PgError::Postgres(detail)
    }
}

impl From<PgError> for DaoError {
    fn from(e: PgError) -> Self {
        match e {
            PgError::Connection(msg) => DaoError::Connection(msg),
            PgError::Postgres(msg) => DaoError::Query(msg),
        }
    }
}

pub type PgResult<T> = Result<T, PgError>;
