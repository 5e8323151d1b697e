use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("offset serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid stored offset: {0}")]
    InvalidOffset(String),
}

pub type StateResult<T> = Result<T, StateError>;
