use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("invalid stored value: {0}")]
    InvalidValue(String),
}

impl StoreError {
    pub fn invalid_value(msg: impl ToString) -> Self {
        Self::InvalidValue(msg.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
