use leadflow_core::ports::PortError;
use thiserror::Error;

pub mod checkpoint;
pub mod memory;

pub use checkpoint::SqlCheckpointStore;
pub use memory::InMemoryCheckpointStore;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<RepositoryError> for PortError {
    fn from(value: RepositoryError) -> Self {
        match value {
            // Pool exhaustion, locks and I/O may clear up on retry.
            RepositoryError::Database(
                error @ (sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed),
            ) => PortError::Storage(error.to_string()),
            RepositoryError::Database(sqlx::Error::Database(error))
                if error.message().contains("locked") || error.message().contains("busy") =>
            {
                PortError::Storage(error.to_string())
            }
            RepositoryError::Database(error) => PortError::Rejected(error.to_string()),
            RepositoryError::Decode(message) => PortError::Decode(message),
        }
    }
}
