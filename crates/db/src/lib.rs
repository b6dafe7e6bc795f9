pub mod connection;
pub mod migrations;
pub mod repositories;

pub use connection::{connect, connect_with_settings, is_memory_url, ping, DbPool};
pub use repositories::{InMemoryCheckpointStore, RepositoryError, SqlCheckpointStore};
