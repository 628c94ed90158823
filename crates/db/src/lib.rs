pub mod connection;
pub mod lock;
pub mod migrations;
pub mod repositories;

pub use connection::{connect, connect_with_settings, DbPool};
pub use lock::{calendar_scope, client_scope, ScopeLock};
pub use repositories::RepositoryError;
