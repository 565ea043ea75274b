//! Session token persistence and lifecycle.

pub mod manager;
pub mod postgres;
pub mod store;

pub use manager::{SessionError, TokenLifecycleManager};
pub use postgres::PostgresTokenStore;
pub use store::{InMemoryTokenStore, TokenStore, TokenStoreError};
