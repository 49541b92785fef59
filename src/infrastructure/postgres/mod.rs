//! PostgreSQL connection pooling for the chat store backend.

pub mod pool;

pub use pool::{PostgresPool, PostgresPoolError};
