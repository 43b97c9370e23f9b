//! Session history persistence.

pub mod db;
pub mod retention;
pub mod schema;
pub mod session_repo;

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;
