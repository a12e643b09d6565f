//! Persistence layer modules.

pub mod db;
pub mod session_index;

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;
