/// Database abstraction layer
///
/// Monitors, heartbeats and the local incident mirror live in a libSQL
/// (SQLite) database behind the [`Database`] trait.

pub mod migrations;
pub mod models;
pub mod repository;

pub use repository::{Database, DatabaseImpl};

use anyhow::Result;

/// Initialize database with schema
pub async fn initialize_database(conn: &libsql::Connection) -> Result<()> {
    migrations::run_migrations(conn).await
}
