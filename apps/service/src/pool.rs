use std::path::Path;

use anyhow::Result;
use deadpool::managed::{self, Pool, RecycleResult};
use libsql::{Connection, Database, Error as LibsqlError};

/// Milliseconds a connection waits on a locked database before failing
const BUSY_TIMEOUT_MS: u32 = 5_000;

pub struct LibsqlManager {
    database: Database,
}

impl LibsqlManager {
    pub fn new(database: Database) -> Self {
        Self { database }
    }
}

impl managed::Manager for LibsqlManager {
    type Type = Connection;
    type Error = LibsqlError;

    async fn create(&self) -> Result<Self::Type, Self::Error> {
        let conn = self.database.connect()?;
        // Schedulers write heartbeats concurrently; wait for the lock instead of
        // failing with SQLITE_BUSY.
        conn.query(&format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}"), ()).await?;
        Ok(conn)
    }

    async fn recycle(
        &self,
        conn: &mut Self::Type,
        _: &managed::Metrics,
    ) -> RecycleResult<Self::Error> {
        conn.query("SELECT 1", ())
            .await?
            .next()
            .await?
            .ok_or(LibsqlError::QueryReturnedNoRows)?;
        Ok(())
    }
}

pub type LibsqlPool = Pool<LibsqlManager>;

/// Open (or create) a local database file and wrap it in a pool
pub async fn open_local_pool(path: impl AsRef<Path>, max_size: usize) -> Result<LibsqlPool> {
    if let Some(parent) = path.as_ref().parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let database = libsql::Builder::new_local(path.as_ref()).build().await?;
    let pool = Pool::builder(LibsqlManager::new(database)).max_size(max_size.max(1)).build()?;
    Ok(pool)
}
