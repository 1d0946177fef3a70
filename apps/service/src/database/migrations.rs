use anyhow::Result;
use libsql::Connection;
use std::time::SystemTime;

use super::models::to_unix_millis;

/// Schema version - increment when making schema changes
const SCHEMA_VERSION: i32 = 3;

/// Run database migrations
///
/// Migrations are additive and recorded in `schema_migrations`, so running
/// this on every start is safe.
pub async fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL,
            description TEXT
        )",
        (),
    )
    .await?;

    let current_version = get_current_version(conn).await?;

    if current_version >= SCHEMA_VERSION {
        tracing::info!("Database schema is up to date (version {})", current_version);
        return Ok(());
    }

    tracing::info!("Running migrations from version {} to {}", current_version, SCHEMA_VERSION);

    if current_version < 1 {
        run_migration_v1(conn).await?;
        record_migration(conn, 1, "Monitors and heartbeats").await?;
    }

    if current_version < 2 {
        run_migration_v2(conn).await?;
        record_migration(conn, 2, "Incidents and monitor incident reference").await?;
    }

    if current_version < 3 {
        run_migration_v3(conn).await?;
        record_migration(conn, 3, "Status groups, monitor tags and manual status").await?;
    }

    tracing::info!("Database migrations completed successfully (now at version {})", SCHEMA_VERSION);
    Ok(())
}

async fn get_current_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn.query("SELECT MAX(version) FROM schema_migrations", ()).await?;

    if let Some(row) = rows.next().await? {
        let version: Option<i32> = row.get(0)?;
        Ok(version.unwrap_or(0))
    } else {
        Ok(0)
    }
}

async fn record_migration(conn: &Connection, version: i32, description: &str) -> Result<()> {
    let now = to_unix_millis(SystemTime::now()) / 1000;

    conn.execute(
        "INSERT INTO schema_migrations (version, applied_at, description) VALUES (?, ?, ?)",
        libsql::params![version, now, description],
    )
    .await?;

    tracing::info!("Applied migration v{}: {}", version, description);
    Ok(())
}

/// Migration v1: monitors and heartbeats
async fn run_migration_v1(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS monitors (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            uuid TEXT NOT NULL UNIQUE,
            owner_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            monitor_type TEXT NOT NULL,
            target TEXT NOT NULL DEFAULT '',
            interval_seconds INTEGER NOT NULL DEFAULT 60,
            retry_interval_seconds INTEGER NOT NULL DEFAULT 60,
            max_retries INTEGER NOT NULL DEFAULT 0,
            resend_interval INTEGER NOT NULL DEFAULT 0,
            timeout_seconds INTEGER NOT NULL DEFAULT 30,
            active INTEGER NOT NULL DEFAULT 1,
            parent_id INTEGER,
            push_token TEXT UNIQUE,
            accepted_status_codes TEXT NOT NULL DEFAULT '[\"200-299\"]',
            keyword TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS heartbeats (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            monitor_id INTEGER NOT NULL,
            timestamp INTEGER NOT NULL,
            status TEXT NOT NULL,
            duration_ms INTEGER,
            message TEXT NOT NULL DEFAULT '',
            important INTEGER NOT NULL DEFAULT 0,
            retries INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (monitor_id) REFERENCES monitors(id) ON DELETE CASCADE
        )",
        (),
    )
    .await?;

    conn.execute("CREATE INDEX IF NOT EXISTS idx_monitors_active ON monitors(active)", ()).await?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_monitors_owner ON monitors(owner_id)", ()).await?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_monitors_parent ON monitors(parent_id)", ()).await?;

    conn.execute("CREATE INDEX IF NOT EXISTS idx_heartbeats_monitor ON heartbeats(monitor_id, id DESC)", ()).await?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_heartbeats_important ON heartbeats(monitor_id, important)", ()).await?;

    Ok(())
}

/// Migration v2: local incident mirror and the monitor's open incident reference
async fn run_migration_v2(conn: &Connection) -> Result<()> {
    conn.execute("ALTER TABLE monitors ADD COLUMN incident_id TEXT DEFAULT NULL", ()).await?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS incidents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            incident_id TEXT NOT NULL,
            monitor_id INTEGER,
            status_page_id INTEGER,
            title TEXT NOT NULL,
            content TEXT NOT NULL DEFAULT '',
            style TEXT NOT NULL DEFAULT 'danger',
            pin INTEGER NOT NULL DEFAULT 1,
            active INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL,
            last_updated_at INTEGER
        )",
        (),
    )
    .await?;

    conn.execute("CREATE INDEX IF NOT EXISTS idx_incidents_incident_id ON incidents(incident_id)", ()).await?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_incidents_monitor_open ON incidents(monitor_id, active, pin)", ()).await?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_incidents_page_open ON incidents(status_page_id, active, pin)", ()).await?;

    Ok(())
}

/// Migration v3: status page groups, tags and manual monitors
async fn run_migration_v3(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS status_groups (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            status_page_id INTEGER
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS monitor_status_groups (
            monitor_id INTEGER NOT NULL,
            group_id INTEGER NOT NULL,
            PRIMARY KEY (monitor_id, group_id)
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS monitor_tags (
            monitor_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            value TEXT NOT NULL DEFAULT '',
            PRIMARY KEY (monitor_id, name)
        )",
        (),
    )
    .await?;

    conn.execute("ALTER TABLE monitors ADD COLUMN manual_status TEXT DEFAULT NULL", ()).await?;

    Ok(())
}
