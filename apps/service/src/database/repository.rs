use anyhow::{Result, anyhow};
use async_trait::async_trait;
use libsql::params::Params;
use libsql::{Connection, Row, Value, params};
use std::time::SystemTime;
use tracing::debug;
use uuid::Uuid;

use super::models::{Incident, Monitor, from_unix_millis, to_unix_millis};
use crate::monitoring::types::{Heartbeat, MonitorId, MonitorStatus, MonitorType};
use crate::pool::{LibsqlManager, LibsqlPool};

/// Database trait for abstracting database operations
#[async_trait]
pub trait Database: Send + Sync {
    /// Insert a monitor and return its row id
    async fn insert_monitor(&self, monitor: &Monitor) -> Result<MonitorId>;

    async fn get_monitor(&self, id: MonitorId) -> Result<Option<Monitor>>;

    /// All monitors with `active = 1`
    async fn get_active_monitors(&self) -> Result<Vec<Monitor>>;

    async fn get_monitor_by_push_token(&self, token: &str) -> Result<Option<Monitor>>;

    /// Direct children of a group monitor
    async fn get_children(&self, parent_id: MonitorId) -> Result<Vec<Monitor>>;

    async fn set_monitor_active(&self, id: MonitorId, active: bool) -> Result<()>;

    async fn set_monitor_incident(&self, id: MonitorId, incident_id: Option<&str>) -> Result<()>;

    async fn set_manual_status(&self, id: MonitorId, status: Option<MonitorStatus>) -> Result<()>;

    /// Delete a monitor with its tags and group links. Heartbeats are kept.
    async fn delete_monitor(&self, id: MonitorId) -> Result<()>;

    async fn save_monitor_tag(&self, monitor_id: MonitorId, name: &str, value: &str) -> Result<()>;

    async fn get_monitor_tag(&self, monitor_id: MonitorId, name: &str) -> Result<Option<String>>;

    async fn save_heartbeat(&self, heartbeat: &Heartbeat) -> Result<i64>;

    async fn latest_heartbeat(&self, monitor_id: MonitorId) -> Result<Option<Heartbeat>>;

    /// Newest first
    async fn recent_heartbeats(&self, monitor_id: MonitorId, limit: usize) -> Result<Vec<Heartbeat>>;

    async fn create_status_group(&self, name: &str, status_page_id: Option<i64>) -> Result<i64>;

    async fn add_monitor_to_group(&self, monitor_id: MonitorId, group_id: i64) -> Result<()>;

    /// Status pages the monitor is shown on, through its groups
    async fn monitor_status_pages(&self, monitor_id: MonitorId) -> Result<Vec<i64>>;

    async fn insert_incident(&self, incident: &Incident) -> Result<i64>;

    /// Close every local row of an external incident and clear the monitor's
    /// reference to it, in one transaction. The reference is only cleared
    /// while it still points at `incident_id`. Returns incident rows changed.
    async fn resolve_monitor_incident(&self, monitor_id: MonitorId, incident_id: &str) -> Result<u64>;

    async fn touch_incident(&self, incident_id: &str) -> Result<()>;

    async fn incidents_by_external_id(&self, incident_id: &str) -> Result<Vec<Incident>>;

    /// Newest open incident for the monitor, matching either its own rows or
    /// legacy rows attached only to one of its status pages
    async fn find_open_incident(&self, monitor_id: MonitorId) -> Result<Option<String>>;

    async fn open_incidents_for_monitor(&self, monitor_id: MonitorId) -> Result<Vec<Incident>>;
}

const MONITOR_COLUMNS: &str = "id, uuid, owner_id, name, monitor_type, target, interval_seconds, \
    retry_interval_seconds, max_retries, resend_interval, timeout_seconds, active, parent_id, \
    incident_id, push_token, accepted_status_codes, keyword, manual_status, created_at, updated_at";

const HEARTBEAT_COLUMNS: &str =
    "id, monitor_id, timestamp, status, duration_ms, message, important, retries";

const INCIDENT_COLUMNS: &str = "id, incident_id, monitor_id, status_page_id, title, content, \
    style, pin, active, created_at, last_updated_at";

fn monitor_from_row(row: &Row) -> Result<Monitor> {
    let uuid_str: String = row.get(1)?;
    let type_str: String = row.get(4)?;
    let codes_json: String = row.get(15)?;
    let manual_status: Option<String> = row.get(17)?;

    Ok(Monitor {
        id: row.get(0)?,
        uuid: Uuid::parse_str(&uuid_str)?,
        owner_id: row.get(2)?,
        name: row.get(3)?,
        monitor_type: type_str.parse::<MonitorType>()?,
        target: row.get(5)?,
        interval_seconds: row.get::<i64>(6)? as u64,
        retry_interval_seconds: row.get::<i64>(7)? as u64,
        max_retries: row.get::<i64>(8)? as u32,
        resend_interval: row.get::<i64>(9)? as u32,
        timeout_seconds: row.get::<i64>(10)? as u64,
        active: row.get::<i64>(11)? != 0,
        parent_id: row.get(12)?,
        incident_id: row.get(13)?,
        push_token: row.get(14)?,
        accepted_status_codes: serde_json::from_str(&codes_json)?,
        keyword: row.get(16)?,
        manual_status: manual_status.map(|s| s.parse::<MonitorStatus>()).transpose()?,
        created_at: from_unix_millis(row.get(18)?),
        updated_at: from_unix_millis(row.get(19)?),
    })
}

fn heartbeat_from_row(row: &Row) -> Result<Heartbeat> {
    let status_str: String = row.get(3)?;

    Ok(Heartbeat {
        id: Some(row.get(0)?),
        monitor_id: row.get(1)?,
        timestamp: from_unix_millis(row.get(2)?),
        status: status_str.parse::<MonitorStatus>()?,
        duration_ms: row.get::<Option<i64>>(4)?.map(|v| v as u64),
        message: row.get(5)?,
        important: row.get::<i64>(6)? != 0,
        retries: row.get::<i64>(7)? as u32,
    })
}

fn incident_from_row(row: &Row) -> Result<Incident> {
    Ok(Incident {
        id: Some(row.get(0)?),
        incident_id: row.get(1)?,
        monitor_id: row.get(2)?,
        status_page_id: row.get(3)?,
        title: row.get(4)?,
        content: row.get(5)?,
        style: row.get(6)?,
        pin: row.get::<i64>(7)? != 0,
        active: row.get::<i64>(8)? != 0,
        created_at: from_unix_millis(row.get(9)?),
        last_updated_at: row.get::<Option<i64>>(10)?.map(from_unix_millis),
    })
}

/// Id of the row just inserted on `conn`.
///
/// Some drivers do not report the rowid synchronously; in that case the row is
/// looked up again by the caller-supplied uniqueness criteria.
async fn inserted_id(
    conn: &Connection,
    table: &'static str,
    criteria: Vec<(&'static str, Value)>,
) -> Result<i64> {
    let id = conn.last_insert_rowid();
    if id > 0 {
        return Ok(id);
    }

    debug!(table, "Row id not reported after insert, querying it back");

    let where_clause = criteria
        .iter()
        .map(|(column, _)| format!("{column} = ?"))
        .collect::<Vec<_>>()
        .join(" AND ");
    let sql = if where_clause.is_empty() {
        format!("SELECT id FROM {table} ORDER BY id DESC LIMIT 1")
    } else {
        format!("SELECT id FROM {table} WHERE {where_clause} ORDER BY id DESC LIMIT 1")
    };
    let values = criteria.into_iter().map(|(_, value)| value).collect();

    let mut rows = conn.query(&sql, Params::Positional(values)).await?;
    match rows.next().await? {
        Some(row) => Ok(row.get(0)?),
        None => Err(anyhow!("Failed to store {table} - could not retrieve id from database")),
    }
}

fn now_millis() -> i64 {
    to_unix_millis(SystemTime::now())
}

/// LibSQL database implementation
pub struct DatabaseImpl {
    pool: LibsqlPool,
}

impl DatabaseImpl {
    pub fn new_from_pool(pool: LibsqlPool) -> Self {
        Self { pool }
    }

    async fn get_conn(&self) -> Result<deadpool::managed::Object<LibsqlManager>> {
        Ok(self.pool.get().await?)
    }

    async fn query_monitors(&self, sql: &str, params: impl libsql::params::IntoParams) -> Result<Vec<Monitor>> {
        let conn = self.get_conn().await?;
        let mut rows = conn.query(sql, params).await?;
        let mut monitors = Vec::new();

        while let Some(row) = rows.next().await? {
            monitors.push(monitor_from_row(&row)?);
        }

        Ok(monitors)
    }

    async fn query_incidents(&self, sql: &str, params: impl libsql::params::IntoParams) -> Result<Vec<Incident>> {
        let conn = self.get_conn().await?;
        let mut rows = conn.query(sql, params).await?;
        let mut incidents = Vec::new();

        while let Some(row) = rows.next().await? {
            incidents.push(incident_from_row(&row)?);
        }

        Ok(incidents)
    }
}

#[async_trait]
impl Database for DatabaseImpl {
    async fn insert_monitor(&self, monitor: &Monitor) -> Result<MonitorId> {
        let conn = self.get_conn().await?;
        let codes_json = serde_json::to_string(&monitor.accepted_status_codes)?;

        conn.execute(
            "INSERT INTO monitors (uuid, owner_id, name, monitor_type, target, interval_seconds, \
             retry_interval_seconds, max_retries, resend_interval, timeout_seconds, active, parent_id, \
             incident_id, push_token, accepted_status_codes, keyword, manual_status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                monitor.uuid.to_string(),
                monitor.owner_id,
                monitor.name.clone(),
                monitor.monitor_type.as_str(),
                monitor.target.clone(),
                monitor.interval_seconds as i64,
                monitor.retry_interval_seconds as i64,
                monitor.max_retries as i64,
                monitor.resend_interval as i64,
                monitor.timeout_seconds as i64,
                if monitor.active { 1 } else { 0 },
                monitor.parent_id,
                monitor.incident_id.clone(),
                monitor.push_token.clone(),
                codes_json,
                monitor.keyword.clone(),
                monitor.manual_status.map(|s| s.as_str()),
                to_unix_millis(monitor.created_at),
                to_unix_millis(monitor.updated_at)
            ],
        )
        .await?;

        inserted_id(&conn, "monitors", vec![("uuid", Value::Text(monitor.uuid.to_string()))]).await
    }

    async fn get_monitor(&self, id: MonitorId) -> Result<Option<Monitor>> {
        let sql = format!("SELECT {MONITOR_COLUMNS} FROM monitors WHERE id = ?");
        Ok(self.query_monitors(&sql, params![id]).await?.into_iter().next())
    }

    async fn get_active_monitors(&self) -> Result<Vec<Monitor>> {
        let sql = format!("SELECT {MONITOR_COLUMNS} FROM monitors WHERE active = 1 ORDER BY id");
        self.query_monitors(&sql, ()).await
    }

    async fn get_monitor_by_push_token(&self, token: &str) -> Result<Option<Monitor>> {
        let sql = format!("SELECT {MONITOR_COLUMNS} FROM monitors WHERE push_token = ?");
        Ok(self.query_monitors(&sql, params![token]).await?.into_iter().next())
    }

    async fn get_children(&self, parent_id: MonitorId) -> Result<Vec<Monitor>> {
        let sql = format!("SELECT {MONITOR_COLUMNS} FROM monitors WHERE parent_id = ? ORDER BY id");
        self.query_monitors(&sql, params![parent_id]).await
    }

    async fn set_monitor_active(&self, id: MonitorId, active: bool) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "UPDATE monitors SET active = ?, updated_at = ? WHERE id = ?",
            params![if active { 1 } else { 0 }, now_millis(), id],
        )
        .await?;
        Ok(())
    }

    async fn set_monitor_incident(&self, id: MonitorId, incident_id: Option<&str>) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "UPDATE monitors SET incident_id = ? WHERE id = ?",
            params![incident_id.map(str::to_string), id],
        )
        .await?;
        Ok(())
    }

    async fn set_manual_status(&self, id: MonitorId, status: Option<MonitorStatus>) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "UPDATE monitors SET manual_status = ?, updated_at = ? WHERE id = ?",
            params![status.map(|s| s.as_str()), now_millis(), id],
        )
        .await?;
        Ok(())
    }

    async fn delete_monitor(&self, id: MonitorId) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute("DELETE FROM monitor_tags WHERE monitor_id = ?", params![id]).await?;
        conn.execute("DELETE FROM monitor_status_groups WHERE monitor_id = ?", params![id]).await?;
        conn.execute("DELETE FROM monitors WHERE id = ?", params![id]).await?;
        Ok(())
    }

    async fn save_monitor_tag(&self, monitor_id: MonitorId, name: &str, value: &str) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT OR REPLACE INTO monitor_tags (monitor_id, name, value) VALUES (?, ?, ?)",
            params![monitor_id, name, value],
        )
        .await?;
        Ok(())
    }

    async fn get_monitor_tag(&self, monitor_id: MonitorId, name: &str) -> Result<Option<String>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT value FROM monitor_tags WHERE monitor_id = ? AND name = ?",
                params![monitor_id, name],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    async fn save_heartbeat(&self, heartbeat: &Heartbeat) -> Result<i64> {
        let conn = self.get_conn().await?;
        let timestamp = to_unix_millis(heartbeat.timestamp);

        conn.execute(
            "INSERT INTO heartbeats (monitor_id, timestamp, status, duration_ms, message, important, retries) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                heartbeat.monitor_id,
                timestamp,
                heartbeat.status.as_str(),
                heartbeat.duration_ms.map(|v| v as i64),
                heartbeat.message.clone(),
                if heartbeat.important { 1 } else { 0 },
                heartbeat.retries as i64
            ],
        )
        .await?;

        inserted_id(
            &conn,
            "heartbeats",
            vec![
                ("monitor_id", Value::Integer(heartbeat.monitor_id)),
                ("timestamp", Value::Integer(timestamp)),
            ],
        )
        .await
    }

    async fn latest_heartbeat(&self, monitor_id: MonitorId) -> Result<Option<Heartbeat>> {
        Ok(self.recent_heartbeats(monitor_id, 1).await?.into_iter().next())
    }

    async fn recent_heartbeats(&self, monitor_id: MonitorId, limit: usize) -> Result<Vec<Heartbeat>> {
        let conn = self.get_conn().await?;
        let sql = format!(
            "SELECT {HEARTBEAT_COLUMNS} FROM heartbeats WHERE monitor_id = ? ORDER BY id DESC LIMIT ?"
        );
        let mut rows = conn.query(&sql, params![monitor_id, limit as i64]).await?;
        let mut heartbeats = Vec::new();

        while let Some(row) = rows.next().await? {
            heartbeats.push(heartbeat_from_row(&row)?);
        }

        Ok(heartbeats)
    }

    async fn create_status_group(&self, name: &str, status_page_id: Option<i64>) -> Result<i64> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO status_groups (name, status_page_id) VALUES (?, ?)",
            params![name, status_page_id],
        )
        .await?;

        inserted_id(&conn, "status_groups", vec![("name", Value::Text(name.to_string()))]).await
    }

    async fn add_monitor_to_group(&self, monitor_id: MonitorId, group_id: i64) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT OR IGNORE INTO monitor_status_groups (monitor_id, group_id) VALUES (?, ?)",
            params![monitor_id, group_id],
        )
        .await?;
        Ok(())
    }

    async fn monitor_status_pages(&self, monitor_id: MonitorId) -> Result<Vec<i64>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT DISTINCT g.status_page_id FROM monitor_status_groups mg \
                 JOIN status_groups g ON g.id = mg.group_id \
                 WHERE mg.monitor_id = ? AND g.status_page_id > 0 \
                 ORDER BY g.status_page_id",
                params![monitor_id],
            )
            .await?;
        let mut pages = Vec::new();

        while let Some(row) = rows.next().await? {
            pages.push(row.get(0)?);
        }

        Ok(pages)
    }

    async fn insert_incident(&self, incident: &Incident) -> Result<i64> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO incidents (incident_id, monitor_id, status_page_id, title, content, style, \
             pin, active, created_at, last_updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                incident.incident_id.clone(),
                incident.monitor_id,
                incident.status_page_id,
                incident.title.clone(),
                incident.content.clone(),
                incident.style.clone(),
                if incident.pin { 1 } else { 0 },
                if incident.active { 1 } else { 0 },
                to_unix_millis(incident.created_at),
                incident.last_updated_at.map(to_unix_millis)
            ],
        )
        .await?;

        inserted_id(&conn, "incidents", vec![("incident_id", Value::Text(incident.incident_id.clone()))])
            .await
    }

    async fn resolve_monitor_incident(&self, monitor_id: MonitorId, incident_id: &str) -> Result<u64> {
        let conn = self.get_conn().await?;
        let tx = conn.transaction().await?;

        let result: Result<u64> = async {
            let changed = tx
                .execute(
                    "UPDATE incidents SET pin = 0, active = 0, last_updated_at = ? \
                     WHERE incident_id = ? AND (pin = 1 OR active = 1)",
                    params![now_millis(), incident_id],
                )
                .await?;
            tx.execute(
                "UPDATE monitors SET incident_id = NULL WHERE id = ? AND incident_id = ?",
                params![monitor_id, incident_id],
            )
            .await?;
            Ok(changed)
        }
        .await;

        match result {
            Ok(changed) => {
                tx.commit().await?;
                Ok(changed)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    debug!(monitor_id, error = %rollback, "Rollback after failed incident resolution failed");
                }
                Err(e)
            }
        }
    }

    async fn touch_incident(&self, incident_id: &str) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "UPDATE incidents SET last_updated_at = ? WHERE incident_id = ? AND active = 1",
            params![now_millis(), incident_id],
        )
        .await?;
        Ok(())
    }

    async fn incidents_by_external_id(&self, incident_id: &str) -> Result<Vec<Incident>> {
        let sql = format!("SELECT {INCIDENT_COLUMNS} FROM incidents WHERE incident_id = ? ORDER BY id");
        self.query_incidents(&sql, params![incident_id]).await
    }

    async fn find_open_incident(&self, monitor_id: MonitorId) -> Result<Option<String>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT incident_id FROM incidents \
                 WHERE active = 1 AND pin = 1 AND ( \
                     monitor_id = ?1 \
                     OR (monitor_id IS NULL AND status_page_id IN ( \
                         SELECT g.status_page_id FROM monitor_status_groups mg \
                         JOIN status_groups g ON g.id = mg.group_id \
                         WHERE mg.monitor_id = ?1)) \
                 ) \
                 ORDER BY id DESC LIMIT 1",
                params![monitor_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    async fn open_incidents_for_monitor(&self, monitor_id: MonitorId) -> Result<Vec<Incident>> {
        let sql = format!(
            "SELECT {INCIDENT_COLUMNS} FROM incidents \
             WHERE monitor_id = ? AND active = 1 AND pin = 1 ORDER BY id"
        );
        self.query_incidents(&sql, params![monitor_id]).await
    }
}
