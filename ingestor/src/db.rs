use crate::errors::{Error, Result};
use crate::model::{Alert, AlertKind, AlertQuery, Device, DeviceStatus, Reading, ReadingQuery};
use crate::store::{page_bounds, AlertStore, DeviceRegistry, ReadingStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

const DEVICE_COLUMNS: &str = "device_id, farm_id, name, location, unit, alert_min_threshold, \
     alert_max_threshold, battery_level, last_communication, status";

const READING_COLUMNS: &str = "id, device_id, ts AS timestamp, value, unit, raw_payload, is_valid";

const ALERT_COLUMNS: &str = "id, device_id, reading_id, kind, severity, raised_at, message, \
     trigger_value, acknowledged, acknowledged_by, acknowledged_at, resolved, resolved_by, \
     resolved_at, resolution_notes";

pub async fn make_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

/// Postgres-backed device registry, reading store and alert store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeviceRegistry for PgStore {
    async fn find_device(&self, device_id: &str) -> Result<Option<Device>> {
        let query = format!("SELECT {} FROM devices WHERE device_id = $1", DEVICE_COLUMNS);
        let device = sqlx::query_as::<_, Device>(&query)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(device)
    }

    async fn record_communication(
        &self,
        device_id: &str,
        at: DateTime<Utc>,
        battery_level: Option<f64>,
    ) -> Result<bool> {
        // Lock the row so the previous status we return is the one we replaced.
        let query = r#"
            WITH prev AS (
                SELECT device_id, status FROM devices WHERE device_id = $1 FOR UPDATE
            )
            UPDATE devices d
            SET last_communication = $2,
                battery_level = COALESCE($3, d.battery_level),
                status = CASE WHEN d.status = 'inactive' THEN 'active'::device_status ELSE d.status END,
                updated_at = NOW()
            FROM prev
            WHERE d.device_id = prev.device_id
            RETURNING prev.status
            "#;

        let previous = sqlx::query_scalar::<_, DeviceStatus>(query)
            .bind(device_id)
            .bind(at)
            .bind(battery_level)
            .fetch_optional(&self.pool)
            .await?;

        Ok(previous == Some(DeviceStatus::Inactive))
    }

    async fn silent_devices(&self, cutoff: DateTime<Utc>) -> Result<Vec<Device>> {
        let query = format!(
            "SELECT {} FROM devices WHERE status = 'active' AND last_communication < $1 \
             ORDER BY last_communication",
            DEVICE_COLUMNS
        );
        let devices = sqlx::query_as::<_, Device>(&query)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
        Ok(devices)
    }

    async fn mark_inactive_if_silent(
        &self,
        device_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE devices
            SET status = 'inactive', updated_at = NOW()
            WHERE device_id = $1 AND status = 'active' AND last_communication < $2
            "#,
        )
        .bind(device_id)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl ReadingStore for PgStore {
    async fn insert_reading(&self, reading: &Reading) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO readings (id, device_id, ts, value, unit, raw_payload, is_valid)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(reading.id)
        .bind(&reading.device_id)
        .bind(reading.timestamp)
        .bind(reading.value)
        .bind(&reading.unit)
        .bind(&reading.raw_payload)
        .bind(reading.is_valid)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn recent_valid_readings(
        &self,
        device_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reading>> {
        let query = format!(
            "SELECT {} FROM readings WHERE device_id = $1 AND is_valid AND ts >= $2 \
             ORDER BY ts DESC LIMIT {}",
            READING_COLUMNS, limit
        );
        let readings = sqlx::query_as::<_, Reading>(&query)
            .bind(device_id)
            .bind(since)
            .fetch_all(&self.pool)
            .await?;
        Ok(readings)
    }

    async fn list_readings(&self, params: &ReadingQuery) -> Result<Vec<Reading>> {
        let (limit, offset) = page_bounds(params.limit, params.offset);

        let query = format!(
            "SELECT {} FROM readings {} ORDER BY ts DESC LIMIT {} OFFSET {}",
            READING_COLUMNS,
            reading_filter(params),
            limit,
            offset
        );

        let mut query_builder = sqlx::query_as::<_, Reading>(&query);
        if let Some(device_id) = &params.device_id {
            query_builder = query_builder.bind(device_id);
        }
        if let Some(start) = &params.start {
            query_builder = query_builder.bind(start);
        }
        if let Some(end) = &params.end {
            query_builder = query_builder.bind(end);
        }

        Ok(query_builder.fetch_all(&self.pool).await?)
    }

    async fn count_readings(&self, params: &ReadingQuery) -> Result<usize> {
        let query = format!("SELECT COUNT(*) FROM readings {}", reading_filter(params));

        let mut query_builder = sqlx::query_scalar::<_, i64>(&query);
        if let Some(device_id) = &params.device_id {
            query_builder = query_builder.bind(device_id);
        }
        if let Some(start) = &params.start {
            query_builder = query_builder.bind(start);
        }
        if let Some(end) = &params.end {
            query_builder = query_builder.bind(end);
        }

        let total = query_builder.fetch_one(&self.pool).await?;
        Ok(total.max(0) as usize)
    }
}

/// WHERE clause for a readings query; placeholders follow the order
/// device_id, start, end for whichever filters are set.
fn reading_filter(params: &ReadingQuery) -> String {
    let mut conditions = Vec::new();
    let mut placeholder = 0;
    if params.device_id.is_some() {
        placeholder += 1;
        conditions.push(format!("device_id = ${}", placeholder));
    }
    if params.start.is_some() {
        placeholder += 1;
        conditions.push(format!("ts >= ${}", placeholder));
    }
    if params.end.is_some() {
        placeholder += 1;
        conditions.push(format!("ts <= ${}", placeholder));
    }

    if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    }
}

fn alert_filter(params: &AlertQuery) -> String {
    let mut conditions = Vec::new();
    if params.device_id.is_some() {
        conditions.push("device_id = $1");
    }
    if params.unresolved == Some(true) {
        conditions.push("NOT resolved");
    }

    if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    }
}

#[async_trait]
impl AlertStore for PgStore {
    async fn insert_alert(&self, alert: &Alert) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO alerts (id, device_id, reading_id, kind, severity, raised_at, message, trigger_value)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(alert.id)
        .bind(&alert.device_id)
        .bind(alert.reading_id)
        .bind(alert.kind)
        .bind(alert.severity)
        .bind(alert.raised_at)
        .bind(&alert.message)
        .bind(alert.trigger_value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn has_unresolved(&self, device_id: &str, kind: AlertKind) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM alerts WHERE device_id = $1 AND kind = $2 AND NOT resolved)",
        )
        .bind(device_id)
        .bind(kind)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn resolve_open(
        &self,
        device_id: &str,
        kind: AlertKind,
        actor: &str,
        notes: &str,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE alerts
            SET resolved = TRUE, resolved_by = $3, resolution_notes = $4, resolved_at = $5
            WHERE device_id = $1 AND kind = $2 AND NOT resolved
            "#,
        )
        .bind(device_id)
        .bind(kind)
        .bind(actor)
        .bind(notes)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn list_alerts(&self, params: &AlertQuery) -> Result<Vec<Alert>> {
        let (limit, offset) = page_bounds(params.limit, params.offset);

        let query = format!(
            "SELECT {} FROM alerts {} ORDER BY raised_at DESC LIMIT {} OFFSET {}",
            ALERT_COLUMNS,
            alert_filter(params),
            limit,
            offset
        );

        let mut query_builder = sqlx::query_as::<_, Alert>(&query);
        if let Some(device_id) = &params.device_id {
            query_builder = query_builder.bind(device_id);
        }

        Ok(query_builder.fetch_all(&self.pool).await?)
    }

    async fn count_alerts(&self, params: &AlertQuery) -> Result<usize> {
        let query = format!("SELECT COUNT(*) FROM alerts {}", alert_filter(params));

        let mut query_builder = sqlx::query_scalar::<_, i64>(&query);
        if let Some(device_id) = &params.device_id {
            query_builder = query_builder.bind(device_id);
        }

        let total = query_builder.fetch_one(&self.pool).await?;
        Ok(total.max(0) as usize)
    }

    async fn acknowledge(
        &self,
        id: Uuid,
        actor: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Alert>> {
        sqlx::query(
            r#"
            UPDATE alerts
            SET acknowledged = TRUE, acknowledged_by = $2, acknowledged_at = $3
            WHERE id = $1 AND NOT acknowledged
            "#,
        )
        .bind(id)
        .bind(actor)
        .bind(at)
        .execute(&self.pool)
        .await?;

        self.find_alert(id).await
    }

    async fn resolve(
        &self,
        id: Uuid,
        actor: &str,
        notes: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Option<Alert>> {
        sqlx::query(
            r#"
            UPDATE alerts
            SET resolved = TRUE, resolved_by = $2, resolution_notes = $3, resolved_at = $4
            WHERE id = $1 AND NOT resolved
            "#,
        )
        .bind(id)
        .bind(actor)
        .bind(notes)
        .bind(at)
        .execute(&self.pool)
        .await?;

        self.find_alert(id).await
    }
}

impl PgStore {
    async fn find_alert(&self, id: Uuid) -> Result<Option<Alert>> {
        let query = format!("SELECT {} FROM alerts WHERE id = $1", ALERT_COLUMNS);
        let alert = sqlx::query_as::<_, Alert>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(alert)
    }
}

/// Whether a store failure looks like a connectivity problem rather than a
/// rejected write.
pub fn is_transient(err: &Error) -> bool {
    match err {
        Error::Database(db_err) => is_transient_error(db_err),
        _ => false,
    }
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            // Check if it's a connection-related error
            db_err.code().is_some_and(|code| {
                code == "08000" || // connection_exception
                code == "08003" || // connection_does_not_exist
                code == "08006" || // connection_failure
                code == "57P03" || // cannot_connect_now
                code == "53300" // too_many_connections
            })
        }
        _ => false,
    }
}
