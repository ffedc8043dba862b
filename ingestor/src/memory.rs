//! In-process implementation of the store traits.
//!
//! Used by the integration tests and handy for running the pipeline without
//! a database. Writes can be made to fail on demand to exercise the
//! persistence-error paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::errors::{Error, Result};
use crate::model::{Alert, AlertKind, AlertQuery, Device, DeviceStatus, Reading, ReadingQuery};
use crate::store::{page_bounds, AlertStore, DeviceRegistry, ReadingStore};

#[derive(Default)]
pub struct MemoryStore {
    devices: RwLock<HashMap<String, Device>>,
    readings: RwLock<Vec<Reading>>,
    alerts: RwLock<Vec<Alert>>,
    fail_reading_writes: AtomicBool,
    fail_alert_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provisions (or replaces) a device.
    pub async fn insert_device(&self, device: Device) {
        self.devices
            .write()
            .await
            .insert(device.device_id.clone(), device);
    }

    pub async fn device(&self, device_id: &str) -> Option<Device> {
        self.devices.read().await.get(device_id).cloned()
    }

    pub async fn set_last_communication(&self, device_id: &str, at: DateTime<Utc>) {
        if let Some(device) = self.devices.write().await.get_mut(device_id) {
            device.last_communication = Some(at);
        }
    }

    pub async fn readings_for(&self, device_id: &str) -> Vec<Reading> {
        self.readings
            .read()
            .await
            .iter()
            .filter(|r| r.device_id == device_id)
            .cloned()
            .collect()
    }

    pub async fn alerts_for(&self, device_id: &str) -> Vec<Alert> {
        self.alerts
            .read()
            .await
            .iter()
            .filter(|a| a.device_id == device_id)
            .cloned()
            .collect()
    }

    pub fn fail_reading_writes(&self, fail: bool) {
        self.fail_reading_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_alert_writes(&self, fail: bool) {
        self.fail_alert_writes.store(fail, Ordering::SeqCst);
    }

    fn write_error() -> Error {
        Error::Database(sqlx::Error::PoolTimedOut)
    }
}

#[async_trait]
impl DeviceRegistry for MemoryStore {
    async fn find_device(&self, device_id: &str) -> Result<Option<Device>> {
        Ok(self.device(device_id).await)
    }

    async fn record_communication(
        &self,
        device_id: &str,
        at: DateTime<Utc>,
        battery_level: Option<f64>,
    ) -> Result<bool> {
        let mut devices = self.devices.write().await;
        let Some(device) = devices.get_mut(device_id) else {
            return Ok(false);
        };

        device.last_communication = Some(at);
        if battery_level.is_some() {
            device.battery_level = battery_level;
        }

        let reactivated = device.status == DeviceStatus::Inactive;
        if reactivated {
            device.status = DeviceStatus::Active;
        }
        Ok(reactivated)
    }

    async fn silent_devices(&self, cutoff: DateTime<Utc>) -> Result<Vec<Device>> {
        let mut silent: Vec<Device> = self
            .devices
            .read()
            .await
            .values()
            .filter(|d| d.status == DeviceStatus::Active)
            .filter(|d| d.last_communication.is_some_and(|at| at < cutoff))
            .cloned()
            .collect();
        silent.sort_by_key(|d| d.last_communication);
        Ok(silent)
    }

    async fn mark_inactive_if_silent(
        &self,
        device_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<bool> {
        let mut devices = self.devices.write().await;
        match devices.get_mut(device_id) {
            Some(device)
                if device.status == DeviceStatus::Active
                    && device.last_communication.is_some_and(|at| at < cutoff) =>
            {
                device.status = DeviceStatus::Inactive;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl ReadingStore for MemoryStore {
    async fn insert_reading(&self, reading: &Reading) -> Result<()> {
        if self.fail_reading_writes.load(Ordering::SeqCst) {
            return Err(Self::write_error());
        }
        self.readings.write().await.push(reading.clone());
        Ok(())
    }

    async fn recent_valid_readings(
        &self,
        device_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reading>> {
        let mut readings: Vec<Reading> = self
            .readings
            .read()
            .await
            .iter()
            .filter(|r| r.device_id == device_id && r.is_valid && r.timestamp >= since)
            .cloned()
            .collect();
        readings.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        readings.truncate(limit);
        Ok(readings)
    }

    async fn list_readings(&self, query: &ReadingQuery) -> Result<Vec<Reading>> {
        let (limit, offset) = page_bounds(query.limit, query.offset);
        let mut readings: Vec<Reading> = self
            .readings
            .read()
            .await
            .iter()
            .filter(|r| reading_matches(query, r))
            .cloned()
            .collect();
        readings.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(readings.into_iter().skip(offset).take(limit).collect())
    }

    async fn count_readings(&self, query: &ReadingQuery) -> Result<usize> {
        Ok(self
            .readings
            .read()
            .await
            .iter()
            .filter(|r| reading_matches(query, r))
            .count())
    }
}

fn reading_matches(query: &ReadingQuery, reading: &Reading) -> bool {
    query.device_id.as_ref().map_or(true, |id| &reading.device_id == id)
        && query.start.map_or(true, |start| reading.timestamp >= start)
        && query.end.map_or(true, |end| reading.timestamp <= end)
}

fn alert_matches(query: &AlertQuery, alert: &Alert) -> bool {
    query.device_id.as_ref().map_or(true, |id| &alert.device_id == id)
        && (query.unresolved != Some(true) || !alert.resolved)
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn insert_alert(&self, alert: &Alert) -> Result<()> {
        if self.fail_alert_writes.load(Ordering::SeqCst) {
            return Err(Self::write_error());
        }
        self.alerts.write().await.push(alert.clone());
        Ok(())
    }

    async fn has_unresolved(&self, device_id: &str, kind: AlertKind) -> Result<bool> {
        Ok(self
            .alerts
            .read()
            .await
            .iter()
            .any(|a| a.device_id == device_id && a.kind == kind && !a.resolved))
    }

    async fn resolve_open(
        &self,
        device_id: &str,
        kind: AlertKind,
        actor: &str,
        notes: &str,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let mut resolved = 0;
        for alert in self.alerts.write().await.iter_mut() {
            if alert.device_id == device_id && alert.kind == kind && !alert.resolved {
                alert.resolved = true;
                alert.resolved_by = Some(actor.to_string());
                alert.resolution_notes = Some(notes.to_string());
                alert.resolved_at = Some(at);
                resolved += 1;
            }
        }
        Ok(resolved)
    }

    async fn list_alerts(&self, query: &AlertQuery) -> Result<Vec<Alert>> {
        let (limit, offset) = page_bounds(query.limit, query.offset);
        let mut alerts: Vec<Alert> = self
            .alerts
            .read()
            .await
            .iter()
            .filter(|a| alert_matches(query, a))
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.raised_at.cmp(&a.raised_at));
        Ok(alerts.into_iter().skip(offset).take(limit).collect())
    }

    async fn count_alerts(&self, query: &AlertQuery) -> Result<usize> {
        Ok(self
            .alerts
            .read()
            .await
            .iter()
            .filter(|a| alert_matches(query, a))
            .count())
    }

    async fn acknowledge(
        &self,
        id: Uuid,
        actor: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Alert>> {
        let mut alerts = self.alerts.write().await;
        Ok(alerts.iter_mut().find(|a| a.id == id).map(|alert| {
            if !alert.acknowledged {
                alert.acknowledged = true;
                alert.acknowledged_by = Some(actor.to_string());
                alert.acknowledged_at = Some(at);
            }
            alert.clone()
        }))
    }

    async fn resolve(
        &self,
        id: Uuid,
        actor: &str,
        notes: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Option<Alert>> {
        let mut alerts = self.alerts.write().await;
        Ok(alerts.iter_mut().find(|a| a.id == id).map(|alert| {
            if !alert.resolved {
                alert.resolved = true;
                alert.resolved_by = Some(actor.to_string());
                alert.resolution_notes = notes.map(str::to_string);
                alert.resolved_at = Some(at);
            }
            alert.clone()
        }))
    }
}
