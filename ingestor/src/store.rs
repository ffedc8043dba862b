//! Narrow interfaces onto the durable store.
//!
//! The processing core and the liveness monitor only ever talk to these
//! traits; `db::PgStore` backs them with Postgres in production and
//! `memory::MemoryStore` backs them in tests.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::Result;
use crate::model::{Alert, AlertKind, AlertQuery, Device, Reading, ReadingQuery};

pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const MAX_PAGE_SIZE: usize = 1000;

/// Source of device configuration and sink for device state.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn find_device(&self, device_id: &str) -> Result<Option<Device>>;

    /// Stamps the device as heard from, updating the battery level when one
    /// is given. An `inactive` device is flipped back to `active`; returns
    /// `true` when that happened.
    async fn record_communication(
        &self,
        device_id: &str,
        at: DateTime<Utc>,
        battery_level: Option<f64>,
    ) -> Result<bool>;

    /// Active devices whose last communication is older than `cutoff`.
    async fn silent_devices(&self, cutoff: DateTime<Utc>) -> Result<Vec<Device>>;

    /// Flips an active device to inactive, but only if it is still silent
    /// as of `cutoff`. Returns `false` if the device reported in meanwhile.
    async fn mark_inactive_if_silent(&self, device_id: &str, cutoff: DateTime<Utc>)
        -> Result<bool>;
}

#[async_trait]
pub trait ReadingStore: Send + Sync {
    async fn insert_reading(&self, reading: &Reading) -> Result<()>;

    /// Most recent valid readings at or after `since`, newest first.
    async fn recent_valid_readings(
        &self,
        device_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reading>>;

    /// One page of readings matching the query, newest first.
    async fn list_readings(&self, query: &ReadingQuery) -> Result<Vec<Reading>>;

    /// Number of readings matching the query's filters, ignoring paging.
    async fn count_readings(&self, query: &ReadingQuery) -> Result<usize>;
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn insert_alert(&self, alert: &Alert) -> Result<()>;

    async fn has_unresolved(&self, device_id: &str, kind: AlertKind) -> Result<bool>;

    /// Resolves every open alert of `kind` for the device; returns how many.
    async fn resolve_open(
        &self,
        device_id: &str,
        kind: AlertKind,
        actor: &str,
        notes: &str,
        at: DateTime<Utc>,
    ) -> Result<u64>;

    async fn list_alerts(&self, query: &AlertQuery) -> Result<Vec<Alert>>;

    async fn count_alerts(&self, query: &AlertQuery) -> Result<usize>;

    async fn acknowledge(&self, id: Uuid, actor: &str, at: DateTime<Utc>)
        -> Result<Option<Alert>>;

    async fn resolve(
        &self,
        id: Uuid,
        actor: &str,
        notes: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Option<Alert>>;
}

/// Handles to the three collections, shared by every component.
#[derive(Clone)]
pub struct Stores {
    pub devices: Arc<dyn DeviceRegistry>,
    pub readings: Arc<dyn ReadingStore>,
    pub alerts: Arc<dyn AlertStore>,
}

impl Stores {
    /// Uses one backend for all three collections.
    pub fn from_backend<S>(backend: Arc<S>) -> Self
    where
        S: DeviceRegistry + ReadingStore + AlertStore + 'static,
    {
        Self {
            devices: backend.clone(),
            readings: backend.clone(),
            alerts: backend,
        }
    }
}

pub fn page_bounds(limit: Option<usize>, offset: Option<usize>) -> (usize, usize) {
    let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    (limit, offset.unwrap_or(0))
}
