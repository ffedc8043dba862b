//! Per-farm broadcast of live readings and alerts.
//!
//! Each farm gets its own `tokio::sync::broadcast` channel, created on first
//! subscription. Publishing never waits on observers: a slow observer lags
//! behind and skips what it missed, the rest are unaffected. Nothing is
//! replayed to observers that connect later.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::model::{Alert, AlertKind, Device, Reading, Severity};

/// Default per-observer buffer.
pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorDataEvent {
    pub device_id: String,
    pub location: Option<String>,
    pub value: f64,
    pub unit: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorAlertEvent {
    pub id: Uuid,
    pub device_id: String,
    pub location: Option<String>,
    pub alert_kind: AlertKind,
    pub severity: Severity,
    pub message: String,
    pub value: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// What observers of a farm receive, serialized as
/// `{"event": "sensor_data" | "sensor_alert", "data": {...}}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum FarmEvent {
    SensorData(SensorDataEvent),
    SensorAlert(SensorAlertEvent),
}

impl FarmEvent {
    pub fn sensor_data(device: &Device, reading: &Reading) -> Self {
        FarmEvent::SensorData(SensorDataEvent {
            device_id: device.device_id.clone(),
            location: device.location.clone(),
            value: reading.value,
            unit: reading.unit.clone(),
            timestamp: reading.timestamp,
        })
    }

    pub fn sensor_alert(device: &Device, alert: &Alert) -> Self {
        FarmEvent::SensorAlert(SensorAlertEvent {
            id: alert.id,
            device_id: alert.device_id.clone(),
            location: device.location.clone(),
            alert_kind: alert.kind,
            severity: alert.severity,
            message: alert.message.clone(),
            value: alert.trigger_value,
            timestamp: alert.raised_at,
        })
    }
}

pub struct FanOut {
    farms: RwLock<HashMap<String, broadcast::Sender<FarmEvent>>>,
    capacity: usize,
}

impl FanOut {
    pub fn new(capacity: usize) -> Self {
        Self {
            farms: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Registers an observer for one farm.
    pub async fn subscribe(&self, farm_id: &str) -> broadcast::Receiver<FarmEvent> {
        let mut farms = self.farms.write().await;
        farms
            .entry(farm_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Sends an event to every current observer of the farm and returns how
    /// many there were.
    pub async fn publish(&self, farm_id: &str, event: FarmEvent) -> usize {
        let delivered = {
            let farms = self.farms.read().await;
            match farms.get(farm_id) {
                Some(sender) => sender.send(event).unwrap_or(0),
                None => return 0,
            }
        };

        if delivered == 0 {
            self.prune(farm_id).await;
        }
        delivered
    }

    pub async fn observer_count(&self, farm_id: &str) -> usize {
        self.farms
            .read()
            .await
            .get(farm_id)
            .map_or(0, |sender| sender.receiver_count())
    }

    /// Drops every farm channel; observers see their stream end.
    pub async fn close_all(&self) {
        let mut farms = self.farms.write().await;
        let count = farms.len();
        farms.clear();
        tracing::info!("Closed broadcast channels for {} farms", count);
    }

    async fn prune(&self, farm_id: &str) {
        let mut farms = self.farms.write().await;
        if farms
            .get(farm_id)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            farms.remove(farm_id);
        }
    }
}

impl Default for FanOut {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
