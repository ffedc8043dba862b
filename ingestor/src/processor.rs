//! The per-reading decision pipeline.
//!
//! validate -> persist -> broadcast reading -> threshold/anomaly/battery
//! rules -> raise alerts -> update device state.
//!
//! Callers must serialize calls for the same device (see `dispatch`); the
//! anomaly window handed in is owned by that device's lane.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::alerts::AlertPublisher;
use crate::config::RuleConfig;
use crate::db::is_transient;
use crate::errors::{Error, Result};
use crate::fanout::{FanOut, FarmEvent};
use crate::metrics::{
    DB_FAILURES_TOTAL, INVALID_READINGS_TOTAL, PROCESSING_LATENCY_SECONDS,
    READINGS_PERSISTED_TOTAL, UNKNOWN_DEVICE_TOTAL,
};
use crate::model::{AlertKind, Device, ProcessOutcome, Reading, ReadingEvent};
use crate::rules::{battery_alert, threshold_alert, AnomalyWindow};
use crate::store::Stores;
use crate::validate::is_within_bounds;

/// Actor recorded on alerts the pipeline resolves by itself.
pub const SYSTEM_ACTOR: &str = "system";

const RESUMED_NOTES: &str = "device resumed reporting";

pub struct Processor {
    stores: Stores,
    alerts: AlertPublisher,
    fanout: Arc<FanOut>,
    rules: RuleConfig,
}

impl Processor {
    pub fn new(stores: Stores, fanout: Arc<FanOut>, rules: RuleConfig) -> Self {
        let alerts = AlertPublisher::new(stores.alerts.clone(), fanout.clone());
        Self {
            stores,
            alerts,
            fanout,
            rules,
        }
    }

    pub fn alert_publisher(&self) -> AlertPublisher {
        self.alerts.clone()
    }

    /// Resolves the device, seeds its anomaly window on first use and runs
    /// the reading through the pipeline.
    pub async fn handle(
        &self,
        event: ReadingEvent,
        window: &mut Option<AnomalyWindow>,
    ) -> Result<ProcessOutcome> {
        let start = Instant::now();
        let device = self.resolve(&event).await?;

        let mut current = match window.take() {
            Some(current) => current,
            None => self.load_window(&device.device_id).await,
        };
        let result = self.process(&device, event, &mut current).await;
        *window = Some(current);

        PROCESSING_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());
        result
    }

    /// Looks the device up by hardware id. A topic naming a different farm
    /// than the one the device belongs to counts as unknown.
    pub async fn resolve(&self, event: &ReadingEvent) -> Result<Device> {
        let found = match self.stores.devices.find_device(&event.device_id).await {
            Ok(found) => found,
            Err(e) => {
                DB_FAILURES_TOTAL.inc();
                error!("Failed to look up device {}: {}", event.device_id, e);
                return Err(e);
            }
        };

        match found {
            Some(device)
                if event
                    .farm_id
                    .as_deref()
                    .map_or(true, |farm_id| farm_id == device.farm_id) =>
            {
                Ok(device)
            }
            Some(device) => {
                UNKNOWN_DEVICE_TOTAL.inc();
                warn!(
                    "Sensor {} belongs to farm {}, not {:?}",
                    device.device_id, device.farm_id, event.farm_id
                );
                Err(Error::UnknownDevice(event.device_id.clone()))
            }
            None => {
                UNKNOWN_DEVICE_TOTAL.inc();
                Err(Error::UnknownDevice(event.device_id.clone()))
            }
        }
    }

    pub async fn process(
        &self,
        device: &Device,
        event: ReadingEvent,
        window: &mut AnomalyWindow,
    ) -> Result<ProcessOutcome> {
        let now = Utc::now();
        let ReadingEvent {
            payload,
            raw,
            received_at,
            ..
        } = event;

        let reading = Reading {
            id: Uuid::new_v4(),
            device_id: device.device_id.clone(),
            timestamp: payload.timestamp.unwrap_or(received_at),
            value: payload.value,
            unit: payload.unit.clone().or_else(|| device.unit.clone()),
            raw_payload: raw,
            is_valid: is_within_bounds(device, payload.value),
        };

        // Nothing below runs unless the reading row exists.
        if let Err(e) = self.stores.readings.insert_reading(&reading).await {
            DB_FAILURES_TOTAL.inc();
            error!(
                transient = is_transient(&e),
                "Failed to persist reading from {}: {}", device.device_id, e
            );
            return Err(e);
        }

        READINGS_PERSISTED_TOTAL.inc();
        if !reading.is_valid {
            INVALID_READINGS_TOTAL.inc();
            debug!(
                "Reading {} from {} is outside thresholds",
                reading.value, device.device_id
            );
        }

        self.fanout
            .publish(&device.farm_id, FarmEvent::sensor_data(device, &reading))
            .await;

        let mut drafts = Vec::new();
        drafts.extend(threshold_alert(device, reading.value));
        window.prune(now);
        drafts.extend(window.anomaly_alert(device, reading.value));
        window.observe(&reading);
        drafts.extend(battery_alert(device, payload.battery_level, &self.rules));

        let mut alerts = Vec::with_capacity(drafts.len());
        for draft in drafts {
            // A failed alert write is already logged and counted; the
            // reading stands regardless.
            if let Ok(alert) = self.alerts.raise(device, Some(reading.id), draft).await {
                alerts.push(alert);
            }
        }

        self.update_device_state(device, now, payload.battery_level)
            .await;

        debug!(
            "Processed sensor reading: {} = {} ({} alerts)",
            device.device_id,
            reading.value,
            alerts.len()
        );

        Ok(ProcessOutcome { reading, alerts })
    }

    async fn update_device_state(
        &self,
        device: &Device,
        now: DateTime<Utc>,
        battery_level: Option<f64>,
    ) {
        let reactivated = match self
            .stores
            .devices
            .record_communication(&device.device_id, now, battery_level)
            .await
        {
            Ok(reactivated) => reactivated,
            Err(e) => {
                DB_FAILURES_TOTAL.inc();
                error!(
                    "Failed to update device state for {}: {}",
                    device.device_id, e
                );
                return;
            }
        };

        if !reactivated {
            return;
        }

        info!("Sensor {} is reporting again, marked active", device.device_id);
        match self
            .stores
            .alerts
            .resolve_open(
                &device.device_id,
                AlertKind::Offline,
                SYSTEM_ACTOR,
                RESUMED_NOTES,
                now,
            )
            .await
        {
            Ok(0) => {}
            Ok(resolved) => info!(
                "Resolved {} offline alert(s) for {}",
                resolved, device.device_id
            ),
            Err(e) => {
                DB_FAILURES_TOTAL.inc();
                error!(
                    "Failed to resolve offline alert for {}: {}",
                    device.device_id, e
                );
            }
        }
    }

    async fn load_window(&self, device_id: &str) -> AnomalyWindow {
        let since = Utc::now() - self.rules.horizon;
        match self
            .stores
            .readings
            .recent_valid_readings(device_id, since, self.rules.window_size)
            .await
        {
            Ok(readings) => {
                debug!(
                    "Seeded anomaly window for {} with {} readings",
                    device_id,
                    readings.len()
                );
                AnomalyWindow::seeded(self.rules, &readings)
            }
            Err(e) => {
                DB_FAILURES_TOTAL.inc();
                warn!(
                    "Could not seed anomaly window for {}, starting empty: {}",
                    device_id, e
                );
                AnomalyWindow::new(self.rules)
            }
        }
    }
}
