use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a provisioned device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "device_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Active,
    Inactive,
    Maintenance,
    Faulty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "alert_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    ThresholdExceeded,
    ThresholdBelow,
    AnomalyDetected,
    Offline,
    BatteryLow,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::ThresholdExceeded => "threshold_exceeded",
            AlertKind::ThresholdBelow => "threshold_below",
            AlertKind::AnomalyDetected => "anomaly_detected",
            AlertKind::Offline => "offline",
            AlertKind::BatteryLow => "battery_low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "alert_severity", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
    Emergency,
}

/// A field device as provisioned in the registry
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub device_id: String,
    pub farm_id: String,
    pub name: String,
    pub location: Option<String>,
    pub unit: Option<String>,
    pub alert_min_threshold: Option<f64>,
    pub alert_max_threshold: Option<f64>,
    pub battery_level: Option<f64>,
    pub last_communication: Option<DateTime<Utc>>,
    pub status: DeviceStatus,
}

impl Device {
    /// An active device with no thresholds, unit or location.
    pub fn new(device_id: impl Into<String>, farm_id: impl Into<String>) -> Self {
        let device_id = device_id.into();
        Self {
            name: device_id.clone(),
            device_id,
            farm_id: farm_id.into(),
            location: None,
            unit: None,
            alert_min_threshold: None,
            alert_max_threshold: None,
            battery_level: None,
            last_communication: None,
            status: DeviceStatus::Active,
        }
    }

    pub fn with_thresholds(mut self, lower: Option<f64>, upper: Option<f64>) -> Self {
        self.alert_min_threshold = lower;
        self.alert_max_threshold = upper;
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn location_label(&self) -> &str {
        self.location.as_deref().unwrap_or("unknown location")
    }
}

/// One persisted observation from a device
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Reading {
    pub id: Uuid,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub unit: Option<String>,
    pub raw_payload: serde_json::Value,
    pub is_valid: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Alert {
    pub id: Uuid,
    pub device_id: String,
    pub reading_id: Option<Uuid>,
    pub kind: AlertKind,
    pub severity: Severity,
    pub raised_at: DateTime<Utc>,
    pub message: String,
    pub trigger_value: Option<f64>,
    pub acknowledged: bool,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved: bool,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_notes: Option<String>,
}

impl Alert {
    pub fn new(
        device_id: impl Into<String>,
        reading_id: Option<Uuid>,
        kind: AlertKind,
        severity: Severity,
        message: String,
        trigger_value: Option<f64>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id: device_id.into(),
            reading_id,
            kind,
            severity,
            raised_at: Utc::now(),
            message,
            trigger_value,
            acknowledged: false,
            acknowledged_by: None,
            acknowledged_at: None,
            resolved: false,
            resolved_by: None,
            resolved_at: None,
            resolution_notes: None,
        }
    }
}

/// Body of a bus message on `farm/{farmId}/sensors/{deviceId}/data`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorPayload {
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, alias = "battery_level", skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<f64>,
}

/// Body of the synchronous ingress request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectReading {
    #[serde(alias = "device_id")]
    pub device_id: String,
    #[serde(flatten)]
    pub payload: SensorPayload,
}

/// A decoded message on its way from the gateway to the processing core
#[derive(Debug, Clone)]
pub struct ReadingEvent {
    /// Farm named by the bus topic; `None` for the synchronous ingress.
    pub farm_id: Option<String>,
    pub device_id: String,
    pub payload: SensorPayload,
    pub raw: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

/// Result of running one reading through the pipeline
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub reading: Reading,
    pub alerts: Vec<Alert>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReadingQuery {
    pub device_id: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertQuery {
    pub device_id: Option<String>,
    pub unresolved: Option<bool>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// REST API response wrapper
#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub data: Vec<T>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}
