//! Alert rules evaluated for every persisted reading.
//!
//! The rules are pure: they look at a device, a reading and the device's
//! anomaly window, and return the alerts that should be raised. Persisting
//! and broadcasting those alerts is the caller's job.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::config::RuleConfig;
use crate::model::{AlertKind, Device, Reading, Severity};

/// An alert a rule wants raised, before it has an id or a row.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertDraft {
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
    pub trigger_value: Option<f64>,
}

impl AlertDraft {
    pub fn new(device: &Device, kind: AlertKind, severity: Severity, value: Option<f64>) -> Self {
        Self {
            kind,
            severity,
            message: alert_message(device, kind, value),
            trigger_value: value,
        }
    }
}

pub fn alert_message(device: &Device, kind: AlertKind, value: Option<f64>) -> String {
    let name = &device.name;
    let location = device.location_label();
    let value = value.map(|v| v.to_string()).unwrap_or_default();

    match kind {
        AlertKind::ThresholdExceeded => {
            format!("{} at {} exceeded maximum threshold: {}", name, location, value)
        }
        AlertKind::ThresholdBelow => {
            format!("{} at {} below minimum threshold: {}", name, location, value)
        }
        AlertKind::AnomalyDetected => {
            format!("Anomaly detected in {} at {}: {}", name, location, value)
        }
        AlertKind::Offline => format!("{} at {} is offline", name, location),
        AlertKind::BatteryLow => {
            format!("{} at {} has low battery: {}%", name, location, value)
        }
    }
}

/// Strict comparison against the configured thresholds. Exceeding is checked
/// first; at most one threshold alert is produced per reading.
pub fn threshold_alert(device: &Device, value: f64) -> Option<AlertDraft> {
    if let Some(upper) = device.alert_max_threshold {
        if value > upper {
            return Some(AlertDraft::new(
                device,
                AlertKind::ThresholdExceeded,
                Severity::Warning,
                Some(value),
            ));
        }
    }

    if let Some(lower) = device.alert_min_threshold {
        if value < lower {
            return Some(AlertDraft::new(
                device,
                AlertKind::ThresholdBelow,
                Severity::Warning,
                Some(value),
            ));
        }
    }

    None
}

/// Edge-triggered: fires only when the battery drops below the threshold
/// from an unknown or healthy previous level.
pub fn battery_alert(
    device: &Device,
    battery_level: Option<f64>,
    rules: &RuleConfig,
) -> Option<AlertDraft> {
    let level = battery_level?;
    if level >= rules.battery_low_threshold {
        return None;
    }

    let was_low = device
        .battery_level
        .is_some_and(|previous| previous < rules.battery_low_threshold);
    if was_low {
        return None;
    }

    Some(AlertDraft::new(
        device,
        AlertKind::BatteryLow,
        Severity::Warning,
        Some(level),
    ))
}

/// Mean and population standard deviation of a sample.
pub fn mean_and_std_dev(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }

    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some((mean, variance.sqrt()))
}

/// |value - mean| / std_dev, defined as 0 when the window is flat.
pub fn z_score(value: f64, mean: f64, std_dev: f64) -> f64 {
    if std_dev <= f64::EPSILON {
        0.0
    } else {
        (value - mean).abs() / std_dev
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Sample {
    timestamp: DateTime<Utc>,
    value: f64,
}

/// Trailing window of a device's most recent valid readings.
///
/// Samples are kept ordered by reading timestamp, not arrival order, so a
/// late reading lands in its proper place (or falls off the back when it is
/// older than everything the window holds).
#[derive(Debug, Clone)]
pub struct AnomalyWindow {
    samples: VecDeque<Sample>,
    rules: RuleConfig,
}

impl AnomalyWindow {
    pub fn new(rules: RuleConfig) -> Self {
        Self {
            samples: VecDeque::with_capacity(rules.window_size + 1),
            rules,
        }
    }

    /// Builds a window from previously stored readings; invalid ones are
    /// skipped.
    pub fn seeded<'a>(rules: RuleConfig, readings: impl IntoIterator<Item = &'a Reading>) -> Self {
        let mut window = Self::new(rules);
        for reading in readings {
            window.observe(reading);
        }
        window
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn values(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.value).collect()
    }

    /// Drops samples older than the lookback horizon.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.rules.horizon;
        self.samples.retain(|s| s.timestamp >= cutoff);
    }

    /// Scores `value` against the window as it stands, without adding it.
    pub fn evaluate(&self, value: f64) -> Option<f64> {
        if self.samples.len() < self.rules.min_samples {
            return None;
        }

        let (mean, std_dev) = mean_and_std_dev(&self.values())?;
        Some(z_score(value, mean, std_dev))
    }

    /// Returns an anomaly alert when the reading is more than the configured
    /// number of standard deviations from the window mean.
    pub fn anomaly_alert(&self, device: &Device, value: f64) -> Option<AlertDraft> {
        let z = self.evaluate(value)?;
        if z > self.rules.z_threshold {
            Some(AlertDraft::new(
                device,
                AlertKind::AnomalyDetected,
                Severity::Critical,
                Some(value),
            ))
        } else {
            None
        }
    }

    /// Adds a reading to the window if it is valid.
    pub fn observe(&mut self, reading: &Reading) {
        if !reading.is_valid {
            return;
        }

        let sample = Sample {
            timestamp: reading.timestamp,
            value: reading.value,
        };
        let position = self
            .samples
            .partition_point(|s| s.timestamp <= sample.timestamp);
        self.samples.insert(position, sample);

        while self.samples.len() > self.rules.window_size {
            self.samples.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    fn reading(value: f64, timestamp: DateTime<Utc>, is_valid: bool) -> Reading {
        Reading {
            id: Uuid::new_v4(),
            device_id: "D".to_string(),
            timestamp,
            value,
            unit: None,
            raw_payload: serde_json::json!({ "value": value }),
            is_valid,
        }
    }

    fn window_of(values: &[f64]) -> AnomalyWindow {
        let start = Utc::now() - Duration::minutes(values.len() as i64);
        let readings: Vec<Reading> = values
            .iter()
            .enumerate()
            .map(|(i, v)| reading(*v, start + Duration::minutes(i as i64), true))
            .collect();
        AnomalyWindow::seeded(RuleConfig::default(), &readings)
    }

    #[test]
    fn test_no_thresholds_never_alert() {
        let device = Device::new("D", "farm");
        for value in [-1e12, -40.0, 0.0, 35.0, 1e12] {
            assert_eq!(threshold_alert(&device, value), None);
        }
    }

    #[test]
    fn test_threshold_strict_inequality() {
        let device = Device::new("D1", "farm").with_thresholds(Some(10.0), Some(30.0));

        assert_eq!(threshold_alert(&device, 10.0), None);
        assert_eq!(threshold_alert(&device, 30.0), None);
        assert_eq!(threshold_alert(&device, 20.0), None);

        let above = threshold_alert(&device, 35.0).unwrap();
        assert_eq!(above.kind, AlertKind::ThresholdExceeded);
        assert_eq!(above.severity, Severity::Warning);
        assert_eq!(above.trigger_value, Some(35.0));

        let below = threshold_alert(&device, 9.0).unwrap();
        assert_eq!(below.kind, AlertKind::ThresholdBelow);
        assert_eq!(below.severity, Severity::Warning);
    }

    #[test]
    fn test_zero_threshold_is_honoured() {
        let device = Device::new("D", "farm").with_thresholds(Some(0.0), None);
        let alert = threshold_alert(&device, -0.5).unwrap();
        assert_eq!(alert.kind, AlertKind::ThresholdBelow);
    }

    #[test]
    fn test_alert_messages() {
        let device = Device::new("D1", "farm").with_location("barn 1");
        assert_eq!(
            alert_message(&device, AlertKind::ThresholdExceeded, Some(35.0)),
            "D1 at barn 1 exceeded maximum threshold: 35"
        );
        assert_eq!(
            alert_message(&device, AlertKind::Offline, None),
            "D1 at barn 1 is offline"
        );
    }

    #[test]
    fn test_population_std_dev() {
        let (mean, std_dev) = mean_and_std_dev(&[20.0, 21.0, 19.0, 20.0, 22.0]).unwrap();
        assert!((mean - 20.4).abs() < 1e-9);
        assert!((std_dev - 1.04_f64.sqrt()).abs() < 1e-9);
        assert_eq!(mean_and_std_dev(&[]), None);
    }

    #[test]
    fn test_anomaly_fires_beyond_three_sigma() {
        let device = Device::new("D2", "farm");
        let window = window_of(&[20.0, 21.0, 19.0, 20.0, 22.0]);

        let z = window.evaluate(40.0).unwrap();
        assert!(z > 19.0 && z < 19.5, "z = {}", z);

        let alert = window.anomaly_alert(&device, 40.0).unwrap();
        assert_eq!(alert.kind, AlertKind::AnomalyDetected);
        assert_eq!(alert.severity, Severity::Critical);
    }

    #[test]
    fn test_anomaly_quiet_within_three_sigma() {
        let device = Device::new("D2", "farm");
        let window = window_of(&[20.0, 21.0, 19.0, 20.0, 22.0]);
        // 3 sigma is about 3.06 from the mean.
        assert_eq!(window.anomaly_alert(&device, 23.4), None);
        assert_eq!(window.anomaly_alert(&device, 17.5), None);
    }

    #[test]
    fn test_anomaly_needs_min_samples() {
        let device = Device::new("D", "farm");
        let window = window_of(&[20.0, 21.0, 19.0, 20.0]);
        assert_eq!(window.evaluate(1000.0), None);
        assert_eq!(window.anomaly_alert(&device, 1000.0), None);
    }

    #[test]
    fn test_flat_window_scores_zero() {
        let device = Device::new("D", "farm");
        let window = window_of(&[5.0; 6]);
        assert_eq!(window.evaluate(500.0), Some(0.0));
        assert_eq!(window.anomaly_alert(&device, 500.0), None);
    }

    #[test]
    fn test_window_keeps_latest_by_timestamp() {
        let now = Utc::now();
        let rules = RuleConfig {
            window_size: 3,
            ..RuleConfig::default()
        };
        let mut window = AnomalyWindow::new(rules);

        window.observe(&reading(1.0, now - Duration::minutes(3), true));
        window.observe(&reading(3.0, now - Duration::minutes(1), true));
        window.observe(&reading(2.0, now - Duration::minutes(2), true));
        assert_eq!(window.values(), vec![1.0, 2.0, 3.0]);

        // A late arrival older than everything held is evicted straight away.
        window.observe(&reading(0.0, now - Duration::minutes(10), true));
        assert_eq!(window.values(), vec![1.0, 2.0, 3.0]);

        window.observe(&reading(4.0, now, true));
        assert_eq!(window.values(), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_invalid_readings_do_not_feed_window() {
        let mut window = AnomalyWindow::new(RuleConfig::default());
        window.observe(&reading(99.0, Utc::now(), false));
        assert!(window.is_empty());
    }

    #[test]
    fn test_prune_drops_stale_samples() {
        let now = Utc::now();
        let mut window = AnomalyWindow::new(RuleConfig::default());
        window.observe(&reading(1.0, now - Duration::hours(25), true));
        window.observe(&reading(2.0, now - Duration::hours(1), true));

        window.prune(now);
        assert_eq!(window.values(), vec![2.0]);
    }

    #[test]
    fn test_battery_alert_is_edge_triggered() {
        let rules = RuleConfig::default();
        let mut device = Device::new("collar-1", "farm");

        let alert = battery_alert(&device, Some(15.0), &rules).unwrap();
        assert_eq!(alert.kind, AlertKind::BatteryLow);
        assert_eq!(alert.trigger_value, Some(15.0));

        device.battery_level = Some(15.0);
        assert_eq!(battery_alert(&device, Some(12.0), &rules), None);

        device.battery_level = Some(80.0);
        assert!(battery_alert(&device, Some(19.9), &rules).is_some());
        assert_eq!(battery_alert(&device, Some(20.0), &rules), None);
        assert_eq!(battery_alert(&device, None, &rules), None);
    }
}
