use crate::errors::{Error, Result};
use crate::model::{Device, SensorPayload};

const BATTERY_MIN: f64 = 0.0;
const BATTERY_MAX: f64 = 100.0;
const MAX_UNIT_LEN: usize = 32;
const MAX_DEVICE_ID_LEN: usize = 128;

/// Validates a decoded sensor payload
pub fn validate_payload(payload: &SensorPayload) -> Result<()> {
    if !payload.value.is_finite() {
        return Err(Error::Validation(format!(
            "Value {} is not a finite number",
            payload.value
        )));
    }

    if let Some(battery) = payload.battery_level {
        if !(BATTERY_MIN..=BATTERY_MAX).contains(&battery) {
            return Err(Error::Validation(format!(
                "Battery {} out of range [{}, {}]",
                battery, BATTERY_MIN, BATTERY_MAX
            )));
        }
    }

    if let Some(unit) = &payload.unit {
        if unit.len() > MAX_UNIT_LEN {
            return Err(Error::Validation(format!(
                "Unit is longer than {} characters",
                MAX_UNIT_LEN
            )));
        }
    }

    Ok(())
}

/// Validates a device identifier taken from a topic or request body
pub fn validate_device_id(device_id: &str) -> Result<()> {
    if device_id.trim().is_empty() {
        return Err(Error::Validation("Device ID cannot be empty".to_string()));
    }

    if device_id.len() > MAX_DEVICE_ID_LEN {
        return Err(Error::Validation(format!(
            "Device ID is longer than {} characters",
            MAX_DEVICE_ID_LEN
        )));
    }

    Ok(())
}

/// A reading is in range when it lies within whichever thresholds the device
/// declares. A missing threshold leaves that side unbounded.
pub fn is_within_bounds(device: &Device, value: f64) -> bool {
    let above_lower = device.alert_min_threshold.map_or(true, |lower| value >= lower);
    let below_upper = device.alert_max_threshold.map_or(true, |upper| value <= upper);
    above_lower && below_upper
}
