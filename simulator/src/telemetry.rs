use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Body published on `farm/{farmId}/sensors/{deviceId}/data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorPayload {
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    pub battery_level: f64,
}

/// Kind of sensor a simulated device pretends to be.
#[derive(Debug, Clone, Copy)]
pub enum SensorKind {
    Temperature,
    Humidity,
    Weight,
}

impl SensorKind {
    pub fn for_index(index: usize) -> Self {
        match index % 3 {
            0 => SensorKind::Temperature,
            1 => SensorKind::Humidity,
            _ => SensorKind::Weight,
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            SensorKind::Temperature => "C",
            SensorKind::Humidity => "%",
            SensorKind::Weight => "kg",
        }
    }

    fn normal_range(&self) -> std::ops::Range<f64> {
        match self {
            SensorKind::Temperature => 18.0..24.0,
            SensorKind::Humidity => 40.0..60.0,
            SensorKind::Weight => 480.0..520.0,
        }
    }

    fn outlier_range(&self) -> std::ops::Range<f64> {
        match self {
            SensorKind::Temperature => 40.0..60.0,
            SensorKind::Humidity => 90.0..100.0,
            SensorKind::Weight => 700.0..900.0,
        }
    }
}

pub struct SimulatedDevice {
    pub device_id: String,
    pub kind: SensorKind,
    battery: f64,
}

impl SimulatedDevice {
    pub fn new(device_id: String, kind: SensorKind, rng: &mut impl Rng) -> Self {
        Self {
            device_id,
            kind,
            battery: rng.gen_range(60.0..100.0),
        }
    }

    pub fn topic(&self, farm_id: &str) -> String {
        format!("farm/{}/sensors/{}/data", farm_id, self.device_id)
    }

    /// Produces the next reading. A share of readings are outliers and the
    /// battery drains slowly, occasionally dipping into the low range.
    pub fn next_payload(&mut self, rng: &mut impl Rng, outlier_rate: f64) -> SensorPayload {
        let value = if rng.gen_bool(outlier_rate.clamp(0.0, 1.0)) {
            rng.gen_range(self.kind.outlier_range())
        } else {
            rng.gen_range(self.kind.normal_range())
        };

        self.battery -= rng.gen_range(0.0..0.05);
        if self.battery <= 0.0 || rng.gen_bool(0.001) {
            // fresh batteries
            self.battery = rng.gen_range(80.0..100.0);
        }
        let battery_level = if rng.gen_bool(0.02) {
            rng.gen_range(5.0..20.0)
        } else {
            self.battery
        };

        SensorPayload {
            value,
            unit: self.kind.unit().to_string(),
            timestamp: Utc::now(),
            battery_level: (battery_level * 10.0).round() / 10.0,
        }
    }
}
