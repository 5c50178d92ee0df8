use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// a configured sensor: hardware address plus a human name
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorConfig {
    /// bluetooth mac address, e.g. "C4:7C:8D:6A:12:34"
    pub identifier: String,
    pub display_name: String,
}

impl SensorConfig {
    pub fn new(identifier: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            display_name: display_name.into(),
        }
    }
}

impl std::fmt::Display for SensorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.display_name, self.identifier)
    }
}

/// one successful poll of a sensor, in the units the device reports
#[derive(Clone, Debug, PartialEq)]
pub struct RawReading {
    /// when the device was read, as asserted by the source
    pub observed_at: DateTime<Utc>,
    pub firmware_version: String,
    pub battery_percent: u8,
    /// microsiemens per centimetre
    pub conductivity: u16,
    pub light_lux: u32,
    pub moisture_percent: u8,
    pub temperature_celsius: f64,
}

/// public per-sensor view served over http
///
/// measurement fields are zero unless the cached reading is fresh.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorSnapshot {
    pub identifier: String,
    pub display_name: String,
    pub firmware_version: String,
    pub up: bool,
    pub observed_at_unix: i64,
    pub battery_percent: f64,
    pub conductivity_siemens_per_meter: f64,
    pub light_lux: f64,
    pub moisture_percent: f64,
    pub temperature_celsius: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_serializes_with_public_field_names() {
        let snapshot = SensorSnapshot {
            identifier: "C4:7C:8D:6A:12:34".to_string(),
            display_name: "basil".to_string(),
            up: true,
            ..Default::default()
        };

        let value = serde_json::to_value(&snapshot).unwrap();
        let obj = value.as_object().unwrap();

        for key in [
            "identifier",
            "displayName",
            "firmwareVersion",
            "up",
            "observedAtUnix",
            "batteryPercent",
            "conductivitySiemensPerMeter",
            "lightLux",
            "moisturePercent",
            "temperatureCelsius",
        ] {
            assert!(obj.contains_key(key), "missing field {key}");
        }
        assert_eq!(obj.len(), 10);
        assert_eq!(value["displayName"], "basil");
    }
}
