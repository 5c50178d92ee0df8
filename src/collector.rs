//! ==============================================================================
//! collector.rs - cached readings -> public sensor snapshots
//! ==============================================================================
//!
//! purpose:
//!     turns whatever the updater has cached into one `SensorSnapshot` per
//!     configured sensor, in registration order. never does i/o and never
//!     fails: absence and staleness are reported as data.
//!
//! snapshot shapes:
//!
//!     never read        up=false  version/timestamp empty  metrics zero
//!     read, stale       up=true   version/timestamp set    metrics zero
//!     read, fresh       up=true   version/timestamp set    metrics set
//!
//! ==============================================================================

use crate::domain::{RawReading, SensorConfig, SensorSnapshot};
use crate::updater::Updater;

use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;

/// uS/cm -> S/m
pub const CONDUCTIVITY_FACTOR: f64 = 0.0001;

#[derive(Clone)]
pub struct Collector {
    updater: Arc<Updater>,
    sensors: Vec<SensorConfig>,
    stale_after: TimeDelta,
}

impl Collector {
    pub fn new(updater: Arc<Updater>, stale_after: TimeDelta) -> Self {
        let sensors = updater.sensors().to_vec();
        Self {
            updater,
            sensors,
            stale_after,
        }
    }

    pub async fn snapshot(&self, now: DateTime<Utc>) -> Vec<SensorSnapshot> {
        let mut results = Vec::with_capacity(self.sensors.len());

        for sensor in &self.sensors {
            let reading = self.updater.read(&sensor.identifier).await;
            results.push(self.to_snapshot(sensor, reading.as_ref(), now));
        }

        results
    }

    fn to_snapshot(
        &self,
        sensor: &SensorConfig,
        reading: Option<&RawReading>,
        now: DateTime<Utc>,
    ) -> SensorSnapshot {
        let mut snapshot = SensorSnapshot {
            identifier: sensor.identifier.clone(),
            display_name: sensor.display_name.clone(),
            ..Default::default()
        };

        let Some(reading) = reading else {
            return snapshot;
        };

        snapshot.up = true;
        snapshot.firmware_version = reading.firmware_version.clone();
        snapshot.observed_at_unix = reading.observed_at.timestamp();

        let age = now - reading.observed_at;
        if age >= self.stale_after {
            tracing::debug!(sensor = %sensor, age_secs = age.num_seconds(), "data is stale");
            return snapshot;
        }

        snapshot.battery_percent = f64::from(reading.battery_percent);
        snapshot.conductivity_siemens_per_meter =
            f64::from(reading.conductivity) * CONDUCTIVITY_FACTOR;
        snapshot.light_lux = f64::from(reading.light_lux);
        snapshot.moisture_percent = f64::from(reading.moisture_percent);
        snapshot.temperature_celsius = reading.temperature_celsius;
        snapshot
    }
}
