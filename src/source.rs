//! ==============================================================================
//! source.rs - sensor source abstraction
//! ==============================================================================
//!
//! purpose:
//!     provides a unified interface for "read one sensor once".
//!     abstracts away the difference between talking to a real miflora over
//!     bluetooth (gatttool.rs) and a development machine (simulated readings).
//!
//! contract:
//!     - one call to `read` is one attempt. no retries, no backoff.
//!     - retry and timeout policy lives in updater.rs.
//!     - `open` / `close` bracket the adapter lifetime.
//!
//! relationships:
//!     - used by: updater.rs (polls through Arc<dyn RawSource>)
//!     - implemented by: gatttool.rs, SimulatedSource below
//!
//! ==============================================================================

use crate::domain::RawReading;
use crate::miflora::DecodeError;

use async_trait::async_trait;
use chrono::Utc;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("bluetooth adapter {adapter} unavailable: {reason}")]
    Adapter { adapter: String, reason: String },
}

impl From<DecodeError> for TransportError {
    fn from(e: DecodeError) -> Self {
        TransportError::Protocol(e.to_string())
    }
}

#[async_trait]
pub trait RawSource: Send + Sync {
    /// acquire the local radio adapter
    async fn open(&self) -> Result<(), TransportError> {
        Ok(())
    }

    /// release the local radio adapter
    async fn close(&self) {}

    /// one attempt at reading `identifier`
    async fn read(&self, identifier: &str) -> Result<RawReading, TransportError>;
}

// ==============================================================================
// SIMULATED SOURCE (For development without bluetooth hardware)
// ==============================================================================

/// deterministic fake readings, varied per mac address and per call
pub struct SimulatedSource {
    calls: AtomicU64,
}

impl SimulatedSource {
    pub fn new() -> Self {
        tracing::info!("Using SIMULATED sensor source (no bluetooth access)");
        Self {
            calls: AtomicU64::new(0),
        }
    }
}

impl Default for SimulatedSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RawSource for SimulatedSource {
    async fn read(&self, identifier: &str) -> Result<RawReading, TransportError> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        let mut hasher = DefaultHasher::new();
        identifier.hash(&mut hasher);
        let seed = hasher.finish();

        tracing::debug!(mac = identifier, call, "[SIMULATED] read");

        Ok(RawReading {
            observed_at: Utc::now(),
            firmware_version: "3.2.1".to_string(),
            battery_percent: 60 + (seed % 40) as u8,
            conductivity: 200 + ((seed >> 8) % 800) as u16,
            light_lux: 500 + ((seed >> 16) % 20_000) as u32 + (call % 10) as u32,
            moisture_percent: 20 + ((seed >> 32) % 50) as u8,
            temperature_celsius: 18.0 + ((seed >> 40) % 80) as f64 / 10.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulated_source_is_stable_per_sensor() {
        let source = SimulatedSource::new();
        let a1 = source.read("C4:7C:8D:00:00:01").await.unwrap();
        let a2 = source.read("C4:7C:8D:00:00:01").await.unwrap();

        assert_eq!(a1.battery_percent, a2.battery_percent);
        assert_eq!(a1.moisture_percent, a2.moisture_percent);
        assert!(a1.battery_percent <= 100);
        assert!(a1.moisture_percent <= 100);
    }

    #[test]
    fn test_decode_error_maps_to_protocol() {
        let err: TransportError = DecodeError::LegacyMode.into();
        assert!(matches!(err, TransportError::Protocol(_)));
    }
}
