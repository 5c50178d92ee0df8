use crate::domain::RawReading;

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// latest successful reading per sensor identifier
///
/// each write replaces a whole `RawReading` under the write lock, so readers
/// see either the previous reading or the new one.
#[derive(Clone, Default)]
pub struct ReadingCache {
    inner: Arc<RwLock<HashMap<String, RawReading>>>,
}

impl ReadingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn store(&self, identifier: &str, reading: RawReading) {
        self.inner
            .write()
            .await
            .insert(identifier.to_string(), reading);
    }

    pub async fn get(&self, identifier: &str) -> Option<RawReading> {
        self.inner.read().await.get(identifier).cloned()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn reading(battery: u8) -> RawReading {
        RawReading {
            observed_at: Utc::now(),
            firmware_version: "3.2.1".to_string(),
            battery_percent: battery,
            conductivity: 100,
            light_lux: 1000,
            moisture_percent: 30,
            temperature_celsius: 21.5,
        }
    }

    #[tokio::test]
    async fn test_store_overwrites_single_entry() {
        let cache = ReadingCache::new();
        assert!(cache.get("a").await.is_none());

        cache.store("a", reading(90)).await;
        cache.store("a", reading(80)).await;

        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.get("a").await.unwrap().battery_percent, 80);
    }
}
