//! ==============================================================================
//! updater.rs - background refresh of the reading cache
//! ==============================================================================
//!
//! purpose:
//!     owns the sensor registry and the reading cache. `refresh_all` polls
//!     every registered sensor with bounded retries and writes successes into
//!     the cache; `read` is a pure cache lookup for the http side.
//!
//! failure policy:
//!     - each sensor gets its own retry budget (attempts x timeout) and runs
//!       concurrently with the others, so one dead sensor cannot starve the rest
//!     - exhausted retries leave the previous reading in place
//!     - a refresh never fails as a whole
//!     - once `cancel` fires, in-flight reads are dropped and nothing more is
//!       written
//!
//! relationships:
//!     - uses: source.rs (RawSource), cache.rs (ReadingCache)
//!     - used by: scheduler.rs (refresh_all), collector.rs (read), main.rs (start)
//!
//! ==============================================================================

use crate::cache::ReadingCache;
use crate::domain::{RawReading, SensorConfig};
use crate::source::{RawSource, TransportError};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// how hard to try a single sensor within one refresh cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// bound on each individual attempt
    pub timeout: Duration,
    /// fixed pause between attempts
    pub delay: Duration,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSummary {
    pub updated: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Updated,
    Failed,
    Cancelled,
}

pub struct Updater {
    source: Arc<dyn RawSource>,
    sensors: Vec<SensorConfig>,
    cache: ReadingCache,
    policy: RetryPolicy,
}

impl Updater {
    pub fn new(source: Arc<dyn RawSource>, policy: RetryPolicy) -> Self {
        Self {
            source,
            sensors: Vec::new(),
            cache: ReadingCache::new(),
            policy,
        }
    }

    /// add a sensor to the polling set
    ///
    /// takes `&mut self`, so it can only happen before the updater is shared.
    pub fn register(&mut self, sensor: SensorConfig) {
        if self.sensors.iter().any(|s| s.identifier == sensor.identifier) {
            tracing::warn!(sensor = %sensor, "sensor already registered, ignoring");
            return;
        }
        tracing::info!(sensor = %sensor, "sensor registered");
        self.sensors.push(sensor);
    }

    /// registered sensors, in registration order
    pub fn sensors(&self) -> &[SensorConfig] {
        &self.sensors
    }

    /// cached reading for `identifier`, `None` if it was never read
    pub async fn read(&self, identifier: &str) -> Option<RawReading> {
        self.cache.get(identifier).await
    }

    /// acquire the radio adapter; it is released once `cancel` fires
    pub async fn start(&self, cancel: CancellationToken) -> Result<JoinHandle<()>, TransportError> {
        self.source.open().await?;

        let source = self.source.clone();
        Ok(tokio::spawn(async move {
            cancel.cancelled().await;
            source.close().await;
        }))
    }

    /// poll every registered sensor once, with retries
    pub async fn refresh_all(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> RefreshSummary {
        tracing::debug!(at = %now, sensors = self.sensors.len(), "refreshing all sensors");

        let outcomes = join_all(self.sensors.iter().map(|s| self.refresh_one(s, cancel))).await;

        let mut summary = RefreshSummary::default();
        for outcome in outcomes {
            match outcome {
                Outcome::Updated => summary.updated += 1,
                Outcome::Failed => summary.failed += 1,
                Outcome::Cancelled => summary.cancelled += 1,
            }
        }

        tracing::info!(
            updated = summary.updated,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "refresh cycle finished"
        );
        summary
    }

    async fn refresh_one(&self, sensor: &SensorConfig, cancel: &CancellationToken) -> Outcome {
        let attempts = self.policy.attempts.max(1);

        for attempt in 1..=attempts {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Outcome::Cancelled,
                r = tokio::time::timeout(
                    self.policy.timeout,
                    self.source.read(&sensor.identifier),
                ) => {
                    r.unwrap_or_else(|_| Err(TransportError::Timeout(self.policy.timeout)))
                }
            };

            match result {
                Ok(reading) => {
                    if cancel.is_cancelled() {
                        return Outcome::Cancelled;
                    }
                    tracing::debug!(
                        sensor = %sensor,
                        attempt,
                        observed_at = %reading.observed_at,
                        "sensor updated"
                    );
                    self.cache.store(&sensor.identifier, reading).await;
                    return Outcome::Updated;
                }
                Err(e) => {
                    tracing::debug!(
                        sensor = %sensor,
                        attempt,
                        attempts,
                        error = %e,
                        "read attempt failed"
                    );
                }
            }

            if attempt < attempts {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Outcome::Cancelled,
                    _ = tokio::time::sleep(self.policy.delay) => {}
                }
            }
        }

        tracing::warn!(
            sensor = %sensor,
            attempts,
            "failed to update sensor, keeping previous reading"
        );
        Outcome::Failed
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    pub(crate) fn reading_at(observed_at: DateTime<Utc>, conductivity: u16) -> RawReading {
        RawReading {
            observed_at,
            firmware_version: "3.2.1".to_string(),
            battery_percent: 95,
            conductivity,
            light_lux: 2500,
            moisture_percent: 42,
            temperature_celsius: 22.5,
        }
    }

    pub(crate) enum Step {
        Ok(RawReading),
        Fail,
        Hang,
    }

    /// per-sensor scripted responses; an empty script fails
    #[derive(Default)]
    pub(crate) struct ScriptedSource {
        scripts: Mutex<HashMap<String, VecDeque<Step>>>,
        calls: Mutex<HashMap<String, usize>>,
    }

    impl ScriptedSource {
        pub(crate) fn push(&self, identifier: &str, step: Step) {
            self.scripts
                .lock()
                .unwrap()
                .entry(identifier.to_string())
                .or_default()
                .push_back(step);
        }

        pub(crate) fn calls(&self, identifier: &str) -> usize {
            self.calls.lock().unwrap().get(identifier).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl RawSource for ScriptedSource {
        async fn read(&self, identifier: &str) -> Result<RawReading, TransportError> {
            *self.calls.lock().unwrap().entry(identifier.to_string()).or_default() += 1;
            let step = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(identifier)
                .and_then(|q| q.pop_front());
            match step {
                Some(Step::Ok(reading)) => Ok(reading),
                Some(Step::Hang) => std::future::pending().await,
                Some(Step::Fail) | None => {
                    Err(TransportError::Connection("scripted failure".into()))
                }
            }
        }
    }

    fn policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            timeout: Duration::from_secs(10),
            delay: Duration::from_millis(100),
        }
    }

    fn updater_with(source: Arc<ScriptedSource>, attempts: u32, macs: &[&str]) -> Updater {
        let mut updater = Updater::new(source, policy(attempts));
        for (i, mac) in macs.iter().enumerate() {
            updater.register(SensorConfig::new(*mac, format!("plant-{}", i)));
        }
        updater
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_read_sensor_stays_unknown() {
        let source = Arc::new(ScriptedSource::default());
        let updater = updater_with(source.clone(), 3, &["A"]);
        let cancel = CancellationToken::new();

        for _ in 0..3 {
            let summary = updater.refresh_all(Utc::now(), &cancel).await;
            assert_eq!(summary.failed, 1);
        }

        assert!(updater.read("A").await.is_none());
        assert_eq!(source.calls("A"), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let source = Arc::new(ScriptedSource::default());
        let r = reading_at(Utc::now(), 300);
        source.push("A", Step::Fail);
        source.push("A", Step::Fail);
        source.push("A", Step::Ok(r.clone()));
        let updater = updater_with(source.clone(), 3, &["A"]);

        let summary = updater.refresh_all(Utc::now(), &CancellationToken::new()).await;

        assert_eq!(summary, RefreshSummary { updated: 1, failed: 0, cancelled: 0 });
        assert_eq!(source.calls("A"), 3);
        assert_eq!(updater.read("A").await, Some(r));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_preserves_previous_reading() {
        let source = Arc::new(ScriptedSource::default());
        let r = reading_at(Utc::now(), 300);
        source.push("A", Step::Ok(r.clone()));
        let updater = updater_with(source.clone(), 2, &["A"]);
        let cancel = CancellationToken::new();

        updater.refresh_all(Utc::now(), &cancel).await;
        let summary = updater.refresh_all(Utc::now(), &cancel).await;

        assert_eq!(summary.failed, 1);
        assert_eq!(source.calls("A"), 3);
        assert_eq!(updater.read("A").await, Some(r));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_sensor_times_out_without_starving_others() {
        let source = Arc::new(ScriptedSource::default());
        let r = reading_at(Utc::now(), 300);
        source.push("SLOW", Step::Hang);
        source.push("SLOW", Step::Hang);
        source.push("FAST", Step::Fail);
        source.push("FAST", Step::Ok(r.clone()));
        let updater = updater_with(source.clone(), 2, &["SLOW", "FAST"]);

        let started = tokio::time::Instant::now();
        let summary = updater.refresh_all(Utc::now(), &CancellationToken::new()).await;

        assert_eq!(summary, RefreshSummary { updated: 1, failed: 1, cancelled: 0 });
        assert_eq!(updater.read("FAST").await, Some(r));
        assert!(updater.read("SLOW").await.is_none());
        // two timeouts plus one delay, not serialized behind FAST
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(20), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(21), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_abandons_in_flight_reads() {
        let source = Arc::new(ScriptedSource::default());
        source.push("A", Step::Hang);
        let updater = Arc::new(updater_with(source.clone(), 3, &["A"]));
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let updater = updater.clone();
            let cancel = cancel.clone();
            async move { updater.refresh_all(Utc::now(), &cancel).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        let summary = task.await.unwrap();
        assert_eq!(summary.cancelled, 1);
        assert_eq!(source.calls("A"), 1);
        assert!(updater.read("A").await.is_none());
    }

    /// returns a reading, but only after the shutdown signal has fired
    struct LateSource {
        cancel: CancellationToken,
    }

    #[async_trait]
    impl RawSource for LateSource {
        async fn read(&self, _identifier: &str) -> Result<RawReading, TransportError> {
            self.cancel.cancel();
            Ok(reading_at(Utc::now(), 1))
        }
    }

    #[tokio::test]
    async fn test_reading_after_cancel_is_not_written() {
        let cancel = CancellationToken::new();
        let mut updater = Updater::new(Arc::new(LateSource { cancel: cancel.clone() }), policy(1));
        updater.register(SensorConfig::new("A", "basil"));

        let summary = updater.refresh_all(Utc::now(), &cancel).await;

        assert_eq!(summary.cancelled, 1);
        assert!(updater.read("A").await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_register_is_ignored() {
        let mut updater = Updater::new(Arc::new(ScriptedSource::default()), policy(1));
        updater.register(SensorConfig::new("A", "basil"));
        updater.register(SensorConfig::new("A", "mint"));
        updater.register(SensorConfig::new("B", "thyme"));

        let names: Vec<_> = updater.sensors().iter().map(|s| s.display_name.as_str()).collect();
        assert_eq!(names, vec!["basil", "thyme"]);
    }

    #[derive(Default)]
    struct AdapterSource {
        opened: AtomicBool,
        closed: AtomicBool,
    }

    #[async_trait]
    impl RawSource for AdapterSource {
        async fn open(&self) -> Result<(), TransportError> {
            self.opened.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        async fn read(&self, _identifier: &str) -> Result<RawReading, TransportError> {
            Err(TransportError::Timeout(Duration::ZERO))
        }
    }

    #[tokio::test]
    async fn test_start_releases_adapter_on_cancel() {
        let source = Arc::new(AdapterSource::default());
        let updater = Updater::new(source.clone(), policy(1));
        let cancel = CancellationToken::new();

        let release = updater.start(cancel.clone()).await.unwrap();
        assert!(source.opened.load(Ordering::SeqCst));
        assert!(!source.closed.load(Ordering::SeqCst));

        cancel.cancel();
        release.await.unwrap();
        assert!(source.closed.load(Ordering::SeqCst));
    }

    /// every reading carries the same value in two fields
    struct CountingSource {
        counter: AtomicUsize,
    }

    #[async_trait]
    impl RawSource for CountingSource {
        async fn read(&self, _identifier: &str) -> Result<RawReading, TransportError> {
            let n = self.counter.fetch_add(1, Ordering::SeqCst) as u32;
            tokio::task::yield_now().await;
            let mut r = reading_at(Utc::now(), (n % 60_000) as u16);
            r.light_lux = n % 60_000;
            Ok(r)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reads_never_see_torn_writes() {
        let mut updater = Updater::new(
            Arc::new(CountingSource { counter: AtomicUsize::new(0) }),
            policy(1),
        );
        updater.register(SensorConfig::new("A", "basil"));
        updater.register(SensorConfig::new("B", "mint"));
        let updater = Arc::new(updater);
        let cancel = CancellationToken::new();

        let writer = tokio::spawn({
            let updater = updater.clone();
            let cancel = cancel.clone();
            async move {
                for _ in 0..200 {
                    updater.refresh_all(Utc::now(), &cancel).await;
                }
            }
        });

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let updater = updater.clone();
                tokio::spawn(async move {
                    for _ in 0..500 {
                        for id in ["A", "B"] {
                            if let Some(r) = updater.read(id).await {
                                assert_eq!(u32::from(r.conductivity), r.light_lux);
                            }
                        }
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        writer.await.unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
    }
}
