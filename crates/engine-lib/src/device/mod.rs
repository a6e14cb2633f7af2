//! Accelerator device enumeration and usage sampling
//!
//! Devices are enumerated once at registry initialization; capability and
//! usage queries never re-enumerate. Device access goes through the
//! [`AcceleratorProbe`] trait so the registry can be driven by fakes in
//! tests; the NVML-backed probe is the production implementation.

mod nvml;

pub use nvml::NvmlProbe;

use anyhow::Result;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::models::{DeviceInfo, DeviceUsageSample, EncodeCapability};
use crate::observability::EngineMetrics;

/// Retained usage samples per device.
pub const DEFAULT_DEVICE_HISTORY_CAPACITY: usize = 100;

/// Bounded wait when joining the polling loop on stop.
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Trait for accelerator platform implementations
pub trait AcceleratorProbe: Send + Sync {
    /// Enumerate devices visible to the platform interface.
    fn enumerate(&self) -> Vec<DeviceInfo>;

    /// Live usage query for one device. Errors mean the reading is
    /// unavailable right now (device removed, driver error); callers skip
    /// the device rather than reuse a stale value.
    fn usage(&self, index: u32) -> Result<DeviceUsageSample>;
}

struct RegistryShared {
    /// Platform handle; `None` after shutdown or when no interface loaded.
    probe: RwLock<Option<Arc<dyn AcceleratorProbe>>>,
    devices: Vec<DeviceInfo>,
    histories: Mutex<HashMap<u32, VecDeque<DeviceUsageSample>>>,
    peak_utilization: Mutex<HashMap<u32, f64>>,
    history_capacity: usize,
}

impl RegistryShared {
    fn probe(&self) -> Option<Arc<dyn AcceleratorProbe>> {
        self.probe
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn all_usage(&self) -> Vec<DeviceUsageSample> {
        let Some(probe) = self.probe() else {
            return Vec::new();
        };
        self.devices
            .iter()
            .filter_map(|device| match probe.usage(device.index) {
                Ok(sample) => Some(sample),
                Err(e) => {
                    debug!(
                        device_index = device.index,
                        error = %e,
                        "Skipping device with failed usage query"
                    );
                    None
                }
            })
            .collect()
    }

    /// One polling pass: sample every device, append to bounded history,
    /// and update peaks.
    fn poll_once(&self) {
        let samples = self.all_usage();
        if samples.is_empty() {
            return;
        }

        let mut histories = self.histories.lock().unwrap_or_else(|e| e.into_inner());
        let mut peaks = self
            .peak_utilization
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        for sample in samples {
            let history = histories.entry(sample.device_index).or_default();
            while history.len() >= self.history_capacity {
                history.pop_front();
            }

            let peak = peaks.entry(sample.device_index).or_insert(0.0);
            if sample.utilization_ratio > *peak {
                *peak = sample.utilization_ratio;
            }

            history.push_back(sample);
        }
    }
}

struct PollingHandle {
    shutdown: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// Registry of accelerator devices enumerated once at startup.
pub struct DeviceRegistry {
    shared: Arc<RegistryShared>,
    polling: Mutex<Option<PollingHandle>>,
    metrics: EngineMetrics,
}

impl DeviceRegistry {
    /// Attempt to load the platform accelerator interface. Load failure is
    /// not fatal: the registry simply reports zero devices.
    pub fn initialize() -> Self {
        match NvmlProbe::load() {
            Ok(probe) => Self::with_probe(Arc::new(probe)),
            Err(e) => {
                info!(
                    error = %e,
                    "Accelerator interface unavailable, reporting zero devices"
                );
                Self::without_devices()
            }
        }
    }

    /// Build a registry over an explicit probe (dependency injection for
    /// tests and alternative platforms).
    pub fn with_probe(probe: Arc<dyn AcceleratorProbe>) -> Self {
        let devices = probe.enumerate();
        info!(device_count = devices.len(), "Enumerated accelerator devices");
        for device in &devices {
            debug!(
                index = device.index,
                name = %device.name,
                capabilities = ?device.capabilities,
                "Accelerator device"
            );
        }

        let metrics = EngineMetrics::new();
        metrics.set_devices_monitored(devices.len() as i64);

        Self {
            shared: Arc::new(RegistryShared {
                probe: RwLock::new(Some(probe)),
                devices,
                histories: Mutex::new(HashMap::new()),
                peak_utilization: Mutex::new(HashMap::new()),
                history_capacity: DEFAULT_DEVICE_HISTORY_CAPACITY,
            }),
            polling: Mutex::new(None),
            metrics,
        }
    }

    /// Registry with no platform interface; every query reports absence.
    pub fn without_devices() -> Self {
        let metrics = EngineMetrics::new();
        metrics.set_devices_monitored(0);
        Self {
            shared: Arc::new(RegistryShared {
                probe: RwLock::new(None),
                devices: Vec::new(),
                histories: Mutex::new(HashMap::new()),
                peak_utilization: Mutex::new(HashMap::new()),
                history_capacity: DEFAULT_DEVICE_HISTORY_CAPACITY,
            }),
            polling: Mutex::new(None),
            metrics,
        }
    }

    /// Immutable device list captured at initialization.
    pub fn devices(&self) -> &[DeviceInfo] {
        &self.shared.devices
    }

    /// True if any enumerated device carries the capability.
    pub fn has_capability(&self, capability: EncodeCapability) -> bool {
        self.shared
            .devices
            .iter()
            .any(|device| device.capabilities.contains(&capability))
    }

    /// Synchronous live usage query for one device. `None` on query
    /// failure rather than a stale value.
    pub fn usage(&self, index: u32) -> Option<DeviceUsageSample> {
        let probe = self.shared.probe()?;
        match probe.usage(index) {
            Ok(sample) => Some(sample),
            Err(e) => {
                debug!(device_index = index, error = %e, "Device usage query failed");
                None
            }
        }
    }

    /// Usage for every enumerated device, skipping any that fail
    /// individually.
    pub fn all_usage(&self) -> Vec<DeviceUsageSample> {
        self.shared.all_usage()
    }

    /// Up to `count` most recent retained samples for a device, oldest
    /// first. Omitting `count` returns the full retained window.
    pub fn device_history(&self, index: u32, count: Option<usize>) -> Vec<DeviceUsageSample> {
        let histories = self
            .shared
            .histories
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let Some(history) = histories.get(&index) else {
            return Vec::new();
        };
        let take = count.unwrap_or(history.len()).min(history.len());
        history.iter().skip(history.len() - take).cloned().collect()
    }

    /// Peak utilization ratio observed for a device since polling began.
    pub fn peak_utilization(&self, index: u32) -> Option<f64> {
        self.shared
            .peak_utilization
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&index)
            .copied()
    }

    /// Begin a repeating polling tick that records per-device history and
    /// peaks. No-op if already polling or no devices are present.
    pub fn start_polling(&self, interval: Duration) {
        let mut polling = self.polling.lock().unwrap_or_else(|e| e.into_inner());
        if polling.is_some() {
            debug!("Device polling already started");
            return;
        }
        if self.shared.devices.is_empty() {
            debug!("No accelerator devices, polling not started");
            return;
        }

        info!(
            interval_secs = interval.as_secs_f64(),
            device_count = self.shared.devices.len(),
            "Starting accelerator polling loop"
        );

        let (shutdown, mut shutdown_rx) = broadcast::channel(1);
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // Missed deadlines delay the next poll, never burst to catch up.
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        shared.poll_once();
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Shutting down accelerator polling loop");
                        break;
                    }
                }
            }
        });

        *polling = Some(PollingHandle { shutdown, handle });
    }

    /// Stop the polling loop with a bounded join. Subsequent calls are
    /// no-ops.
    pub async fn stop_polling(&self) {
        let handle = {
            let mut polling = self.polling.lock().unwrap_or_else(|e| e.into_inner());
            polling.take()
        };
        let Some(PollingHandle { shutdown, handle }) = handle else {
            return;
        };

        let _ = shutdown.send(());
        if tokio::time::timeout(STOP_JOIN_TIMEOUT, handle).await.is_err() {
            warn!("Accelerator polling loop did not exit within join timeout");
        }
    }

    /// Stop polling and release the platform handle.
    pub async fn shutdown(&self) {
        self.stop_polling().await;
        let mut probe = self
            .shared
            .probe
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if probe.take().is_some() {
            info!("Released accelerator platform handle");
        }
        self.metrics.set_devices_monitored(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Fake probe with a fixed device list and controllable failures.
    struct FakeProbe {
        devices: Vec<DeviceInfo>,
        failing_indices: Vec<u32>,
        usage_counter: AtomicU64,
    }

    impl FakeProbe {
        fn new(device_count: u32, capabilities: BTreeSet<EncodeCapability>) -> Self {
            let devices = (0..device_count)
                .map(|index| DeviceInfo {
                    index,
                    name: format!("Fake Device {index}"),
                    vendor: "FakeCorp".to_string(),
                    total_memory_bytes: 8 * 1024 * 1024 * 1024,
                    capabilities: capabilities.clone(),
                    driver_version: "1.0".to_string(),
                    device_id: format!("fake-{index}"),
                })
                .collect();
            Self {
                devices,
                failing_indices: Vec::new(),
                usage_counter: AtomicU64::new(0),
            }
        }

        fn failing(mut self, indices: Vec<u32>) -> Self {
            self.failing_indices = indices;
            self
        }
    }

    impl AcceleratorProbe for FakeProbe {
        fn enumerate(&self) -> Vec<DeviceInfo> {
            self.devices.clone()
        }

        fn usage(&self, index: u32) -> Result<DeviceUsageSample> {
            if self.failing_indices.contains(&index) {
                return Err(anyhow!("device {index} query failed"));
            }
            let tick = self.usage_counter.fetch_add(1, Ordering::SeqCst);
            Ok(DeviceUsageSample {
                device_index: index,
                // Varies per call so peak tracking is observable.
                utilization_ratio: 0.1 + (tick % 10) as f64 * 0.05,
                memory_used_bytes: 1024,
                memory_total_bytes: 8 * 1024 * 1024 * 1024,
                temperature_celsius: Some(55.0),
                power_draw_watts: None,
                encoder_utilization: Some(0.2),
                decoder_utilization: None,
                captured_at: chrono::Utc::now().timestamp(),
            })
        }
    }

    fn h264_hevc() -> BTreeSet<EncodeCapability> {
        [EncodeCapability::H264, EncodeCapability::Hevc]
            .into_iter()
            .collect()
    }

    #[test]
    fn test_enumeration_is_captured_once() {
        let registry = DeviceRegistry::with_probe(Arc::new(FakeProbe::new(2, h264_hevc())));
        assert_eq!(registry.devices().len(), 2);
        assert_eq!(registry.devices()[1].index, 1);
    }

    #[test]
    fn test_has_capability() {
        let registry = DeviceRegistry::with_probe(Arc::new(FakeProbe::new(1, h264_hevc())));
        assert!(registry.has_capability(EncodeCapability::H264));
        assert!(registry.has_capability(EncodeCapability::Hevc));
        assert!(!registry.has_capability(EncodeCapability::Av1));
    }

    #[test]
    fn test_empty_capability_set_is_valid() {
        let registry = DeviceRegistry::with_probe(Arc::new(FakeProbe::new(1, BTreeSet::new())));
        assert!(!registry.has_capability(EncodeCapability::H264));
    }

    #[test]
    fn test_zero_devices_registry() {
        let registry = DeviceRegistry::without_devices();
        assert!(registry.devices().is_empty());
        assert!(registry.all_usage().is_empty());
        assert!(registry.usage(0).is_none());
        assert!(!registry.has_capability(EncodeCapability::H264));
    }

    #[test]
    fn test_all_usage_skips_failing_devices() {
        let probe = FakeProbe::new(3, h264_hevc()).failing(vec![1]);
        let registry = DeviceRegistry::with_probe(Arc::new(probe));

        let usage = registry.all_usage();
        assert_eq!(usage.len(), 2);
        assert!(usage.iter().all(|s| s.device_index != 1));
    }

    #[test]
    fn test_usage_failure_returns_none() {
        let probe = FakeProbe::new(1, h264_hevc()).failing(vec![0]);
        let registry = DeviceRegistry::with_probe(Arc::new(probe));
        assert!(registry.usage(0).is_none());
    }

    #[test]
    fn test_polling_history_is_bounded() {
        let registry = DeviceRegistry::with_probe(Arc::new(FakeProbe::new(1, h264_hevc())));

        for _ in 0..(DEFAULT_DEVICE_HISTORY_CAPACITY * 3) {
            registry.shared.poll_once();
        }

        let history = registry.device_history(0, None);
        assert_eq!(history.len(), DEFAULT_DEVICE_HISTORY_CAPACITY);
    }

    #[test]
    fn test_peak_utilization_tracked() {
        let registry = DeviceRegistry::with_probe(Arc::new(FakeProbe::new(1, h264_hevc())));

        for _ in 0..20 {
            registry.shared.poll_once();
        }

        // FakeProbe cycles utilization between 0.10 and 0.55.
        let peak = registry.peak_utilization(0).unwrap();
        assert!((peak - 0.55).abs() < 1e-9);
    }

    #[test]
    fn test_device_history_count_limit() {
        let registry = DeviceRegistry::with_probe(Arc::new(FakeProbe::new(1, h264_hevc())));

        for _ in 0..10 {
            registry.shared.poll_once();
        }

        let history = registry.device_history(0, Some(3));
        assert_eq!(history.len(), 3);
        // Oldest first within the returned slice.
        assert!(history[0].captured_at <= history[2].captured_at);
    }

    #[tokio::test]
    async fn test_shutdown_releases_probe() {
        let registry = DeviceRegistry::with_probe(Arc::new(FakeProbe::new(1, h264_hevc())));
        assert!(registry.usage(0).is_some());

        registry.shutdown().await;
        assert!(registry.usage(0).is_none());
        // Static device info remains queryable after shutdown.
        assert_eq!(registry.devices().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_missed_ticks_are_delayed_not_bursted() {
        let registry = DeviceRegistry::with_probe(Arc::new(FakeProbe::new(1, h264_hevc())));
        registry.start_polling(Duration::from_millis(10));

        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        // Jump far past many poll deadlines at once.
        tokio::time::advance(Duration::from_secs(1)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        registry.stop_polling().await;

        let samples = registry.device_history(0, None).len();
        assert!(
            samples <= 3,
            "missed intervals replayed as a burst: {samples} samples"
        );
    }

    #[tokio::test]
    async fn test_polling_start_stop() {
        let registry = DeviceRegistry::with_probe(Arc::new(FakeProbe::new(1, h264_hevc())));

        registry.start_polling(Duration::from_millis(10));
        // Second start is a no-op.
        registry.start_polling(Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.stop_polling().await;
        // Second stop is a no-op.
        registry.stop_polling().await;

        assert!(!registry.device_history(0, None).is_empty());
    }
}
