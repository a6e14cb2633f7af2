//! Host resource monitoring
//!
//! Produces the authoritative, continuously refreshed view of host and
//! accelerator resource state: a repeating background tick samples each
//! resource kind, classifies it into a tier, appends it to a bounded
//! history, and notifies registered callbacks on warning/critical entry.
//! Tracked processes are re-checked against configured limits each tick;
//! breaches are logged, never remediated.

mod host;


pub use host::{
    DiskSpaceInfo, DiskSpaceProvider, HostProbe, HostReading, ProcessUsage, SysinfoProbe,
};

use dashmap::DashMap;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::device::DeviceRegistry;
use crate::error::EngineError;
use crate::models::{
    MonitorStats, ResourceKind, ResourceLimits, ResourceSample, ThresholdPolicy, UtilizationTier,
};
use crate::observability::EngineMetrics;

/// Retained samples per resource kind.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Bounded wait when joining the tick loop on stop.
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Delay before the next tick after a tick-level failure.
const TICK_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Callback invoked with the sample that entered its registered tier.
pub type TierCallback = Arc<dyn Fn(&ResourceSample) + Send + Sync>;

/// Handle identifying one registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

struct CallbackEntry {
    id: CallbackId,
    callback: TierCallback,
}

struct TickHandle {
    shutdown: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

struct MonitorShared {
    probe: Arc<dyn HostProbe>,
    registry: Option<Arc<DeviceRegistry>>,
    disk_provider: Option<Arc<dyn DiskSpaceProvider>>,
    storage_path: PathBuf,
    history_capacity: usize,
    thresholds: Mutex<HashMap<ResourceKind, ThresholdPolicy>>,
    histories: Mutex<HashMap<ResourceKind, VecDeque<ResourceSample>>>,
    callbacks: Mutex<HashMap<UtilizationTier, Vec<CallbackEntry>>>,
    tracked: DashMap<u32, ()>,
    limits: Mutex<ResourceLimits>,
    stats: Mutex<MonitorStats>,
    next_callback_id: AtomicU64,
    metrics: EngineMetrics,
}

impl MonitorShared {
    fn policy_for(&self, kind: ResourceKind) -> ThresholdPolicy {
        self.thresholds
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .copied()
            .unwrap_or_default()
    }

    fn build_sample(&self, kind: ResourceKind, reading: HostReading) -> ResourceSample {
        let policy = self.policy_for(kind);
        ResourceSample {
            kind,
            utilization_ratio: reading.utilization_ratio,
            available_amount: reading.available,
            total_amount: reading.total,
            tier: UtilizationTier::classify(reading.utilization_ratio, &policy),
            detail: reading.detail,
            captured_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Compute one sample synchronously. Storage prefers the disk-space
    /// collaborator's cached view and falls back to a direct OS query.
    fn read_host(&self, kind: ResourceKind) -> anyhow::Result<ResourceSample> {
        let reading = match kind {
            ResourceKind::Compute => self.probe.compute()?,
            ResourceKind::Memory => self.probe.memory()?,
            ResourceKind::Storage => self.storage_reading()?,
            ResourceKind::Accelerator => {
                unreachable!("accelerator samples come from the device registry")
            }
        };
        Ok(self.build_sample(kind, reading))
    }

    fn storage_reading(&self) -> anyhow::Result<HostReading> {
        if let Some(provider) = &self.disk_provider {
            match provider.disk_info(&self.storage_path) {
                Ok(info) => {
                    return Ok(HostReading {
                        utilization_ratio: info.utilization.clamp(0.0, 1.0),
                        available: info.free,
                        total: info.total,
                        detail: HashMap::new(),
                    });
                }
                Err(e) => {
                    debug!(error = %e, "Disk-space collaborator failed, falling back to direct query");
                }
            }
        }
        self.probe.storage(&self.storage_path)
    }

    /// Sample for the busiest accelerator device, or `None` when no
    /// accelerator is present.
    fn accelerator_sample(&self) -> Option<ResourceSample> {
        let registry = self.registry.as_ref()?;
        let busiest = registry.all_usage().into_iter().max_by(|a, b| {
            a.utilization_ratio
                .partial_cmp(&b.utilization_ratio)
                .unwrap_or(CmpOrdering::Equal)
        })?;

        let policy = self.policy_for(ResourceKind::Accelerator);
        let mut detail = HashMap::new();
        detail.insert(
            "device_index".to_string(),
            serde_json::json!(busiest.device_index),
        );
        detail.insert(
            "memory_ratio".to_string(),
            serde_json::json!(busiest.memory_ratio()),
        );
        if let Some(temperature) = busiest.temperature_celsius {
            detail.insert(
                "temperature_celsius".to_string(),
                serde_json::json!(temperature),
            );
        }
        if let Some(encoder) = busiest.encoder_utilization {
            detail.insert("encoder_utilization".to_string(), serde_json::json!(encoder));
        }

        Some(ResourceSample {
            kind: ResourceKind::Accelerator,
            utilization_ratio: busiest.utilization_ratio,
            available_amount: busiest
                .memory_total_bytes
                .saturating_sub(busiest.memory_used_bytes),
            total_amount: busiest.memory_total_bytes,
            tier: UtilizationTier::classify(busiest.utilization_ratio, &policy),
            detail,
            captured_at: busiest.captured_at,
        })
    }

    /// One full sampling-and-notification pass. Per-kind read failures are
    /// contained here: the kind is omitted from this tick and the loop
    /// continues.
    fn run_tick(&self) {
        let mut samples = Vec::with_capacity(4);
        for kind in [
            ResourceKind::Compute,
            ResourceKind::Memory,
            ResourceKind::Storage,
        ] {
            match self.read_host(kind) {
                Ok(sample) => samples.push(sample),
                Err(e) => {
                    debug!(kind = %kind, error = %e, "Metric read failed, omitting kind this tick");
                }
            }
        }
        if let Some(sample) = self.accelerator_sample() {
            samples.push(sample);
        }

        // Strictly sequential per sample: record, then stats, then notify.
        for sample in samples {
            self.metrics
                .observe_sample(sample.kind, sample.utilization_ratio, sample.tier);
            self.record(sample.clone());
            self.update_stats(&sample);
            if sample.tier >= UtilizationTier::Warning {
                self.notify(&sample);
            }
        }

        self.check_tracked_processes();
        self.metrics.inc_monitor_ticks();
    }

    fn record(&self, sample: ResourceSample) {
        let mut histories = self.histories.lock().unwrap_or_else(|e| e.into_inner());
        let history = histories.entry(sample.kind).or_default();
        while history.len() >= self.history_capacity {
            history.pop_front();
        }
        history.push_back(sample);
    }

    fn update_stats(&self, sample: &ResourceSample) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        let peak = stats.peak_utilization.entry(sample.kind).or_insert(0.0);
        if sample.utilization_ratio > *peak {
            *peak = sample.utilization_ratio;
        }
        match sample.tier {
            UtilizationTier::Warning => stats.warning_events += 1,
            UtilizationTier::Critical => stats.critical_events += 1,
            UtilizationTier::Normal => {}
        }
    }

    /// Invoke every callback registered for the sample's tier, in
    /// registration order. A panicking callback is logged and skipped;
    /// it never aborts the tick or the remaining callbacks.
    fn notify(&self, sample: &ResourceSample) {
        let callbacks: Vec<(CallbackId, TierCallback)> = {
            let map = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
            map.get(&sample.tier)
                .map(|entries| {
                    entries
                        .iter()
                        .map(|entry| (entry.id, Arc::clone(&entry.callback)))
                        .collect()
                })
                .unwrap_or_default()
        };

        for (id, callback) in callbacks {
            if std::panic::catch_unwind(AssertUnwindSafe(|| callback(sample))).is_err() {
                warn!(
                    tier = %sample.tier,
                    kind = %sample.kind,
                    callback_id = id.0,
                    "Tier callback panicked, continuing with remaining callbacks"
                );
            }
        }
    }

    /// Re-evaluate every tracked process against the active limits.
    /// Breaches are logged; exited processes are dropped from tracking.
    fn check_tracked_processes(&self) {
        if self.tracked.is_empty() {
            return;
        }
        let limits = self
            .limits
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut exited = Vec::new();
        for entry in self.tracked.iter() {
            let pid = *entry.key();
            let Some(usage) = self.probe.process_usage(pid) else {
                exited.push(pid);
                continue;
            };

            if let Some(max_cpu) = limits.max_compute_percent {
                if usage.cpu_percent > max_cpu {
                    warn!(
                        pid,
                        cpu_percent = usage.cpu_percent,
                        limit_percent = max_cpu,
                        "Tracked process exceeds compute limit"
                    );
                }
            }
            if let Some(max_memory) = limits.max_memory_bytes {
                if usage.memory_bytes > max_memory {
                    warn!(
                        pid,
                        memory_bytes = usage.memory_bytes,
                        limit_bytes = max_memory,
                        "Tracked process exceeds memory limit"
                    );
                }
            }
        }

        for pid in exited {
            self.tracked.remove(&pid);
            debug!(pid, "Tracked process exited, removing");
        }
        self.metrics.set_tracked_processes(self.tracked.len() as i64);
    }
}

/// Builder for a [`ResourceMonitor`] with explicit collaborator injection.
pub struct ResourceMonitorBuilder {
    probe: Option<Arc<dyn HostProbe>>,
    registry: Option<Arc<DeviceRegistry>>,
    disk_provider: Option<Arc<dyn DiskSpaceProvider>>,
    storage_path: Option<PathBuf>,
    history_capacity: usize,
}

impl ResourceMonitorBuilder {
    pub fn new() -> Self {
        Self {
            probe: None,
            registry: None,
            disk_provider: None,
            storage_path: None,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }

    /// Set the host probe (defaults to the sysinfo-backed probe).
    pub fn probe(mut self, probe: Arc<dyn HostProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Attach a device registry for accelerator sampling.
    pub fn registry(mut self, registry: Arc<DeviceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Attach a disk-space collaborator preferred for storage sampling.
    pub fn disk_provider(mut self, provider: Arc<dyn DiskSpaceProvider>) -> Self {
        self.disk_provider = Some(provider);
        self
    }

    /// Set the path whose filesystem is sampled for storage utilization.
    pub fn storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = Some(path.into());
        self
    }

    /// Set the retained history size per resource kind.
    pub fn history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> ResourceMonitor {
        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(SysinfoProbe::new()));
        let thresholds = ResourceKind::ALL
            .into_iter()
            .map(|kind| (kind, ThresholdPolicy::default()))
            .collect();

        ResourceMonitor {
            shared: Arc::new(MonitorShared {
                probe,
                registry: self.registry,
                disk_provider: self.disk_provider,
                storage_path: self
                    .storage_path
                    .unwrap_or_else(host::default_storage_path),
                history_capacity: self.history_capacity,
                thresholds: Mutex::new(thresholds),
                histories: Mutex::new(HashMap::new()),
                callbacks: Mutex::new(HashMap::new()),
                tracked: DashMap::new(),
                limits: Mutex::new(ResourceLimits::default()),
                stats: Mutex::new(MonitorStats::default()),
                next_callback_id: AtomicU64::new(0),
                metrics: EngineMetrics::new(),
            }),
            tick: Mutex::new(None),
        }
    }
}

impl Default for ResourceMonitorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Explicitly owned host resource monitor. Construct one, share it by
/// `Arc`, and call [`ResourceMonitor::shutdown`] when done.
pub struct ResourceMonitor {
    shared: Arc<MonitorShared>,
    tick: Mutex<Option<TickHandle>>,
}

impl ResourceMonitor {
    /// Monitor over live OS queries with default configuration.
    pub fn new() -> Self {
        ResourceMonitorBuilder::new().build()
    }

    pub fn builder() -> ResourceMonitorBuilder {
        ResourceMonitorBuilder::new()
    }

    /// Begin the repeating background tick. No-op if already started.
    /// Ticks never overlap: the next fires only after the previous pass
    /// completes.
    pub fn start(&self, interval: Duration) {
        let mut tick = self.tick.lock().unwrap_or_else(|e| e.into_inner());
        if tick.is_some() {
            debug!("Resource monitor already started");
            return;
        }

        info!(
            interval_secs = interval.as_secs_f64(),
            accelerator = self.shared.registry.is_some(),
            "Starting resource monitor"
        );

        let (shutdown, mut shutdown_rx) = broadcast::channel(1);
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // A slow tick delays the next full interval; missed deadlines
            // are never replayed as a burst.
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let outcome =
                            std::panic::catch_unwind(AssertUnwindSafe(|| shared.run_tick()));
                        if outcome.is_err() {
                            warn!("Monitor tick failed unexpectedly, retrying after delay");
                            tokio::time::sleep(TICK_RETRY_DELAY).await;
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Shutting down resource monitor");
                        break;
                    }
                }
            }
        });

        *tick = Some(TickHandle { shutdown, handle });
    }

    /// Signal the tick loop to exit and join it with a bounded wait.
    /// Subsequent calls are no-ops. A stuck tick is logged, not escalated.
    pub async fn stop(&self) {
        let handle = {
            let mut tick = self.tick.lock().unwrap_or_else(|e| e.into_inner());
            tick.take()
        };
        let Some(TickHandle { shutdown, handle }) = handle else {
            return;
        };

        let _ = shutdown.send(());
        if tokio::time::timeout(STOP_JOIN_TIMEOUT, handle).await.is_err() {
            warn!("Monitor tick did not exit within join timeout");
        }
    }

    /// Stop monitoring and release the accelerator subsystem.
    pub async fn shutdown(&self) {
        self.stop().await;
        if let Some(registry) = &self.shared.registry {
            registry.shutdown().await;
        }
    }

    /// Latest state for a kind, computed synchronously on demand. For
    /// accelerator, the busiest device's usage; `None` when the kind is
    /// unavailable.
    pub fn sample(&self, kind: ResourceKind) -> Option<ResourceSample> {
        match kind {
            ResourceKind::Accelerator => self.shared.accelerator_sample(),
            _ => match self.shared.read_host(kind) {
                Ok(sample) => Some(sample),
                Err(e) => {
                    warn!(kind = %kind, error = %e, "On-demand sample failed");
                    None
                }
            },
        }
    }

    /// Bytes of memory currently available, from a live sample.
    pub fn available_memory(&self) -> Option<u64> {
        self.sample(ResourceKind::Memory)
            .map(|sample| sample.available_amount)
    }

    /// Up to `count` most recent retained samples, oldest first. Omitting
    /// `count` returns the full retained window.
    pub fn history(&self, kind: ResourceKind, count: Option<usize>) -> Vec<ResourceSample> {
        let histories = self
            .shared
            .histories
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let Some(history) = histories.get(&kind) else {
            return Vec::new();
        };
        let take = count.unwrap_or(history.len()).min(history.len());
        history.iter().skip(history.len() - take).cloned().collect()
    }

    /// Replace the tier thresholds for one kind. Takes effect on the next
    /// tick; history is never reclassified.
    pub fn set_thresholds(
        &self,
        kind: ResourceKind,
        warning: f64,
        critical: f64,
    ) -> Result<(), EngineError> {
        let policy = ThresholdPolicy::new(warning, critical)?;
        self.shared
            .thresholds
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(kind, policy);
        Ok(())
    }

    /// Register a callback fired for every sample entering `tier`.
    /// Callbacks run in registration order; a panicking callback is
    /// isolated and logged.
    pub fn register_callback<F>(&self, tier: UtilizationTier, callback: F) -> CallbackId
    where
        F: Fn(&ResourceSample) + Send + Sync + 'static,
    {
        let id = CallbackId(self.shared.next_callback_id.fetch_add(1, Ordering::SeqCst));
        let mut callbacks = self
            .shared
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        callbacks.entry(tier).or_default().push(CallbackEntry {
            id,
            callback: Arc::new(callback),
        });
        id
    }

    /// Remove a previously registered callback. Returns false when the id
    /// is unknown for that tier.
    pub fn unregister_callback(&self, tier: UtilizationTier, id: CallbackId) -> bool {
        let mut callbacks = self
            .shared
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let Some(entries) = callbacks.get_mut(&tier) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }

    /// Observe a process's resource usage against the active limits. The
    /// monitor never owns process lifetime; tracking ends when the process
    /// exits or on [`ResourceMonitor::untrack`]. Returns false if the pid
    /// was already tracked.
    pub fn track(&self, pid: u32) -> bool {
        let inserted = self.shared.tracked.insert(pid, ()).is_none();
        self.shared
            .metrics
            .set_tracked_processes(self.shared.tracked.len() as i64);
        inserted
    }

    /// Stop observing a process. Returns false for an unknown pid; that is
    /// not an error.
    pub fn untrack(&self, pid: u32) -> bool {
        let removed = self.shared.tracked.remove(&pid).is_some();
        self.shared
            .metrics
            .set_tracked_processes(self.shared.tracked.len() as i64);
        removed
    }

    /// Pids currently tracked.
    pub fn tracked_pids(&self) -> Vec<u32> {
        self.shared.tracked.iter().map(|e| *e.key()).collect()
    }

    /// Replace the active per-kind limits wholesale.
    pub fn set_limits(&self, limits: ResourceLimits) {
        *self.shared.limits.lock().unwrap_or_else(|e| e.into_inner()) = limits;
    }

    /// Cumulative peak utilization per kind and tier event counts since
    /// the last reset.
    pub fn stats(&self) -> MonitorStats {
        self.shared
            .stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn reset_stats(&self) {
        *self.shared.stats.lock().unwrap_or_else(|e| e.into_inner()) = MonitorStats::default();
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}
