//! Core data models for the batch engine

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use crate::error::EngineError;

/// A host resource dimension tracked by the monitor. Fixed, closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Compute,
    Memory,
    Storage,
    Accelerator,
}

impl ResourceKind {
    /// All kinds, in sampling order.
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Compute,
        ResourceKind::Memory,
        ResourceKind::Storage,
        ResourceKind::Accelerator,
    ];
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Compute => write!(f, "compute"),
            ResourceKind::Memory => write!(f, "memory"),
            ResourceKind::Storage => write!(f, "storage"),
            ResourceKind::Accelerator => write!(f, "accelerator"),
        }
    }
}

/// Classification of a utilization ratio, totally ordered.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum UtilizationTier {
    Normal,
    Warning,
    Critical,
}

impl UtilizationTier {
    /// Classify a utilization ratio against a threshold policy.
    ///
    /// `Critical` iff `ratio >= critical_ratio`, `Warning` iff
    /// `warning_ratio <= ratio < critical_ratio`, else `Normal`.
    pub fn classify(ratio: f64, policy: &ThresholdPolicy) -> Self {
        if ratio >= policy.critical_ratio {
            UtilizationTier::Critical
        } else if ratio >= policy.warning_ratio {
            UtilizationTier::Warning
        } else {
            UtilizationTier::Normal
        }
    }
}

impl std::fmt::Display for UtilizationTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UtilizationTier::Normal => write!(f, "normal"),
            UtilizationTier::Warning => write!(f, "warning"),
            UtilizationTier::Critical => write!(f, "critical"),
        }
    }
}

/// Per-kind tier thresholds. Takes effect on the next monitor tick only;
/// history is never reclassified.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ThresholdPolicy {
    pub warning_ratio: f64,
    pub critical_ratio: f64,
}

impl ThresholdPolicy {
    /// Build a policy, rejecting values outside `[0, 1]` or a warning
    /// threshold at or above the critical one.
    pub fn new(warning_ratio: f64, critical_ratio: f64) -> Result<Self, EngineError> {
        if !(0.0..=1.0).contains(&warning_ratio) || !(0.0..=1.0).contains(&critical_ratio) {
            return Err(EngineError::InvalidArgument(format!(
                "thresholds must be within [0, 1], got warning={warning_ratio} critical={critical_ratio}"
            )));
        }
        if warning_ratio >= critical_ratio {
            return Err(EngineError::InvalidArgument(format!(
                "warning threshold {warning_ratio} must be below critical threshold {critical_ratio}"
            )));
        }
        Ok(Self {
            warning_ratio,
            critical_ratio,
        })
    }
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self {
            warning_ratio: 0.75,
            critical_ratio: 0.90,
        }
    }
}

/// One monitored reading for a resource kind, produced per monitor tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSample {
    pub kind: ResourceKind,
    /// Utilization in `[0, 1]`.
    pub utilization_ratio: f64,
    pub available_amount: u64,
    pub total_amount: u64,
    pub tier: UtilizationTier,
    /// Kind-specific extras (per-core usage, device index, mount point).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub detail: HashMap<String, serde_json::Value>,
    /// Unix timestamp (seconds).
    pub captured_at: i64,
}

/// Hardware encode capability tags.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EncodeCapability {
    H264,
    Hevc,
    Av1,
}

impl std::fmt::Display for EncodeCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodeCapability::H264 => write!(f, "h264"),
            EncodeCapability::Hevc => write!(f, "hevc"),
            EncodeCapability::Av1 => write!(f, "av1"),
        }
    }
}

/// Static accelerator description captured once at registry initialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub index: u32,
    pub name: String,
    pub vendor: String,
    pub total_memory_bytes: u64,
    /// Empty set is valid: the device offers no hardware encode.
    pub capabilities: BTreeSet<EncodeCapability>,
    pub driver_version: String,
    pub device_id: String,
}

/// Live accelerator usage reading. Optional fields are present only when
/// the platform exposes them; absence is not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceUsageSample {
    pub device_index: u32,
    /// Device utilization in `[0, 1]`.
    pub utilization_ratio: f64,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_celsius: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_draw_watts: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoder_utilization: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decoder_utilization: Option<f64>,
    /// Unix timestamp (seconds).
    pub captured_at: i64,
}

impl DeviceUsageSample {
    /// Memory utilization in `[0, 1]`, or 0 when the total is unknown.
    pub fn memory_ratio(&self) -> f64 {
        if self.memory_total_bytes == 0 {
            0.0
        } else {
            self.memory_used_bytes as f64 / self.memory_total_bytes as f64
        }
    }
}

/// Optional per-kind ceilings applied to tracked processes. Breaches are
/// reported, never remediated; throttling is an external policy decision.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_compute_percent: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_memory_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_storage_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_accelerator_percent: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_accelerator_memory_bytes: Option<u64>,
}

/// One unit of work submitted to the batch processor. Consumed exactly
/// once by exactly one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJob {
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
    /// Opaque parameters handed through to the job executor.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub parameters: HashMap<String, String>,
}

impl BatchJob {
    pub fn new(source_path: impl Into<PathBuf>, destination_path: impl Into<PathBuf>) -> Self {
        Self {
            source_path: source_path.into(),
            destination_path: destination_path.into(),
            parameters: HashMap::new(),
        }
    }

    /// Identifier carried into the job's `BatchResult` so callers can
    /// correlate results regardless of completion order.
    pub fn source_id(&self) -> String {
        self.source_path.to_string_lossy().into_owned()
    }
}

/// Outcome of one job. Exactly one is produced per submitted `BatchJob`,
/// including on worker-level failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub source: String,
    pub success: bool,
    pub duration_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Batch processor lifecycle. Only one batch may be `Running` at a time
/// per processor instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    AbortRequested,
    Draining,
}

/// Cumulative monitor statistics since the last reset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorStats {
    /// Highest utilization ratio observed per kind.
    pub peak_utilization: HashMap<ResourceKind, f64>,
    pub warning_events: u64,
    pub critical_events: u64,
}
