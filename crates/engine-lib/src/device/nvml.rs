//! NVML-backed accelerator probe
//!
//! NVML is loaded dynamically at runtime, so hosts without NVIDIA drivers
//! fail `load()` cleanly and the registry degrades to zero devices.

use anyhow::{Context, Result};
use nvml_wrapper::enum_wrappers::device::{EncoderType, TemperatureSensor};
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::{Device, Nvml};
use std::collections::BTreeSet;
use tracing::{debug, warn};

use super::AcceleratorProbe;
use crate::models::{DeviceInfo, DeviceUsageSample, EncodeCapability};

const VENDOR: &str = "NVIDIA";

/// Accelerator probe backed by the NVIDIA management library.
pub struct NvmlProbe {
    nvml: Nvml,
}

impl NvmlProbe {
    /// Load the management library. Fails on hosts without the NVIDIA
    /// driver stack; callers treat that as "no accelerator present".
    pub fn load() -> Result<Self> {
        let nvml = Nvml::init().context("NVML initialization failed")?;
        Ok(Self { nvml })
    }

    fn describe(&self, index: u32, device: &Device<'_>, driver_version: &str) -> DeviceInfo {
        DeviceInfo {
            index,
            name: device.name().unwrap_or_else(|_| "unknown".to_string()),
            vendor: VENDOR.to_string(),
            total_memory_bytes: device.memory_info().map(|m| m.total).unwrap_or(0),
            capabilities: detect_capabilities(device),
            driver_version: driver_version.to_string(),
            device_id: device
                .uuid()
                .unwrap_or_else(|_| format!("nvidia-{index}")),
        }
    }
}

impl AcceleratorProbe for NvmlProbe {
    fn enumerate(&self) -> Vec<DeviceInfo> {
        let count = match self.nvml.device_count() {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "NVML device count query failed");
                return Vec::new();
            }
        };
        let driver_version = self.nvml.sys_driver_version().unwrap_or_default();

        (0..count)
            .filter_map(|index| match self.nvml.device_by_index(index) {
                Ok(device) => Some(self.describe(index, &device, &driver_version)),
                Err(e) => {
                    warn!(device_index = index, error = %e, "NVML device handle unavailable");
                    None
                }
            })
            .collect()
    }

    fn usage(&self, index: u32) -> Result<DeviceUsageSample> {
        let device = self
            .nvml
            .device_by_index(index)
            .with_context(|| format!("device {index} handle unavailable"))?;

        let utilization = device
            .utilization_rates()
            .with_context(|| format!("device {index} utilization query failed"))?;
        let memory = device
            .memory_info()
            .with_context(|| format!("device {index} memory query failed"))?;

        Ok(DeviceUsageSample {
            device_index: index,
            utilization_ratio: (utilization.gpu as f64 / 100.0).clamp(0.0, 1.0),
            memory_used_bytes: memory.used,
            memory_total_bytes: memory.total,
            temperature_celsius: device
                .temperature(TemperatureSensor::Gpu)
                .ok()
                .map(|t| t as f32),
            power_draw_watts: device.power_usage().ok().map(|mw| mw as f32 / 1000.0),
            encoder_utilization: device
                .encoder_utilization()
                .ok()
                .map(|u| (u.utilization as f64 / 100.0).clamp(0.0, 1.0)),
            decoder_utilization: device
                .decoder_utilization()
                .ok()
                .map(|u| (u.utilization as f64 / 100.0).clamp(0.0, 1.0)),
            captured_at: chrono::Utc::now().timestamp(),
        })
    }
}

/// Detect encode capabilities for one device.
///
/// Prefers the explicit encoder-capacity query (capacity > 0 means the
/// codec is available). When the driver does not support that query at
/// all, assume baseline H.264/HEVC encode for a recognized NVIDIA device:
/// a false positive costs one failed hardware attempt, a false negative
/// silently disables valid acceleration.
fn detect_capabilities(device: &Device<'_>) -> BTreeSet<EncodeCapability> {
    let mut capabilities = BTreeSet::new();
    let mut query_supported = false;

    for (encoder, capability) in [
        (EncoderType::H264, EncodeCapability::H264),
        (EncoderType::HEVC, EncodeCapability::Hevc),
    ] {
        match device.encoder_capacity(encoder) {
            Ok(capacity) => {
                query_supported = true;
                if capacity > 0 {
                    capabilities.insert(capability);
                }
            }
            Err(NvmlError::NotSupported) => {}
            Err(e) => {
                debug!(error = %e, "Encoder capacity query failed");
            }
        }
    }

    if !query_supported {
        capabilities.insert(EncodeCapability::H264);
        capabilities.insert(EncodeCapability::Hevc);
    }

    capabilities
}
