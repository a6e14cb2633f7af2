//! Host resource probes backed by sysinfo
//!
//! Wraps the OS-level queries behind the [`HostProbe`] trait so the monitor
//! tick can be driven by fakes in tests. CPU utilization is meaningful only
//! across successive refreshes, which the monitor's repeating tick provides.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use sysinfo::{Disks, Pid, ProcessesToUpdate, System};

/// One host-level reading for a single resource kind.
#[derive(Debug, Clone)]
pub struct HostReading {
    /// Utilization in `[0, 1]`.
    pub utilization_ratio: f64,
    pub available: u64,
    pub total: u64,
    pub detail: HashMap<String, serde_json::Value>,
}

/// Live usage of a single tracked process.
#[derive(Debug, Clone, Copy)]
pub struct ProcessUsage {
    /// CPU usage in percent; may exceed 100 on multi-core hosts.
    pub cpu_percent: f32,
    pub memory_bytes: u64,
}

/// Trait for host metric query implementations
pub trait HostProbe: Send + Sync {
    /// Sample aggregate CPU utilization.
    fn compute(&self) -> Result<HostReading>;

    /// Sample physical memory utilization.
    fn memory(&self) -> Result<HostReading>;

    /// Sample disk utilization for the filesystem containing `path`.
    fn storage(&self, path: &Path) -> Result<HostReading>;

    /// Live usage of one process, or `None` once it has exited.
    fn process_usage(&self, pid: u32) -> Option<ProcessUsage>;

    /// Logical core count.
    fn logical_cores(&self) -> usize;
}

/// Cached disk-space view offered by an external collaborator.
#[derive(Debug, Clone, Copy)]
pub struct DiskSpaceInfo {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    /// Utilization in `[0, 1]`.
    pub utilization: f64,
}

/// Collaborator contract for storage sampling. The monitor prefers this
/// view to avoid duplicate OS calls and falls back to a direct query when
/// it fails.
pub trait DiskSpaceProvider: Send + Sync {
    fn disk_info(&self, path: &Path) -> Result<DiskSpaceInfo>;
}

/// Host probe that uses the `sysinfo` crate.
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut system = System::new_all();
        system.refresh_all();
        Self {
            system: Mutex::new(system),
        }
    }

    fn lock_system(&self) -> std::sync::MutexGuard<'_, System> {
        // A panic while holding the lock leaves the System usable; recover
        // rather than poisoning every later tick.
        self.system.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HostProbe for SysinfoProbe {
    fn compute(&self) -> Result<HostReading> {
        let mut system = self.lock_system();
        system.refresh_cpu_all();

        let cores = system.cpus().len();
        if cores == 0 {
            return Err(anyhow!("no CPUs reported by the OS"));
        }

        let ratio = (system.global_cpu_usage() as f64 / 100.0).clamp(0.0, 1.0);
        let per_core: Vec<f64> = system
            .cpus()
            .iter()
            .map(|cpu| (cpu.cpu_usage() as f64 / 100.0).clamp(0.0, 1.0))
            .collect();

        let mut detail = HashMap::new();
        detail.insert("logical_cores".to_string(), serde_json::json!(cores));
        detail.insert("per_core".to_string(), serde_json::json!(per_core));

        // "Available" compute is expressed in idle core equivalents.
        let available = ((1.0 - ratio) * cores as f64).round() as u64;
        Ok(HostReading {
            utilization_ratio: ratio,
            available,
            total: cores as u64,
            detail,
        })
    }

    fn memory(&self) -> Result<HostReading> {
        let mut system = self.lock_system();
        system.refresh_memory();

        let total = system.total_memory();
        if total == 0 {
            return Err(anyhow!("total memory reported as zero"));
        }
        let available = system.available_memory();
        let used = system.used_memory();

        let mut detail = HashMap::new();
        detail.insert("used_bytes".to_string(), serde_json::json!(used));
        detail.insert(
            "swap_used_bytes".to_string(),
            serde_json::json!(system.used_swap()),
        );

        Ok(HostReading {
            utilization_ratio: (used as f64 / total as f64).clamp(0.0, 1.0),
            available,
            total,
            detail,
        })
    }

    fn storage(&self, path: &Path) -> Result<HostReading> {
        let disks = Disks::new_with_refreshed_list();

        // Pick the mounted filesystem with the longest mount point that is
        // a prefix of the queried path.
        let disk = disks
            .iter()
            .filter(|d| path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .ok_or_else(|| anyhow!("no mounted filesystem contains {}", path.display()))?;

        let total = disk.total_space();
        if total == 0 {
            return Err(anyhow!(
                "filesystem at {} reports zero capacity",
                disk.mount_point().display()
            ));
        }
        let available = disk.available_space();
        let used = total.saturating_sub(available);

        let mut detail = HashMap::new();
        detail.insert(
            "mount_point".to_string(),
            serde_json::json!(disk.mount_point().to_string_lossy()),
        );

        Ok(HostReading {
            utilization_ratio: (used as f64 / total as f64).clamp(0.0, 1.0),
            available,
            total,
            detail,
        })
    }

    fn process_usage(&self, pid: u32) -> Option<ProcessUsage> {
        let mut system = self.lock_system();
        let pid = Pid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

        system.process(pid).map(|process| ProcessUsage {
            cpu_percent: process.cpu_usage(),
            memory_bytes: process.memory(),
        })
    }

    fn logical_cores(&self) -> usize {
        self.lock_system().cpus().len().max(1)
    }
}

/// Default path used for storage sampling when the caller does not supply
/// one: the filesystem holding the working directory.
pub(crate) fn default_storage_path() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"))
}
