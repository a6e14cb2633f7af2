//! Engine library for resource-aware batch transcoding
//!
//! This crate provides the core functionality for:
//! - Host resource monitoring (compute, memory, storage, accelerators)
//! - Hardware encode capability discovery
//! - Memory- and core-aware batch sizing
//! - Concurrent batch execution with cooperative abort

pub mod batch;
pub mod device;
pub mod error;
pub mod models;
pub mod monitor;
pub mod observability;

pub use batch::{
    compute_batch_plan, BatchPlan, BatchProcessor, JobExecutor, JobProgress, ProgressFn, ResultFn,
    SizingInputs,
};
pub use device::{AcceleratorProbe, DeviceRegistry, NvmlProbe};
pub use error::EngineError;
pub use models::*;
pub use monitor::{
    CallbackId, DiskSpaceInfo, DiskSpaceProvider, HostProbe, ResourceMonitor,
    ResourceMonitorBuilder,
};
pub use observability::EngineMetrics;
