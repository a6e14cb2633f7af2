//! Batch sizing heuristics
//!
//! Turns a job list, a live memory sample, and host core count into a safe
//! batch-size/concurrency pair. The computation is pure over
//! [`SizingInputs`] so property tests can inject synthetic memory and core
//! values; only [`SizingInputs::from_files`] touches the OS.

use std::path::PathBuf;
use tracing::debug;

/// Files sampled to estimate the average input size.
const SAMPLE_FILE_COUNT: usize = 10;

/// Assumed average input size when no sampled file is accessible.
const DEFAULT_AVG_FILE_BYTES: u64 = 512 * 1024 * 1024;

/// Floor for the sampled average, to keep downstream division sane.
const MIN_AVG_FILE_BYTES: u64 = 102 * 1024 * 1024;

/// Fraction of available memory the batch is allowed to claim.
const MEMORY_HEADROOM: f64 = 0.8;

/// Fraction of logical cores used when no concurrency override is given.
const CORE_FRACTION: f64 = 0.75;

/// Transcode working set relative to input size.
const WORKING_SET_FACTOR: u64 = 2;

/// Inputs to the batch size computation.
#[derive(Debug, Clone)]
pub struct SizingInputs {
    pub job_count: usize,
    /// Sizes of up to [`SAMPLE_FILE_COUNT`] representative input files.
    pub sampled_file_bytes: Vec<u64>,
    pub available_memory_bytes: u64,
    pub logical_cores: usize,
    /// Explicit worker-count override; `None` derives one from core count.
    pub concurrency_override: Option<usize>,
}

impl SizingInputs {
    /// Build inputs by sampling the first files of the job list on disk.
    /// Inaccessible files are skipped; an empty sample falls back to the
    /// default size estimate.
    pub fn from_files(
        paths: &[PathBuf],
        available_memory_bytes: u64,
        concurrency_override: Option<usize>,
    ) -> Self {
        let sampled_file_bytes = paths
            .iter()
            .take(SAMPLE_FILE_COUNT)
            .filter_map(|path| std::fs::metadata(path).ok().map(|m| m.len()))
            .collect();

        let logical_cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            job_count: paths.len(),
            sampled_file_bytes,
            available_memory_bytes,
            logical_cores,
            concurrency_override,
        }
    }
}

/// Computed plan: how many jobs each worker takes per batch, and how many
/// workers to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlan {
    pub batch_size: usize,
    pub max_concurrency: usize,
    /// Estimated working memory per concurrent job.
    pub per_job_memory_bytes: u64,
}

/// Compute a safe batch size for the given inputs.
pub fn compute(inputs: &SizingInputs) -> BatchPlan {
    let max_concurrency = inputs
        .concurrency_override
        .unwrap_or((inputs.logical_cores as f64 * CORE_FRACTION) as usize)
        .max(1);

    let average_file_bytes = if inputs.sampled_file_bytes.is_empty() {
        DEFAULT_AVG_FILE_BYTES
    } else {
        let sum: u64 = inputs.sampled_file_bytes.iter().sum();
        (sum / inputs.sampled_file_bytes.len() as u64).max(MIN_AVG_FILE_BYTES)
    };
    let per_job_memory_bytes = average_file_bytes * WORKING_SET_FACTOR;

    // Degenerate and trivially-parallel cases need no batching.
    if inputs.job_count == 0 || inputs.job_count <= max_concurrency {
        return BatchPlan {
            batch_size: 1,
            max_concurrency,
            per_job_memory_bytes,
        };
    }

    let ideal_batch = inputs.job_count.div_ceil(max_concurrency);

    let memory_budget = inputs.available_memory_bytes as f64 * MEMORY_HEADROOM;
    let jobs_in_memory = memory_budget / per_job_memory_bytes as f64;
    let memory_constrained_batch = ((jobs_in_memory / max_concurrency as f64) as usize).max(1);

    let mut batch_size = ideal_batch.min(memory_constrained_batch);

    // Load-balance nicety only: prefer a nearby size that divides the job
    // list evenly, keeping the original when none does.
    if inputs.job_count % batch_size != 0 {
        if let Some(even) =
            (batch_size..=batch_size + 2).find(|candidate| inputs.job_count % candidate == 0)
        {
            batch_size = even;
        }
    }

    debug!(
        job_count = inputs.job_count,
        max_concurrency,
        ideal_batch,
        memory_constrained_batch,
        batch_size,
        per_job_memory_bytes,
        "Computed batch plan"
    );

    BatchPlan {
        batch_size,
        max_concurrency,
        per_job_memory_bytes,
    }
}
