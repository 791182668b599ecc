//! Account-tier limits and the worker-count policy table.
//!
//! Every threshold the pipeline uses to size requests or pick a concurrency
//! level lives here so the policy can be read (and tested) in one place.

use serde::{Deserialize, Serialize};
use std::fmt;

const MB: u64 = 1024 * 1024;

/// Account class of the hosted transcription service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Constrained tier: 25MB hard payload ceiling
    #[default]
    Free,
    /// Larger-limit tier: 100MB hard payload ceiling
    Dev,
}

impl Tier {
    pub fn limits(self) -> &'static TierLimits {
        match self {
            Tier::Free => &FREE_LIMITS,
            Tier::Dev => &DEV_LIMITS,
        }
    }

    pub fn is_constrained(self) -> bool {
        matches!(self, Tier::Free)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Free => write!(f, "free tier ({}MB)", FREE_LIMITS.hard_ceiling_bytes / MB),
            Tier::Dev => write!(f, "dev tier ({}MB)", DEV_LIMITS.hard_ceiling_bytes / MB),
        }
    }
}

/// Size and encoding limits for one tier
#[derive(Debug, Clone, PartialEq)]
pub struct TierLimits {
    /// Nominal ceiling enforced by the service
    pub hard_ceiling_bytes: u64,
    /// Largest payload we are willing to send, leaving room for request overhead
    pub advisory_cap_bytes: u64,
    /// Longest chunk the planner will produce
    pub max_chunk_ms: u64,
    /// Bitrate used when encoding chunks
    pub chunk_bitrate_kbps: u32,
}

pub const FREE_LIMITS: TierLimits = TierLimits {
    hard_ceiling_bytes: 25 * MB,
    advisory_cap_bytes: 23 * MB,
    max_chunk_ms: 10 * 60 * 1000,
    chunk_bitrate_kbps: 64,
};

pub const DEV_LIMITS: TierLimits = TierLimits {
    hard_ceiling_bytes: 100 * MB,
    advisory_cap_bytes: 95 * MB,
    max_chunk_ms: 15 * 60 * 1000,
    chunk_bitrate_kbps: 192,
};

/// Files above this size are always chunked, whatever the tier
pub const DIRECT_MAX_BYTES: u64 = 25 * MB;

/// Audio at least this long is always chunked
pub const DIRECT_MAX_MS: u64 = 30 * 60 * 1000;

/// Chunk size target used for every tier
pub const CHUNK_TARGET_BYTES: u64 = 20 * MB;

/// One row of the worker-count table.
///
/// Applies to audio with `min_minutes <= duration < max_minutes` on `tier`.
/// The worker count is `chunks / chunks_per_worker`, clamped to `[floor, ceiling]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkerBand {
    pub tier: Tier,
    pub min_minutes: f64,
    pub max_minutes: f64,
    pub floor: usize,
    pub ceiling: usize,
    pub chunks_per_worker: usize,
}

pub const WORKER_BANDS: &[WorkerBand] = &[
    WorkerBand { tier: Tier::Free, min_minutes: 0.0, max_minutes: 30.0, floor: 1, ceiling: 1, chunks_per_worker: 1 },
    WorkerBand { tier: Tier::Dev, min_minutes: 0.0, max_minutes: 30.0, floor: 1, ceiling: 1, chunks_per_worker: 1 },
    WorkerBand { tier: Tier::Free, min_minutes: 30.0, max_minutes: 120.0, floor: 3, ceiling: 5, chunks_per_worker: 10 },
    WorkerBand { tier: Tier::Dev, min_minutes: 30.0, max_minutes: 120.0, floor: 5, ceiling: 10, chunks_per_worker: 5 },
    WorkerBand { tier: Tier::Free, min_minutes: 120.0, max_minutes: f64::INFINITY, floor: 2, ceiling: 3, chunks_per_worker: 20 },
    WorkerBand { tier: Tier::Dev, min_minutes: 120.0, max_minutes: f64::INFINITY, floor: 4, ceiling: 8, chunks_per_worker: 10 },
];

/// Pick the number of concurrent transcription workers for an asset.
///
/// Never returns more workers than there are chunks, and never less than one.
pub fn worker_count(duration_minutes: f64, chunk_count: usize, tier: Tier) -> usize {
    let band = WORKER_BANDS
        .iter()
        .find(|band| {
            band.tier == tier && duration_minutes >= band.min_minutes && duration_minutes < band.max_minutes
        });

    let workers = match band {
        Some(band) => (chunk_count / band.chunks_per_worker).clamp(band.floor, band.ceiling),
        None => 1,
    };

    workers.min(chunk_count).max(1)
}
