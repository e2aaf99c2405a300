//! Pool introspection counters
//!
//! [`PoolStats`] is the cheap queue/worker snapshot; [`PoolMetrics`] is the
//! aggregation of per-worker call counters.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::worker::WorkerMetrics;

/// Snapshot of queue and worker counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Workers currently in the pool
    pub total_workers: usize,

    /// Workers executing at least one call
    pub busy_workers: usize,

    /// Workers that may accept another call right now
    pub available_workers: usize,

    /// Workers executing nothing
    pub idle_workers: usize,

    /// Tasks waiting in the queue
    pub pending_tasks: usize,

    /// Tasks being executed
    pub active_tasks: usize,
}

/// Aggregate of per-worker call counters
///
/// `min_time` is seeded empty rather than zero, so a pool that has completed
/// no calls reports zero instead of winning every comparison.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoolMetrics {
    /// Workers currently in the pool
    pub total_workers: usize,

    /// Workers that may accept another call right now
    pub ready_workers: usize,

    /// Completed calls across all workers
    pub requests: u64,

    /// Total execution time across all workers
    #[serde(with = "duration_millis")]
    pub total_time: Duration,

    /// Shortest completed call across all workers
    #[serde(with = "duration_millis")]
    pub min_time: Duration,

    /// Longest completed call across all workers
    #[serde(with = "duration_millis")]
    pub max_time: Duration,

    /// Most recently completed call across all workers
    #[serde(with = "duration_millis")]
    pub last_time: Duration,

    /// Mean worker utilization
    pub avg_utilization: f64,
}

impl PoolMetrics {
    /// Reduce per-worker counters into the pool aggregate
    pub(crate) fn aggregate(workers: &[WorkerMetrics], ready_workers: usize) -> Self {
        let mut total_time = Duration::ZERO;
        let mut requests = 0u64;
        let mut min_time: Option<Duration> = None;
        let mut max_time: Option<Duration> = None;
        let mut last_time: Option<Duration> = None;
        let mut utilization_sum = 0.0;

        for metrics in workers {
            total_time += metrics.total_time;
            requests += metrics.requests;
            utilization_sum += metrics.utilization;
            if let Some(time) = metrics.min_time {
                min_time = Some(min_time.map_or(time, |current| current.min(time)));
            }
            if let Some(time) = metrics.max_time {
                max_time = Some(max_time.map_or(time, |current| current.max(time)));
            }
            if let Some(time) = metrics.last_time {
                last_time = Some(last_time.map_or(time, |current| current.max(time)));
            }
        }

        Self {
            total_workers: workers.len(),
            ready_workers,
            requests,
            total_time,
            min_time: min_time.unwrap_or(Duration::ZERO),
            max_time: max_time.unwrap_or(Duration::ZERO),
            last_time: last_time.unwrap_or(Duration::ZERO),
            avg_utilization: if workers.is_empty() {
                0.0
            } else {
                utilization_sum / workers.len() as f64
            },
        }
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
