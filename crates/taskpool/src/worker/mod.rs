//! Worker transport contract
//!
//! The dispatcher treats a worker as an opaque handle: it submits calls,
//! queries readiness and busyness, and terminates it. The transport behind
//! the handle (an OS process, a thread, a browser worker) is chosen by the
//! [`WorkerFactory`] the pool is constructed with and is invisible to the
//! dispatch core.
//!
//! Workers talk back to the pool through the [`WorkerEvents`] sink the
//! factory receives at spawn time: `Ready` when the worker can accept work,
//! `Exit` when it died and must be removed.

pub mod local;
mod ports;

pub use ports::PortAllocator;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::task::{Resolver, TaskOptions};

/// Worker transport errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkerError {
    /// The worker is in its terminal state and cannot accept calls
    #[error("worker is terminated")]
    Terminated,

    /// No method registered under the requested name
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// The worker died while executing
    #[error("worker exited during execution")]
    Crashed,

    /// Graceful termination did not finish before the deadline
    #[error("worker termination timed out")]
    ShutdownTimeout,

    /// The transport failed to spawn a worker
    #[error("failed to spawn worker: {0}")]
    Spawn(String),
}

/// Transport flavor a factory should produce
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    /// Let the factory pick the best fit for the platform
    #[default]
    Auto,
    /// OS thread
    Thread,
    /// OS process
    Process,
    /// Browser worker
    Web,
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Thread => write!(f, "thread"),
            Self::Process => write!(f, "process"),
            Self::Web => write!(f, "web"),
        }
    }
}

/// Identity and spawn context of a live worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerDescriptor {
    /// Unique worker id
    pub id: Uuid,

    /// Script the worker was started with, if any
    pub script: Option<String>,

    /// Extra arguments handed to the transport at spawn
    pub fork_args: Vec<String>,

    /// Transport-specific spawn options
    pub fork_opts: serde_json::Map<String, Value>,

    /// Debug port held by this worker
    pub debug_port: Option<u16>,

    /// When the worker was spawned
    pub started_at: DateTime<Utc>,
}

/// Parameters a factory receives for each spawn
#[derive(Debug, Clone)]
pub struct WorkerSpawnParams {
    /// Transport flavor
    pub kind: WorkerKind,

    /// Script to load, if any
    pub script: Option<String>,

    /// Extra spawn arguments
    pub fork_args: Vec<String>,

    /// Transport-specific spawn options
    pub fork_opts: serde_json::Map<String, Value>,

    /// Debug port allocated for this worker
    pub debug_port: Option<u16>,

    /// Maximum concurrent in-flight calls on this worker
    pub concurrency: usize,

    /// Lifetime call cap, after which the worker retires
    pub max_exec: Option<u64>,

    /// Flip the worker to not-ready after each completed call
    pub mark_not_ready_after_exec: bool,

    /// How long a ready signal may take after a call
    pub ready_timeout: Option<Duration>,

    /// How long the initial ready signal may take after spawn
    pub init_ready_timeout: Option<Duration>,
}

/// Per-parameter overrides returned by the worker-creation hook
///
/// Only the individual factory parameters can be overridden. Pool-level
/// policy (worker bounds, queue size, scaling) is not reachable from here.
#[derive(Debug, Clone, Default)]
pub struct WorkerSpawnOverrides {
    pub script: Option<Option<String>>,
    pub fork_args: Option<Vec<String>>,
    pub fork_opts: Option<serde_json::Map<String, Value>>,
    pub concurrency: Option<usize>,
    pub max_exec: Option<Option<u64>>,
    pub mark_not_ready_after_exec: Option<bool>,
    pub ready_timeout: Option<Option<Duration>>,
    pub init_ready_timeout: Option<Option<Duration>>,
}

impl WorkerSpawnOverrides {
    /// Merge the overrides into the spawn parameters
    pub fn apply(&self, params: &mut WorkerSpawnParams) {
        if let Some(script) = &self.script {
            params.script = script.clone();
        }
        if let Some(fork_args) = &self.fork_args {
            params.fork_args = fork_args.clone();
        }
        if let Some(fork_opts) = &self.fork_opts {
            params.fork_opts = fork_opts.clone();
        }
        if let Some(concurrency) = self.concurrency {
            params.concurrency = concurrency;
        }
        if let Some(max_exec) = self.max_exec {
            params.max_exec = max_exec;
        }
        if let Some(flag) = self.mark_not_ready_after_exec {
            params.mark_not_ready_after_exec = flag;
        }
        if let Some(ready_timeout) = self.ready_timeout {
            params.ready_timeout = ready_timeout;
        }
        if let Some(init_ready_timeout) = self.init_ready_timeout {
            params.init_ready_timeout = init_ready_timeout;
        }
    }
}

/// Per-worker call counters, aggregated by the pool
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkerMetrics {
    /// Total time spent executing calls
    #[serde(with = "duration_millis")]
    pub total_time: Duration,

    /// Shortest completed call, absent until the first call finishes
    #[serde(with = "option_duration_millis")]
    pub min_time: Option<Duration>,

    /// Longest completed call
    #[serde(with = "option_duration_millis")]
    pub max_time: Option<Duration>,

    /// Most recently completed call
    #[serde(with = "option_duration_millis")]
    pub last_time: Option<Duration>,

    /// Number of completed calls
    pub requests: u64,

    /// Fraction of the worker's uptime spent executing
    pub utilization: f64,
}

/// Lifecycle signals a worker sends back to the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEvent {
    /// The worker became ready to accept work
    Ready(Uuid),
    /// The worker died and must be removed from the pool
    Exit(Uuid),
}

/// Sink for worker lifecycle signals
///
/// Handed to the factory at spawn time. Cheap to clone; transports keep one
/// per worker.
#[derive(Clone)]
pub struct WorkerEvents {
    tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl WorkerEvents {
    pub(crate) fn new(tx: mpsc::UnboundedSender<WorkerEvent>) -> Self {
        Self { tx }
    }

    /// Signal that the worker may accept work
    pub fn ready(&self, worker_id: Uuid) {
        let _ = self.tx.send(WorkerEvent::Ready(worker_id));
    }

    /// Signal that the worker died
    pub fn exit(&self, worker_id: Uuid) {
        let _ = self.tx.send(WorkerEvent::Exit(worker_id));
    }
}

/// Opaque per-worker controller
///
/// Implementations live outside the dispatch core. The in-process transport
/// in [`local`] is the reference implementation.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Hand a call to the transport
    ///
    /// Handing over is synchronous: by the time this returns, the call is
    /// registered and [`Worker::busy`]/[`Worker::available`] reflect it. It
    /// runs under the pool lock and must not call back into the pool. The
    /// passed-in resolver is settled with the call result. The returned
    /// future completes when the call is fully drained; the dispatcher
    /// chains its next advance on it. A rejection combined with
    /// [`Worker::terminated`] returning true is how the dispatcher detects a
    /// crash.
    fn exec(
        &self,
        method: &str,
        params: Vec<Value>,
        resolver: Resolver,
        options: &TaskOptions,
    ) -> BoxFuture<'static, Result<(), WorkerError>>;

    /// Whether the worker may accept another call right now
    fn available(&self) -> bool;

    /// Whether the worker is currently executing at least one call
    fn busy(&self) -> bool;

    /// Whether the worker reached its terminal state. Never reusable.
    fn terminated(&self) -> bool;

    /// End the worker. With `force`, running calls are aborted; otherwise
    /// the worker drains first.
    async fn terminate(&self, force: bool) -> Result<(), WorkerError>;

    /// Like [`Worker::terminate`] with a hard deadline, after which running
    /// calls are aborted regardless of `force`.
    async fn terminate_with_timeout(
        &self,
        force: bool,
        deadline: Duration,
    ) -> Result<(), WorkerError>;

    /// Identity and spawn context
    fn descriptor(&self) -> WorkerDescriptor;

    /// Call counters for pool aggregation
    fn metrics(&self) -> WorkerMetrics;
}

/// Spawns workers for the pool
pub trait WorkerFactory: Send + Sync {
    /// Create a worker from the merged spawn parameters
    ///
    /// Must not call back into the pool; spawning happens under the pool
    /// lock so the min-worker top-up cannot double count.
    fn spawn(
        &self,
        params: WorkerSpawnParams,
        events: WorkerEvents,
    ) -> Result<Arc<dyn Worker>, WorkerError>;
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

/// Serde support for Option<Duration> as milliseconds
mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => d.as_millis().serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
