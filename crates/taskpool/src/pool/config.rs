//! Pool configuration
//!
//! Policy knobs for the dispatcher plus the per-worker parameters it passes
//! through to the worker factory untouched.

use std::time::Duration;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::worker::{WorkerKind, WorkerSpawnParams};

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Invalid configuration
    #[error("invalid pool configuration: {0}")]
    Invalid(String),
}

/// Lower bound on the worker set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinWorkers {
    /// Keep at least this many workers alive
    Count(usize),
    /// Keep the pool filled to `max_workers`
    Max,
}

impl Serialize for MinWorkers {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Count(count) => serializer.serialize_u64(*count as u64),
            Self::Max => serializer.serialize_str("max"),
        }
    }
}

impl<'de> Deserialize<'de> for MinWorkers {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct MinWorkersVisitor;

        impl Visitor<'_> for MinWorkersVisitor {
            type Value = MinWorkers;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a worker count or the string \"max\"")
            }

            fn visit_u64<E: de::Error>(self, count: u64) -> Result<Self::Value, E> {
                Ok(MinWorkers::Count(count as usize))
            }

            fn visit_i64<E: de::Error>(self, count: i64) -> Result<Self::Value, E> {
                if count < 0 {
                    return Err(E::custom("min_workers cannot be negative"));
                }
                Ok(MinWorkers::Count(count as usize))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                if value == "max" {
                    Ok(MinWorkers::Max)
                } else {
                    Err(E::custom(format!("unknown min_workers sentinel: {value}")))
                }
            }
        }

        deserializer.deserialize_any(MinWorkersVisitor)
    }
}

/// Worker pool configuration
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use taskpool::PoolConfig;
///
/// let config = PoolConfig::default()
///     .with_max_workers(4)
///     .with_round_robin(true)
///     .with_gradual_scaling(Duration::from_millis(250));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    /// Upper bound on the worker set
    pub max_workers: usize,

    /// Lower bound on the worker set, spawned eagerly and maintained on
    /// removal. `None` means no minimum. When the minimum exceeds
    /// `max_workers`, the maximum is raised to match.
    pub min_workers: Option<MinWorkers>,

    /// Queue bound. Submissions beyond it fail synchronously.
    pub max_queue_size: Option<usize>,

    /// Scaling window. When non-zero, at most one worker is created per
    /// window through the scaling path. Minimum top-ups are exempt.
    #[serde(with = "duration_millis")]
    pub gradual_scaling: Duration,

    /// Rotate dispatches through worker indices instead of scanning for the
    /// first available worker
    pub round_robin: bool,

    /// Transport flavor requested from the worker factory
    pub worker_kind: WorkerKind,

    /// Maximum concurrent in-flight calls per worker
    pub concurrency: usize,

    /// Per-worker lifetime call cap
    pub max_exec: Option<u64>,

    /// Flip workers to not-ready after each completed call
    pub mark_not_ready_after_exec: bool,

    /// How long a ready signal may take after a call
    #[serde(with = "option_duration_millis", default)]
    pub ready_timeout: Option<Duration>,

    /// How long the initial ready signal may take after spawn
    #[serde(with = "option_duration_millis", default)]
    pub init_ready_timeout: Option<Duration>,

    /// Script workers are started with, if any
    pub script: Option<String>,

    /// Extra spawn arguments forwarded to the transport
    pub fork_args: Vec<String>,

    /// Transport-specific spawn options
    pub fork_opts: serde_json::Map<String, Value>,

    /// First debug port to try when allocating per-worker ports
    pub debug_port_start: u16,
}

fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            min_workers: None,
            max_queue_size: None,
            gradual_scaling: Duration::ZERO,
            round_robin: false,
            worker_kind: WorkerKind::Auto,
            concurrency: 1,
            max_exec: None,
            mark_not_ready_after_exec: false,
            ready_timeout: None,
            init_ready_timeout: None,
            script: None,
            fork_args: vec![],
            fork_opts: serde_json::Map::new(),
            debug_port_start: 43210,
        }
    }
}

impl PoolConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the upper bound on the worker set
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// Set the lower bound on the worker set
    pub fn with_min_workers(mut self, min_workers: MinWorkers) -> Self {
        self.min_workers = Some(min_workers);
        self
    }

    /// Set the queue bound
    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = Some(max_queue_size);
        self
    }

    /// Set the scaling window
    pub fn with_gradual_scaling(mut self, window: Duration) -> Self {
        self.gradual_scaling = window;
        self
    }

    /// Enable or disable round-robin selection
    pub fn with_round_robin(mut self, round_robin: bool) -> Self {
        self.round_robin = round_robin;
        self
    }

    /// Set the transport flavor
    pub fn with_worker_kind(mut self, worker_kind: WorkerKind) -> Self {
        self.worker_kind = worker_kind;
        self
    }

    /// Set the per-worker concurrency
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set the per-worker lifetime call cap
    pub fn with_max_exec(mut self, max_exec: u64) -> Self {
        self.max_exec = Some(max_exec);
        self
    }

    /// Flip workers to not-ready after each completed call
    pub fn with_mark_not_ready_after_exec(mut self, flag: bool) -> Self {
        self.mark_not_ready_after_exec = flag;
        self
    }

    /// Set the post-call ready deadline
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = Some(timeout);
        self
    }

    /// Set the initial ready deadline
    pub fn with_init_ready_timeout(mut self, timeout: Duration) -> Self {
        self.init_ready_timeout = Some(timeout);
        self
    }

    /// Set the worker script
    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.script = Some(script.into());
        self
    }

    /// Set extra spawn arguments
    pub fn with_fork_args(mut self, fork_args: Vec<String>) -> Self {
        self.fork_args = fork_args;
        self
    }

    /// Set transport-specific spawn options
    pub fn with_fork_opts(mut self, fork_opts: serde_json::Map<String, Value>) -> Self {
        self.fork_opts = fork_opts;
        self
    }

    /// Set the first debug port to try
    pub fn with_debug_port_start(mut self, port: u16) -> Self {
        self.debug_port_start = port;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid(
                "max_workers must be at least 1".into(),
            ));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the effective (max, min) worker bounds
    ///
    /// The `Max` sentinel pins the minimum to the maximum; a numeric minimum
    /// above `max_workers` raises the maximum to match.
    pub fn resolved_bounds(&self) -> (usize, usize) {
        let min = match self.min_workers {
            None => 0,
            Some(MinWorkers::Max) => self.max_workers,
            Some(MinWorkers::Count(count)) => count,
        };
        (self.max_workers.max(min), min)
    }

    /// Assemble the spawn parameters handed to the worker factory
    pub(crate) fn spawn_params(&self) -> WorkerSpawnParams {
        WorkerSpawnParams {
            kind: self.worker_kind,
            script: self.script.clone(),
            fork_args: self.fork_args.clone(),
            fork_opts: self.fork_opts.clone(),
            debug_port: None,
            concurrency: self.concurrency,
            max_exec: self.max_exec,
            mark_not_ready_after_exec: self.mark_not_ready_after_exec,
            ready_timeout: self.ready_timeout,
            init_ready_timeout: self.init_ready_timeout,
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
