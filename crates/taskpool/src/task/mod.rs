//! Task submissions and their pending results
//!
//! This module provides:
//! - [`TaskOptions`] - per-task overrides (affinity, timeout, transport
//!   passthrough)
//! - [`TaskHandle`] / [`Resolver`] - the settle-once pending-result pair
//! - [`TaskError`] - the settlement error surface

mod handle;

pub use handle::{Resolver, TaskError, TaskHandle, TaskResult};

pub(crate) use handle::new_task;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-task overrides
///
/// Keys the dispatcher does not recognize are carried in `passthrough` and
/// forwarded to the worker transport untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskOptions {
    /// Pin the task to `workers[affinity % worker_count]`
    ///
    /// Affinity deliberately skips the availability check: the chosen worker
    /// receives the call even when busy, and its own concurrency absorbs the
    /// ordering.
    pub affinity: Option<usize>,

    /// Per-task timeout, armed when the task is handed to a worker
    #[serde(with = "option_duration_millis", default)]
    pub timeout: Option<Duration>,

    /// Transport-level options forwarded to the worker
    #[serde(flatten)]
    pub passthrough: serde_json::Map<String, Value>,
}

impl TaskOptions {
    /// Create empty options
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the task to a worker index
    pub fn with_affinity(mut self, affinity: usize) -> Self {
        self.affinity = Some(affinity);
        self
    }

    /// Set the dispatch-armed timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Add a transport-level passthrough option
    pub fn with_passthrough(mut self, key: impl Into<String>, value: Value) -> Self {
        self.passthrough.insert(key.into(), value);
        self
    }
}

/// Envelope binding a submitted call to its pending result
///
/// Lives in the dispatcher queue until a worker is selected. Once handed to
/// a worker it is never re-queued; a crash rejects the resolver instead.
pub(crate) struct TaskRecord {
    pub method: String,
    pub params: Vec<Value>,
    pub options: TaskOptions,
    pub resolver: Resolver,
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
