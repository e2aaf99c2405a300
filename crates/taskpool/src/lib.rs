//! # taskpool
//!
//! A worker-pool dispatcher: named-task submissions from a single
//! controlling process are dispatched to a bounded set of long-lived
//! workers, each able to execute one or more concurrent calls. The caller
//! gets a future-like [`TaskHandle`] per task that resolves with the
//! worker's result or a structured failure.
//!
//! ## Features
//!
//! - **Selection policy**: affinity pinning, round-robin rotation, or
//!   first-available scan, in that priority order
//! - **Bounded scaling**: lazy worker creation between `min_workers` and
//!   `max_workers`, optionally throttled to one spawn per window
//! - **Cancellation and timeouts**: cancel queued tasks before they reach a
//!   worker; timeouts are armed at dispatch so queue time never counts
//! - **Crash recovery**: dead workers are removed and the minimum pool size
//!   restored; in-flight calls on the dead worker reject
//! - **Termination**: graceful drain or forced abort, with a hard deadline
//!
//! ## Architecture
//!
//! ```text
//! caller ──submit──▶ Pool ──advance──▶ Worker (opaque transport)
//!    ▲                 │                   │
//!    └───TaskHandle────┴──────settle───────┘
//! ```
//!
//! The worker transport is pluggable through [`worker::WorkerFactory`]. The
//! in-process transport in [`worker::local`] is the reference
//! implementation and the one the test-suite drives.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use serde_json::json;
//! use taskpool::prelude::*;
//!
//! let mut registry = MethodRegistry::new();
//! registry.register("add", |params| async move {
//!     Ok(json!(params[0].as_i64().unwrap() + params[1].as_i64().unwrap()))
//! });
//!
//! let pool = Pool::new(
//!     Arc::new(LocalWorkerFactory::new(registry)),
//!     PoolConfig::default().with_max_workers(2),
//! )?;
//!
//! let sum = pool.exec("add", vec![json!(2), json!(4)])?.await?;
//! assert_eq!(sum, json!(6));
//!
//! pool.terminate(false, None).await?;
//! ```

pub mod pool;
pub mod task;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::pool::{MinWorkers, Pool, PoolConfig, PoolError, PoolHooks, PoolProxy};
    pub use crate::task::{TaskError, TaskHandle, TaskOptions};
    pub use crate::worker::local::{LocalWorkerFactory, MethodRegistry};
    pub use crate::worker::{Worker, WorkerError, WorkerFactory, WorkerKind};
}

// Re-export key types at crate root
pub use pool::{
    MinWorkers, Pool, PoolConfig, PoolError, PoolHooks, PoolMetrics, PoolProxy, PoolStats,
};
pub use task::{Resolver, TaskError, TaskHandle, TaskOptions, TaskResult};
pub use worker::{
    Worker, WorkerDescriptor, WorkerError, WorkerEvent, WorkerEvents, WorkerFactory, WorkerKind,
    WorkerMetrics, WorkerSpawnOverrides, WorkerSpawnParams,
};
