//! Worker-pool dispatcher
//!
//! This module provides:
//! - [`Pool`] - the dispatcher: FIFO queue, worker selection, scaling,
//!   lifecycle
//! - [`PoolConfig`] - policy knobs and worker-factory pass-throughs
//! - [`PoolHooks`] - worker creation/disposal hooks
//! - [`PoolStats`] / [`PoolMetrics`] - introspection counters
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Pool                                │
//! │  ┌──────────────┐   ┌──────────────────────────────────┐    │
//! │  │  task queue  │──▶│  advance (one dispatch per step)  │    │
//! │  │   (FIFO)     │   │  affinity → round-robin → scan    │    │
//! │  └──────────────┘   └──────────────┬───────────────────┘    │
//! │                                    │ exec                    │
//! │  ┌─────────────────────────────────▼───────────────────┐    │
//! │  │   workers (ordered, min..max, gradual scaling)      │    │
//! │  └─────────────────────────────────┬───────────────────┘    │
//! │                                    │ ready / exit            │
//! │  ┌─────────────────────────────────▼───────────────────┐    │
//! │  │   event funnel (single consumer, crash recovery)    │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod config;
mod dispatcher;
mod stats;

pub use config::{ConfigError, MinWorkers, PoolConfig};
pub use dispatcher::{CreateWorkerHook, Pool, PoolError, PoolHooks, PoolProxy, TerminateWorkerHook};
pub use stats::{PoolMetrics, PoolStats};
