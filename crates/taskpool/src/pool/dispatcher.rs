//! The dispatcher core
//!
//! [`Pool`] owns the FIFO task queue and the ordered worker set. Submissions
//! append a task and advance the dispatch loop; each advance hands at most
//! one task to a worker and chains the next advance on that call's
//! settlement, so the loop is driven entirely by completions, ready signals
//! and the scaling timer.
//!
//! Worker selection runs affinity first, then round-robin, then a
//! first-available scan. Affinity and round-robin deliberately skip the
//! availability check: a pinned or rotated worker receives the call even
//! when busy and its own concurrency absorbs the ordering. Growth happens
//! after selection, so a saturated pick still triggers a new worker for
//! future dispatches without stealing the current task.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::pool::config::PoolConfig;
use crate::pool::stats::{PoolMetrics, PoolStats};
use crate::task::{new_task, TaskError, TaskHandle, TaskOptions, TaskRecord};
use crate::worker::{
    PortAllocator, Worker, WorkerDescriptor, WorkerError, WorkerEvent, WorkerEvents, WorkerFactory,
    WorkerSpawnOverrides, WorkerSpawnParams,
};

/// Pool API errors
#[derive(Debug, Error)]
pub enum PoolError {
    /// The queue bound was reached
    #[error("Max queue size of {0} reached")]
    QueueFull(usize),

    /// The pool no longer accepts submissions
    #[error("Pool terminated")]
    Terminated,

    /// The configuration failed validation
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),

    /// A worker transport error
    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),

    /// A task settlement error surfaced through a pool operation
    #[error("task failed: {0}")]
    Task(#[from] TaskError),

    /// The worker returned a malformed methods listing
    #[error("malformed methods listing from worker: {0}")]
    MalformedMethods(String),

    /// The proxy has no such method
    #[error("unknown method: {0}")]
    UnknownMethod(String),
}

/// Hook invoked right before a worker is spawned
pub type CreateWorkerHook =
    Arc<dyn Fn(&WorkerSpawnParams) -> Option<WorkerSpawnOverrides> + Send + Sync>;

/// Hook invoked after a worker has been disposed
pub type TerminateWorkerHook = Arc<dyn Fn(&WorkerDescriptor) + Send + Sync>;

/// Worker lifecycle hooks
///
/// `on_create_worker` may override individual spawn parameters but not
/// pool-level policy. Hooks run under the pool lock and must not call back
/// into the pool.
#[derive(Clone, Default)]
pub struct PoolHooks {
    pub on_create_worker: Option<CreateWorkerHook>,
    pub on_terminate_worker: Option<TerminateWorkerHook>,
}

impl PoolHooks {
    /// Create empty hooks
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker-creation hook
    pub fn on_create_worker<F>(mut self, hook: F) -> Self
    where
        F: Fn(&WorkerSpawnParams) -> Option<WorkerSpawnOverrides> + Send + Sync + 'static,
    {
        self.on_create_worker = Some(Arc::new(hook));
        self
    }

    /// Set the worker-disposal hook
    pub fn on_terminate_worker<F>(mut self, hook: F) -> Self
    where
        F: Fn(&WorkerDescriptor) + Send + Sync + 'static,
    {
        self.on_terminate_worker = Some(Arc::new(hook));
        self
    }
}

impl std::fmt::Debug for PoolHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolHooks")
            .field("on_create_worker", &self.on_create_worker.is_some())
            .field("on_terminate_worker", &self.on_terminate_worker.is_some())
            .finish()
    }
}

struct PoolState {
    workers: Vec<Arc<dyn Worker>>,
    queue: VecDeque<TaskRecord>,
    can_create_worker: bool,
    last_chosen: Option<usize>,
}

struct PoolInner {
    config: PoolConfig,
    max_workers: usize,
    min_workers: usize,
    hooks: PoolHooks,
    factory: Arc<dyn WorkerFactory>,
    ports: PortAllocator,
    events: WorkerEvents,
    state: Mutex<PoolState>,
    terminated: AtomicBool,
}

/// Worker-pool dispatcher
///
/// Cheap to clone; all clones share the same pool. Construction requires a
/// running Tokio runtime. Call [`Pool::terminate`] for an orderly shutdown;
/// dropping the last clone tears the workers down without draining.
///
/// # Example
///
/// ```ignore
/// use taskpool::{Pool, PoolConfig};
/// use taskpool::worker::local::{LocalWorkerFactory, MethodRegistry};
///
/// let mut registry = MethodRegistry::new();
/// registry.register("add", |params| async move {
///     Ok(serde_json::json!(params[0].as_i64().unwrap() + params[1].as_i64().unwrap()))
/// });
///
/// let pool = Pool::new(
///     Arc::new(LocalWorkerFactory::new(registry)),
///     PoolConfig::default().with_max_workers(2),
/// )?;
///
/// let result = pool.exec("add", vec![serde_json::json!(2), serde_json::json!(4)])?.await?;
/// assert_eq!(result, serde_json::json!(6));
///
/// pool.terminate(false, None).await?;
/// ```
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Create a pool without lifecycle hooks
    pub fn new(factory: Arc<dyn WorkerFactory>, config: PoolConfig) -> Result<Self, PoolError> {
        Self::with_hooks(factory, config, PoolHooks::default())
    }

    /// Create a pool with lifecycle hooks
    pub fn with_hooks(
        factory: Arc<dyn WorkerFactory>,
        config: PoolConfig,
        hooks: PoolHooks,
    ) -> Result<Self, PoolError> {
        config
            .validate()
            .map_err(|e| PoolError::InvalidConfig(e.to_string()))?;
        let (max_workers, min_workers) = config.resolved_bounds();

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(PoolInner {
            config,
            max_workers,
            min_workers,
            hooks,
            factory,
            ports: PortAllocator::new(),
            events: WorkerEvents::new(event_tx),
            state: Mutex::new(PoolState {
                workers: Vec::new(),
                queue: VecDeque::new(),
                can_create_worker: true,
                last_chosen: None,
            }),
            terminated: AtomicBool::new(false),
        });

        {
            let mut state = inner.state.lock();
            inner.ensure_min_workers(&mut state);
        }
        info!(
            max_workers,
            min_workers,
            round_robin = inner.config.round_robin,
            "pool started"
        );

        PoolInner::start_event_loop(&inner, event_rx);
        Ok(Self { inner })
    }

    /// Submit a method call
    ///
    /// Fails synchronously when the queue bound is reached or the pool is
    /// terminated. Otherwise the task is queued and the returned handle
    /// settles with the worker's result.
    pub fn exec(
        &self,
        method: impl Into<String>,
        params: Vec<Value>,
    ) -> Result<TaskHandle, PoolError> {
        self.exec_with_options(method, params, TaskOptions::default())
    }

    /// Submit a method call with per-task options
    pub fn exec_with_options(
        &self,
        method: impl Into<String>,
        params: Vec<Value>,
        options: TaskOptions,
    ) -> Result<TaskHandle, PoolError> {
        let handle = self.inner.enqueue(method.into(), params, options)?;
        Arc::clone(&self.inner).advance();
        Ok(handle)
    }

    /// Submit an inline source snippet for the worker's built-in `run` method
    ///
    /// The submission is rewritten to `("run", [source, params])`; evaluating
    /// the source is the transport's concern.
    pub fn run(
        &self,
        source: impl Into<String>,
        params: Vec<Value>,
    ) -> Result<TaskHandle, PoolError> {
        self.run_with_options(source, params, TaskOptions::default())
    }

    /// Like [`Pool::run`] with per-task options
    pub fn run_with_options(
        &self,
        source: impl Into<String>,
        params: Vec<Value>,
        options: TaskOptions,
    ) -> Result<TaskHandle, PoolError> {
        let rewritten = vec![Value::String(source.into()), Value::Array(params)];
        self.exec_with_options("run", rewritten, options)
    }

    /// Build a proxy over the worker's registered methods
    ///
    /// Submits the worker-provided `methods` introspection call and maps each
    /// returned name to a bound submitter.
    pub async fn proxy(&self) -> Result<PoolProxy, PoolError> {
        let listing = self.exec("methods", vec![])?.await?;
        let names = listing
            .as_array()
            .ok_or_else(|| PoolError::MalformedMethods(listing.to_string()))?
            .iter()
            .map(|name| {
                name.as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| PoolError::MalformedMethods(name.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PoolProxy {
            pool: self.clone(),
            methods: names,
        })
    }

    /// Terminate the pool
    ///
    /// Rejects every queued task, then terminates the workers. With `force`,
    /// running calls are aborted; otherwise each worker drains first, bounded
    /// by `timeout` when given. Every worker is removed and its disposal
    /// hook invoked regardless of the termination outcome. Idempotent; a
    /// second call resolves immediately.
    #[instrument(skip(self))]
    pub async fn terminate(&self, force: bool, timeout: Option<Duration>) -> Result<(), PoolError> {
        self.inner.terminate(force, timeout).await
    }

    /// Snapshot of queue and worker counts
    pub fn stats(&self) -> PoolStats {
        self.inner.stats()
    }

    /// Number of workers that may accept another call right now
    pub fn available_workers(&self) -> usize {
        self.inner.stats().available_workers
    }

    /// Aggregate of per-worker call counters
    pub fn metrics(&self) -> PoolMetrics {
        let state = self.inner.state.lock();
        let ready = state.workers.iter().filter(|w| w.available()).count();
        let per_worker: Vec<_> = state.workers.iter().map(|w| w.metrics()).collect();
        PoolMetrics::aggregate(&per_worker, ready)
    }

    /// The pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }
}

impl PoolInner {
    fn start_event_loop(inner: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<WorkerEvent>) {
        let weak = Arc::downgrade(inner);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                match event {
                    WorkerEvent::Ready(worker_id) => {
                        debug!(worker_id = %worker_id, "worker ready");
                        inner.advance();
                    }
                    WorkerEvent::Exit(worker_id) => {
                        warn!(worker_id = %worker_id, "worker exit signaled");
                        if let Err(error) = inner.remove_worker(worker_id).await {
                            debug!(worker_id = %worker_id, %error, "worker cleanup error");
                        }
                        Arc::clone(&inner).advance();
                    }
                }
            }
        });
    }

    fn enqueue(
        &self,
        method: String,
        params: Vec<Value>,
        options: TaskOptions,
    ) -> Result<TaskHandle, PoolError> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(PoolError::Terminated);
        }

        let (handle, resolver) = new_task();
        if let Some(timeout) = options.timeout {
            // Recorded now, armed when the task is handed to a worker.
            handle.timeout(timeout);
        }

        let mut state = self.state.lock();
        if let Some(max_queue_size) = self.config.max_queue_size {
            if state.queue.len() >= max_queue_size {
                return Err(PoolError::QueueFull(max_queue_size));
            }
        }
        debug!(%method, queued = state.queue.len() + 1, "task queued");
        state.queue.push_back(TaskRecord {
            method,
            params,
            options,
            resolver,
        });
        Ok(handle)
    }

    /// One step of the dispatch loop
    ///
    /// Picks at most one task. Cancelled tasks are skipped in place; a
    /// dispatched task re-invokes the loop from its settlement chain, a
    /// ready or exit event re-invokes it from the event loop.
    fn advance(self: Arc<Self>) {
        loop {
            if self.terminated.load(Ordering::SeqCst) {
                return;
            }

            let mut state = self.state.lock();
            let Some(front) = state.queue.front() else {
                return;
            };
            let affinity = front.options.affinity;
            let (worker, gate_armed) = self.select_worker(&mut state, affinity);
            if gate_armed {
                Self::arm_scaling_gate(&self);
            }
            let Some(worker) = worker else {
                return;
            };
            let Some(task) = state.queue.pop_front() else {
                return;
            };

            if !task.resolver.is_pending() {
                debug!(method = %task.method, "dropping task cancelled while queued");
                drop(state);
                continue;
            }

            let TaskRecord {
                method,
                params,
                options,
                resolver,
            } = task;
            resolver.mark_dispatched();

            // The handoff runs under the lock so selection and registration
            // are atomic; only the drain is awaited in the background, with
            // the next advance chained on its settlement.
            let drain = worker.exec(&method, params, resolver, &options);
            let pool = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(error) = drain.await {
                    if worker.terminated() {
                        let worker_id = worker.descriptor().id;
                        warn!(worker_id = %worker_id, %error, "worker died during execution");
                        if let Err(cleanup) = pool.remove_worker(worker_id).await {
                            debug!(worker_id = %worker_id, %cleanup, "worker cleanup error");
                        }
                    } else {
                        debug!(%method, %error, "execution settled with transport error");
                    }
                }
                pool.advance();
            });
            return;
        }
    }

    /// Choose a worker for the task at the head of the queue
    ///
    /// Returns the pick plus whether the scaling gate was consumed and its
    /// re-open timer must be armed by the caller.
    fn select_worker(
        &self,
        state: &mut PoolState,
        affinity: Option<usize>,
    ) -> (Option<Arc<dyn Worker>>, bool) {
        let mut chosen: Option<Arc<dyn Worker>> = None;
        let count = state.workers.len();

        if let Some(affinity) = affinity {
            if count > 0 {
                chosen = Some(Arc::clone(&state.workers[affinity % count]));
            }
        }

        if chosen.is_none() && self.config.round_robin && count > 0 {
            let next = match state.last_chosen {
                Some(index) => (index + 1) % count,
                None => 0,
            };
            state.last_chosen = Some(next);
            chosen = Some(Arc::clone(&state.workers[next]));
        }

        if chosen.is_none() {
            chosen = state.workers.iter().find(|w| w.available()).cloned();
        }

        // Growth runs after selection: a saturated affinity or round-robin
        // pick keeps the task, the new worker serves future dispatches.
        let mut gate_armed = false;
        if state.workers.len() < self.max_workers {
            let may_create = if self.config.gradual_scaling.is_zero() {
                true
            } else if state.can_create_worker {
                state.can_create_worker = false;
                gate_armed = true;
                true
            } else {
                false
            };

            if may_create {
                match self.create_worker() {
                    Ok(worker) => {
                        state.workers.push(Arc::clone(&worker));
                        if chosen.is_none() {
                            chosen = Some(worker);
                        }
                    }
                    Err(error) => warn!(%error, "failed to create worker"),
                }
            }
        }

        (chosen, gate_armed)
    }

    fn arm_scaling_gate(pool: &Arc<Self>) {
        let window = pool.config.gradual_scaling;
        let pool = Arc::clone(pool);
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            pool.state.lock().can_create_worker = true;
            debug!("scaling window elapsed, worker creation re-enabled");
            pool.advance();
        });
    }

    /// Top the worker set up to the configured minimum
    ///
    /// Exempt from the scaling gate: the minimum must be met immediately.
    fn ensure_min_workers(&self, state: &mut PoolState) {
        if self.terminated.load(Ordering::SeqCst) {
            return;
        }
        while state.workers.len() < self.min_workers {
            match self.create_worker() {
                Ok(worker) => state.workers.push(worker),
                Err(error) => {
                    warn!(%error, "failed to spawn minimum worker");
                    break;
                }
            }
        }
    }

    fn create_worker(&self) -> Result<Arc<dyn Worker>, WorkerError> {
        let mut params = self.config.spawn_params();
        if let Some(hook) = &self.hooks.on_create_worker {
            if let Some(overrides) = hook(&params) {
                overrides.apply(&mut params);
            }
        }

        let debug_port = self.ports.next_available(self.config.debug_port_start);
        params.debug_port = Some(debug_port);
        debug!(debug_port, "spawning worker");

        match self.factory.spawn(params, self.events.clone()) {
            Ok(worker) => Ok(worker),
            Err(error) => {
                self.ports.release(debug_port);
                Err(error)
            }
        }
    }

    /// Remove a worker from the pool and dispose of it
    ///
    /// Removal is synchronous under the lock so the minimum top-up never
    /// double counts. Already-removed ids are a no-op, which keeps the
    /// disposal hook at exactly one invocation per worker.
    async fn remove_worker(&self, worker_id: Uuid) -> Result<(), WorkerError> {
        let worker = {
            let mut state = self.state.lock();
            let Some(index) = state
                .workers
                .iter()
                .position(|w| w.descriptor().id == worker_id)
            else {
                return Ok(());
            };
            let worker = state.workers.remove(index);
            if let Some(port) = worker.descriptor().debug_port {
                self.ports.release(port);
            }
            self.ensure_min_workers(&mut state);
            worker
        };

        let descriptor = worker.descriptor();
        let result = worker.terminate(false).await;
        if let Some(hook) = &self.hooks.on_terminate_worker {
            hook(&descriptor);
        }
        info!(worker_id = %descriptor.id, "worker removed");
        result
    }

    async fn terminate(&self, force: bool, timeout: Option<Duration>) -> Result<(), PoolError> {
        self.terminated.store(true, Ordering::SeqCst);

        let (queued, workers) = {
            let mut state = self.state.lock();
            let queued: Vec<TaskRecord> = state.queue.drain(..).collect();
            let workers = std::mem::take(&mut state.workers);
            state.last_chosen = None;
            (queued, workers)
        };

        if !queued.is_empty() {
            info!(rejected = queued.len(), "rejecting queued tasks");
            for task in &queued {
                task.resolver.reject(TaskError::PoolTerminated);
            }
        }

        let terminations = workers.into_iter().map(|worker| {
            let descriptor = worker.descriptor();
            async move {
                let result = match timeout {
                    Some(deadline) => worker.terminate_with_timeout(force, deadline).await,
                    None => worker.terminate(force).await,
                };
                (descriptor, result)
            }
        });

        let mut first_error = None;
        for (descriptor, result) in join_all(terminations).await {
            if let Some(port) = descriptor.debug_port {
                self.ports.release(port);
            }
            if let Some(hook) = &self.hooks.on_terminate_worker {
                hook(&descriptor);
            }
            if let Err(error) = result {
                warn!(worker_id = %descriptor.id, %error, "worker termination failed");
                first_error.get_or_insert(error);
            }
        }

        info!("pool terminated");
        match first_error {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }

    fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let total_workers = state.workers.len();
        let busy_workers = state.workers.iter().filter(|w| w.busy()).count();
        let available_workers = state.workers.iter().filter(|w| w.available()).count();
        PoolStats {
            total_workers,
            busy_workers,
            available_workers,
            idle_workers: total_workers - busy_workers,
            pending_tasks: state.queue.len(),
            active_tasks: busy_workers,
        }
    }
}

/// Method-name proxy over a pool
///
/// Built by [`Pool::proxy`] from the worker's `methods` introspection call.
#[derive(Clone)]
pub struct PoolProxy {
    pool: Pool,
    methods: Vec<String>,
}

impl PoolProxy {
    /// The method names the worker advertised
    pub fn methods(&self) -> &[String] {
        &self.methods
    }

    /// Whether the worker advertised a method
    pub fn contains(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m == method)
    }

    /// Submit a call to an advertised method
    pub fn call(&self, method: &str, params: Vec<Value>) -> Result<TaskHandle, PoolError> {
        if !self.contains(method) {
            return Err(PoolError::UnknownMethod(method.to_string()));
        }
        self.pool.exec(method, params)
    }
}
