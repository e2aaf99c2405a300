//! In-process worker transport
//!
//! Executes registered async method handlers on the host runtime. This is
//! the thread-flavored reference transport: it honors the full worker
//! contract (concurrency, lifetime call caps, readiness, graceful and
//! forced termination) without leaving the process, which also makes it the
//! transport the test-suite drives.
//!
//! # Example
//!
//! ```ignore
//! use taskpool::worker::local::{LocalWorkerFactory, MethodRegistry};
//!
//! let mut registry = MethodRegistry::new();
//! registry.register("add", |params| async move {
//!     let a = params[0].as_i64().unwrap_or(0);
//!     let b = params[1].as_i64().unwrap_or(0);
//!     Ok(serde_json::json!(a + b))
//! });
//!
//! let factory = LocalWorkerFactory::new(registry);
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::task::{Resolver, TaskError, TaskOptions};
use crate::worker::{
    Worker, WorkerDescriptor, WorkerError, WorkerEvents, WorkerFactory, WorkerMetrics,
    WorkerSpawnParams,
};

/// Result of a registered method handler
pub type MethodResult = Result<Value, String>;

/// Type-erased async method handler
pub type MethodHandler =
    Arc<dyn Fn(Vec<Value>) -> Pin<Box<dyn Future<Output = MethodResult> + Send>> + Send + Sync>;

/// Name-to-handler registry shared by every worker a factory spawns
///
/// The in-process analog of worker-side script registration: methods are
/// registered once on the factory and resolved by name at call time.
#[derive(Clone, Default)]
pub struct MethodRegistry {
    handlers: HashMap<String, MethodHandler>,
}

impl MethodRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method handler
    pub fn register<F, Fut>(&mut self, name: &str, handler: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult> + Send + 'static,
    {
        let handler: MethodHandler = Arc::new(move |params| Box::pin(handler(params)));
        self.handlers.insert(name.to_string(), handler);
    }

    /// Whether a method is registered
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered method names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    fn get(&self, name: &str) -> Option<MethodHandler> {
        self.handlers.get(name).map(Arc::clone)
    }
}

impl std::fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.names())
            .finish()
    }
}

#[derive(Default)]
struct MetricsState {
    total_time: Duration,
    min_time: Option<Duration>,
    max_time: Option<Duration>,
    last_time: Option<Duration>,
    requests: u64,
}

struct Shared {
    descriptor: WorkerDescriptor,
    registry: Arc<MethodRegistry>,
    events: WorkerEvents,
    concurrency: usize,
    max_exec: Option<u64>,
    mark_not_ready_after_exec: bool,
    in_flight: AtomicUsize,
    executed: AtomicU64,
    ready: AtomicBool,
    terminal: AtomicBool,
    abort_tx: watch::Sender<bool>,
    metrics: Mutex<MetricsState>,
}

impl Shared {
    fn record_call(&self, elapsed: Duration) {
        let mut metrics = self.metrics.lock();
        metrics.total_time += elapsed;
        metrics.min_time = Some(metrics.min_time.map_or(elapsed, |m| m.min(elapsed)));
        metrics.max_time = Some(metrics.max_time.map_or(elapsed, |m| m.max(elapsed)));
        metrics.last_time = Some(elapsed);
        metrics.requests += 1;
    }

    fn finish_call(&self) {
        if self.mark_not_ready_after_exec {
            self.ready.store(false, Ordering::Relaxed);
        }
        let executed = self.executed.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(max_exec) = self.max_exec {
            if executed >= max_exec && !self.terminal.swap(true, Ordering::SeqCst) {
                debug!(
                    worker_id = %self.descriptor.id,
                    executed,
                    "worker reached its execution cap, retiring"
                );
                self.events.exit(self.descriptor.id);
            }
        }
    }

    fn exec_budget_left(&self) -> bool {
        match self.max_exec {
            Some(max_exec) => self.executed.load(Ordering::Relaxed) < max_exec,
            None => true,
        }
    }
}

/// In-process worker executing registered method handlers
///
/// Cheap to clone; clones share the same underlying worker.
#[derive(Clone)]
pub struct LocalWorker {
    shared: Arc<Shared>,
}

impl LocalWorker {
    fn new(params: WorkerSpawnParams, registry: Arc<MethodRegistry>, events: WorkerEvents) -> Self {
        let (abort_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                descriptor: WorkerDescriptor {
                    id: Uuid::now_v7(),
                    script: params.script,
                    fork_args: params.fork_args,
                    fork_opts: params.fork_opts,
                    debug_port: params.debug_port,
                    started_at: Utc::now(),
                },
                registry,
                events,
                concurrency: params.concurrency.max(1),
                max_exec: params.max_exec,
                mark_not_ready_after_exec: params.mark_not_ready_after_exec,
                in_flight: AtomicUsize::new(0),
                executed: AtomicU64::new(0),
                ready: AtomicBool::new(true),
                terminal: AtomicBool::new(false),
                abort_tx,
                metrics: Mutex::new(MetricsState::default()),
            }),
        }
    }

    /// The worker id
    pub fn id(&self) -> Uuid {
        self.shared.descriptor.id
    }

    /// Simulate a transport death: abort in-flight calls and signal exit
    ///
    /// In-flight resolvers reject; the pool removes the worker and tops the
    /// set back up to its minimum.
    pub fn crash(&self) {
        warn!(worker_id = %self.shared.descriptor.id, "worker crashing");
        self.shared.terminal.store(true, Ordering::SeqCst);
        let _ = self.shared.abort_tx.send(true);
        self.shared.events.exit(self.shared.descriptor.id);
    }

    /// Flip the worker back to ready and notify the pool
    ///
    /// Only meaningful together with `mark_not_ready_after_exec`.
    pub fn mark_ready(&self) {
        self.shared.ready.store(true, Ordering::Relaxed);
        self.shared.events.ready(self.shared.descriptor.id);
    }

    fn rejected(
        &self,
        resolver: Resolver,
        error: WorkerError,
    ) -> BoxFuture<'static, Result<(), WorkerError>> {
        resolver.reject(TaskError::Worker(error.to_string()));
        Box::pin(futures::future::ready(Err(error)))
    }
}

#[async_trait]
impl Worker for LocalWorker {
    fn exec(
        &self,
        method: &str,
        params: Vec<Value>,
        resolver: Resolver,
        _options: &TaskOptions,
    ) -> BoxFuture<'static, Result<(), WorkerError>> {
        if self.shared.terminal.load(Ordering::SeqCst) {
            return self.rejected(resolver, WorkerError::Terminated);
        }

        // Built-in introspection call used by the pool proxy.
        if method == "methods" {
            let mut names = self.shared.registry.names();
            names.push("methods".to_string());
            resolver.resolve(Value::Array(names.into_iter().map(Value::String).collect()));
            return Box::pin(futures::future::ready(Ok(())));
        }

        let Some(handler) = self.shared.registry.get(method) else {
            return self.rejected(resolver, WorkerError::UnknownMethod(method.to_string()));
        };

        let mut abort_rx = self.shared.abort_tx.subscribe();
        if *abort_rx.borrow() {
            return self.rejected(resolver, WorkerError::Crashed);
        }

        // The call is registered before control returns to the dispatcher,
        // so availability and busyness reflect it immediately.
        self.shared.in_flight.fetch_add(1, Ordering::Relaxed);

        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            let started = Instant::now();
            let outcome = tokio::select! {
                result = handler(params) => Some(result),
                _ = abort_rx.changed() => None,
            };
            shared.in_flight.fetch_sub(1, Ordering::Relaxed);

            match outcome {
                Some(Ok(value)) => {
                    shared.record_call(started.elapsed());
                    resolver.resolve(value);
                    shared.finish_call();
                    Ok(())
                }
                Some(Err(message)) => {
                    shared.record_call(started.elapsed());
                    resolver.reject(TaskError::Worker(message));
                    shared.finish_call();
                    Ok(())
                }
                None => {
                    resolver.reject(TaskError::Worker(WorkerError::Crashed.to_string()));
                    Err(WorkerError::Crashed)
                }
            }
        })
    }

    fn available(&self) -> bool {
        !self.shared.terminal.load(Ordering::SeqCst)
            && self.shared.ready.load(Ordering::Relaxed)
            && self.shared.in_flight.load(Ordering::Relaxed) < self.shared.concurrency
            && self.shared.exec_budget_left()
    }

    fn busy(&self) -> bool {
        self.shared.in_flight.load(Ordering::Relaxed) > 0
    }

    fn terminated(&self) -> bool {
        self.shared.terminal.load(Ordering::SeqCst)
    }

    async fn terminate(&self, force: bool) -> Result<(), WorkerError> {
        self.shared.terminal.store(true, Ordering::SeqCst);

        if force {
            let _ = self.shared.abort_tx.send(true);
            return Ok(());
        }

        while self.shared.in_flight.load(Ordering::Relaxed) > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Ok(())
    }

    async fn terminate_with_timeout(
        &self,
        force: bool,
        deadline: Duration,
    ) -> Result<(), WorkerError> {
        match tokio::time::timeout(deadline, self.terminate(force)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    worker_id = %self.shared.descriptor.id,
                    "drain deadline reached, aborting calls"
                );
                let _ = self.shared.abort_tx.send(true);
                Err(WorkerError::ShutdownTimeout)
            }
        }
    }

    fn descriptor(&self) -> WorkerDescriptor {
        self.shared.descriptor.clone()
    }

    fn metrics(&self) -> WorkerMetrics {
        let metrics = self.shared.metrics.lock();
        let uptime = Utc::now()
            .signed_duration_since(self.shared.descriptor.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let utilization = if uptime.is_zero() {
            0.0
        } else {
            (metrics.total_time.as_secs_f64() / uptime.as_secs_f64()).min(1.0)
        };
        WorkerMetrics {
            total_time: metrics.total_time,
            min_time: metrics.min_time,
            max_time: metrics.max_time,
            last_time: metrics.last_time,
            requests: metrics.requests,
            utilization,
        }
    }
}

/// Factory spawning [`LocalWorker`]s against a shared method registry
pub struct LocalWorkerFactory {
    registry: Arc<MethodRegistry>,
    spawned: Mutex<Vec<LocalWorker>>,
}

impl LocalWorkerFactory {
    /// Create a factory from a populated registry
    pub fn new(registry: MethodRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            spawned: Mutex::new(Vec::new()),
        }
    }

    /// Every worker this factory has spawned, in spawn order
    ///
    /// Retired and crashed workers are included; useful for tests and
    /// diagnostics.
    pub fn spawned(&self) -> Vec<LocalWorker> {
        self.spawned.lock().clone()
    }
}

impl WorkerFactory for LocalWorkerFactory {
    fn spawn(
        &self,
        params: WorkerSpawnParams,
        events: WorkerEvents,
    ) -> Result<Arc<dyn Worker>, WorkerError> {
        let worker = LocalWorker::new(params, Arc::clone(&self.registry), events.clone());
        debug!(worker_id = %worker.id(), "spawned local worker");
        self.spawned.lock().push(worker.clone());
        events.ready(worker.id());
        Ok(Arc::new(worker))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::new_task;
    use crate::worker::{WorkerEvent, WorkerKind};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn spawn_params(concurrency: usize) -> WorkerSpawnParams {
        WorkerSpawnParams {
            kind: WorkerKind::Thread,
            script: None,
            fork_args: vec![],
            fork_opts: serde_json::Map::new(),
            debug_port: None,
            concurrency,
            max_exec: None,
            mark_not_ready_after_exec: false,
            ready_timeout: None,
            init_ready_timeout: None,
        }
    }

    fn test_registry() -> MethodRegistry {
        let mut registry = MethodRegistry::new();
        registry.register("add", |params| async move {
            let a = params[0].as_i64().unwrap_or(0);
            let b = params[1].as_i64().unwrap_or(0);
            Ok(json!(a + b))
        });
        registry.register("boom", |_| async move { Err("boom".to_string()) });
        registry
    }

    fn test_worker(concurrency: usize) -> (LocalWorker, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = LocalWorker::new(
            spawn_params(concurrency),
            Arc::new(test_registry()),
            WorkerEvents::new(tx),
        );
        (worker, rx)
    }

    fn stall_worker() -> (LocalWorker, mpsc::UnboundedReceiver<WorkerEvent>) {
        let mut registry = MethodRegistry::new();
        registry.register("stall", |_| async move {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(json!(null))
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = LocalWorker::new(spawn_params(1), Arc::new(registry), WorkerEvents::new(tx));
        (worker, rx)
    }

    #[tokio::test]
    async fn test_exec_resolves_with_handler_result() {
        let (worker, _rx) = test_worker(1);
        let (handle, resolver) = new_task();

        worker
            .exec("add", vec![json!(2), json!(4)], resolver, &TaskOptions::default())
            .await
            .unwrap();

        assert_eq!(handle.await, Ok(json!(6)));
        assert_eq!(worker.metrics().requests, 1);
    }

    #[tokio::test]
    async fn test_exec_registers_call_synchronously() {
        let (worker, _rx) = stall_worker();
        let (_handle, resolver) = new_task();

        let drain = worker.exec("stall", vec![], resolver, &TaskOptions::default());

        // Bookkeeping happens at handoff, before the drain future runs.
        assert!(worker.busy());
        assert!(!worker.available());
        drop(drain);
    }

    #[tokio::test]
    async fn test_handler_error_rejects_resolver_but_drains() {
        let (worker, _rx) = test_worker(1);
        let (handle, resolver) = new_task();

        let drained = worker
            .exec("boom", vec![], resolver, &TaskOptions::default())
            .await;

        assert!(drained.is_ok(), "user errors are not transport failures");
        assert_eq!(handle.await, Err(TaskError::Worker("boom".to_string())));
    }

    #[tokio::test]
    async fn test_unknown_method_rejects() {
        let (worker, _rx) = test_worker(1);
        let (handle, resolver) = new_task();

        let result = worker
            .exec("nope", vec![], resolver, &TaskOptions::default())
            .await;

        assert_eq!(result, Err(WorkerError::UnknownMethod("nope".to_string())));
        assert!(matches!(handle.await, Err(TaskError::Worker(_))));
    }

    #[tokio::test]
    async fn test_methods_builtin_lists_registered_names() {
        let (worker, _rx) = test_worker(1);
        let (handle, resolver) = new_task();

        worker
            .exec("methods", vec![], resolver, &TaskOptions::default())
            .await
            .unwrap();

        let listed = handle.await.unwrap();
        let names: Vec<&str> = listed
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert_eq!(names, vec!["add", "boom", "methods"]);
    }

    #[tokio::test]
    async fn test_availability_tracks_in_flight_calls() {
        let (worker, _rx) = stall_worker();
        assert!(worker.available());
        assert!(!worker.busy());

        let (_handle, resolver) = new_task();
        let drain = worker.exec("stall", vec![], resolver, &TaskOptions::default());
        let exec = tokio::spawn(drain);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(worker.busy());
        assert!(!worker.available(), "concurrency of one is saturated");

        worker.crash();
        let _ = exec.await.unwrap();
        assert!(!worker.busy());
    }

    #[tokio::test]
    async fn test_max_exec_retires_worker_and_signals_exit() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut params = spawn_params(1);
        params.max_exec = Some(2);
        let worker = LocalWorker::new(params, Arc::new(test_registry()), WorkerEvents::new(tx));

        for _ in 0..2 {
            let (_handle, resolver) = new_task();
            worker
                .exec("add", vec![json!(1), json!(1)], resolver, &TaskOptions::default())
                .await
                .unwrap();
        }

        assert!(worker.terminated());
        assert!(!worker.available());
        assert_eq!(rx.recv().await, Some(WorkerEvent::Exit(worker.id())));

        let (handle, resolver) = new_task();
        let result = worker
            .exec("add", vec![json!(1), json!(1)], resolver, &TaskOptions::default())
            .await;
        assert_eq!(result, Err(WorkerError::Terminated));
        assert!(matches!(handle.await, Err(TaskError::Worker(_))));
    }

    #[tokio::test]
    async fn test_crash_aborts_in_flight_call() {
        let (worker, _rx) = stall_worker();

        let (handle, resolver) = new_task();
        let drain = worker.exec("stall", vec![], resolver, &TaskOptions::default());
        let exec = tokio::spawn(drain);

        tokio::time::sleep(Duration::from_millis(50)).await;
        worker.crash();

        assert_eq!(exec.await.unwrap(), Err(WorkerError::Crashed));
        assert!(worker.terminated());
        assert!(matches!(handle.await, Err(TaskError::Worker(_))));
    }

    #[tokio::test]
    async fn test_graceful_terminate_waits_for_drain() {
        let mut registry = MethodRegistry::new();
        registry.register("slow", |_| async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            Ok(json!("done"))
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        let worker = LocalWorker::new(spawn_params(1), Arc::new(registry), WorkerEvents::new(tx));

        let (handle, resolver) = new_task();
        let drain = worker.exec("slow", vec![], resolver, &TaskOptions::default());
        tokio::spawn(drain);

        tokio::time::sleep(Duration::from_millis(30)).await;
        worker.terminate(false).await.unwrap();

        assert_eq!(handle.await, Ok(json!("done")));
    }

    #[tokio::test]
    async fn test_terminate_with_timeout_aborts_stalled_call() {
        let (worker, _rx) = stall_worker();

        let (handle, resolver) = new_task();
        let drain = worker.exec("stall", vec![], resolver, &TaskOptions::default());
        tokio::spawn(drain);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let result = worker
            .terminate_with_timeout(false, Duration::from_millis(100))
            .await;

        assert_eq!(result, Err(WorkerError::ShutdownTimeout));
        assert!(matches!(handle.await, Err(TaskError::Worker(_))));
    }

    #[tokio::test]
    async fn test_mark_not_ready_after_exec() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut params = spawn_params(1);
        params.mark_not_ready_after_exec = true;
        let worker = LocalWorker::new(params, Arc::new(test_registry()), WorkerEvents::new(tx));

        let (_handle, resolver) = new_task();
        worker
            .exec("add", vec![json!(1), json!(2)], resolver, &TaskOptions::default())
            .await
            .unwrap();

        assert!(!worker.available());
        worker.mark_ready();
        assert!(worker.available());
    }
}
