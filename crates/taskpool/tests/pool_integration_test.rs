//! End-to-end dispatcher tests against the in-process worker transport
//!
//! Run with: cargo test -p taskpool --test pool_integration_test

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{json, Value};

use taskpool::pool::{MinWorkers, Pool, PoolConfig, PoolError, PoolHooks};
use taskpool::task::{TaskError, TaskOptions};
use taskpool::worker::local::{LocalWorkerFactory, MethodRegistry};
use taskpool::worker::Worker;

/// Registry with the handlers the scenarios share
fn base_registry() -> MethodRegistry {
    let mut registry = MethodRegistry::new();
    registry.register("add", |params| async move {
        let a = params[0].as_i64().unwrap_or(0);
        let b = params[1].as_i64().unwrap_or(0);
        Ok(json!(a + b))
    });
    registry.register("sleep_ms", |params| async move {
        let millis = params[0].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok(json!(millis))
    });
    registry.register("stall", |_| async move {
        tokio::time::sleep(Duration::from_secs(600)).await;
        Ok(json!(null))
    });
    registry
}

fn pool_with(config: PoolConfig) -> (Pool, Arc<LocalWorkerFactory>) {
    let factory = Arc::new(LocalWorkerFactory::new(base_registry()));
    let pool = Pool::new(
        Arc::clone(&factory) as Arc<dyn taskpool::worker::WorkerFactory>,
        config,
    )
    .expect("pool construction");
    (pool, factory)
}

// ============================================
// Basic dispatch
// ============================================

#[tokio::test]
async fn test_basic_dispatch_resolves_with_result() {
    let (pool, _factory) = pool_with(PoolConfig::default().with_max_workers(2));

    let result = pool
        .exec("add", vec![json!(2), json!(4)])
        .expect("submission")
        .await;
    assert_eq!(result, Ok(json!(6)));

    let stats = pool.stats();
    assert!(stats.total_workers <= 2);
    assert_eq!(stats.pending_tasks, 0);
}

#[tokio::test]
async fn test_load_settles_every_task() {
    let (pool, _factory) = pool_with(
        PoolConfig::default()
            .with_max_workers(3)
            .with_concurrency(2),
    );

    let handles: Vec<_> = (0..20)
        .map(|i| {
            pool.exec("add", vec![json!(i), json!(i)])
                .expect("submission")
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await, Ok(json!(2 * i as i64)));
    }

    let stats = pool.stats();
    assert!(stats.total_workers <= 3);
    assert_eq!(stats.pending_tasks, 0);
}

// ============================================
// Queue bound
// ============================================

#[tokio::test]
async fn test_queue_overflow_is_synchronous() {
    let (pool, _factory) = pool_with(
        PoolConfig::default()
            .with_max_workers(1)
            .with_max_queue_size(1),
    );

    let _running = pool.exec("stall", vec![]).expect("first submission");
    tokio::time::sleep(Duration::from_millis(50)).await;
    let _queued = pool.exec("stall", vec![]).expect("second submission");

    let overflow = pool.exec("add", vec![json!(1), json!(1)]);
    let error = overflow.expect_err("queue bound must reject synchronously");
    assert!(error.to_string().contains("Max queue size of 1"));
}

// ============================================
// Cancellation while queued
// ============================================

#[tokio::test]
async fn test_cancelled_queued_task_never_dispatches() {
    let (pool, factory) = pool_with(PoolConfig::default().with_max_workers(1));

    let running = pool
        .exec("sleep_ms", vec![json!(200)])
        .expect("task A submission");
    tokio::time::sleep(Duration::from_millis(30)).await;

    let queued = pool
        .exec("add", vec![json!(1), json!(1)])
        .expect("task B submission");
    queued.cancel();
    assert_eq!(queued.await, Err(TaskError::Cancelled));

    assert_eq!(running.await, Ok(json!(200)));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let spawned = factory.spawned();
    assert_eq!(spawned.len(), 1);
    assert_eq!(
        spawned[0].metrics().requests,
        1,
        "cancelled task must not reach the worker"
    );
}

// ============================================
// Deferred timeout
// ============================================

#[tokio::test]
async fn test_timeout_armed_at_dispatch_not_submit() {
    let (pool, _factory) = pool_with(PoolConfig::default().with_max_workers(1));

    let running = pool
        .exec("sleep_ms", vec![json!(300)])
        .expect("task A submission");
    tokio::time::sleep(Duration::from_millis(30)).await;

    let queued = pool
        .exec("sleep_ms", vec![json!(300)])
        .expect("task B submission");
    queued.timeout(Duration::from_millis(100));

    assert_eq!(running.await, Ok(json!(300)));

    // B has been queued for ~300ms, past its 100ms budget. The timer must
    // only start now that A finished and B was handed to the worker.
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(queued.is_pending(), "timer must not run while queued");

    assert_eq!(
        queued.await,
        Err(TaskError::TimedOut(Duration::from_millis(100)))
    );
}

#[tokio::test]
async fn test_timeout_option_is_deferred_too() {
    let (pool, _factory) = pool_with(PoolConfig::default().with_max_workers(1));

    let _running = pool
        .exec("sleep_ms", vec![json!(250)])
        .expect("task A submission");
    tokio::time::sleep(Duration::from_millis(30)).await;

    let queued = pool
        .exec_with_options(
            "add",
            vec![json!(3), json!(4)],
            TaskOptions::new().with_timeout(Duration::from_millis(150)),
        )
        .expect("task B submission");

    // Queue wait exceeds the timeout, but the fast call wins once dispatched.
    assert_eq!(queued.await, Ok(json!(7)));
}

// ============================================
// Crash recovery with a minimum pool
// ============================================

#[tokio::test]
async fn test_crash_replaces_worker_and_queue_progresses() {
    let (pool, factory) = pool_with(
        PoolConfig::default()
            .with_max_workers(2)
            .with_min_workers(MinWorkers::Count(2)),
    );
    assert_eq!(pool.stats().total_workers, 2);

    let doomed = pool.exec("stall", vec![]).expect("first stall");
    let survivor = pool.exec("stall", vec![]).expect("second stall");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pool.stats().busy_workers, 2);

    let queued = pool
        .exec("add", vec![json!(1), json!(2)])
        .expect("queued submission");
    assert_eq!(pool.stats().pending_tasks, 1);

    factory.spawned()[0].crash();

    // The in-flight task on the crashed worker rejects, the pool tops back
    // up to its minimum, and the queued task runs on the replacement.
    assert!(matches!(doomed.await, Err(TaskError::Worker(_))));
    assert_eq!(queued.await, Ok(json!(3)));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pool.stats().total_workers, 2);
    assert_eq!(factory.spawned().len(), 3, "a replacement was spawned");
    assert!(survivor.is_pending(), "the other worker is untouched");

    pool.terminate(true, Some(Duration::from_millis(200)))
        .await
        .expect("termination");
}

// ============================================
// Forced termination
// ============================================

#[tokio::test]
async fn test_forced_terminate_rejects_queue_within_deadline() {
    let disposed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&disposed);
    let factory = Arc::new(LocalWorkerFactory::new(base_registry()));
    let pool = Pool::with_hooks(
        Arc::clone(&factory) as Arc<dyn taskpool::worker::WorkerFactory>,
        PoolConfig::default().with_max_workers(1),
        PoolHooks::new().on_terminate_worker(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    )
    .expect("pool construction");

    let running = pool.exec("stall", vec![]).expect("stalling submission");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let queued: Vec<_> = (0..3)
        .map(|_| pool.exec("add", vec![json!(1), json!(1)]).expect("queued"))
        .collect();

    let started = Instant::now();
    pool.terminate(true, Some(Duration::from_millis(100)))
        .await
        .expect("forced termination");
    assert!(
        started.elapsed() < Duration::from_millis(500),
        "forced termination must not wait for the stalled call"
    );

    for handle in queued {
        assert_eq!(handle.await, Err(TaskError::PoolTerminated));
    }
    assert!(matches!(running.await, Err(TaskError::Worker(_))));
    assert_eq!(disposed.load(Ordering::SeqCst), 1);

    // Idempotent: a second call resolves immediately without re-disposing.
    pool.terminate(true, Some(Duration::from_millis(100)))
        .await
        .expect("repeat termination");
    assert_eq!(disposed.load(Ordering::SeqCst), 1);
}

// ============================================
// Gradual scaling
// ============================================

#[tokio::test]
async fn test_gradual_scaling_one_worker_per_window() {
    let (pool, _factory) = pool_with(
        PoolConfig::default()
            .with_max_workers(4)
            .with_gradual_scaling(Duration::from_millis(300)),
    );

    let _stalls: Vec<_> = (0..4)
        .map(|_| pool.exec("stall", vec![]).expect("stall submission"))
        .collect();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(
        pool.stats().total_workers,
        1,
        "only one worker per scaling window"
    );

    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(
        pool.stats().total_workers,
        2,
        "the next window admits exactly one more"
    );

    pool.terminate(true, Some(Duration::from_millis(200)))
        .await
        .expect("termination");
}

#[tokio::test]
async fn test_min_top_up_is_exempt_from_scaling_gate() {
    let (pool, _factory) = pool_with(
        PoolConfig::default()
            .with_max_workers(3)
            .with_min_workers(MinWorkers::Count(3))
            .with_gradual_scaling(Duration::from_secs(60)),
    );

    assert_eq!(
        pool.stats().total_workers,
        3,
        "the minimum is met immediately regardless of the gate"
    );
}

// ============================================
// Ordering
// ============================================

#[tokio::test]
async fn test_fifo_among_first_available_tasks() {
    let order: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&order);

    let mut registry = MethodRegistry::new();
    registry.register("record", move |params| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().push(params[0].as_i64().unwrap_or(-1));
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(Value::Null)
        }
    });

    let factory = Arc::new(LocalWorkerFactory::new(registry));
    let pool = Pool::new(
        factory,
        PoolConfig::default().with_max_workers(1).with_concurrency(1),
    )
    .expect("pool construction");

    let handles: Vec<_> = (0..6)
        .map(|i| pool.exec("record", vec![json!(i)]).expect("submission"))
        .collect();
    for handle in handles {
        handle.await.expect("task settles");
    }

    assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_affinity_peers_arrive_in_submit_order() {
    let order: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&order);

    let mut registry = MethodRegistry::new();
    registry.register("record", move |params| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().push(params[0].as_i64().unwrap_or(-1));
            Ok(Value::Null)
        }
    });

    let factory = Arc::new(LocalWorkerFactory::new(registry));
    let pool = Pool::new(
        factory,
        PoolConfig::default()
            .with_max_workers(2)
            .with_min_workers(MinWorkers::Max)
            .with_concurrency(8),
    )
    .expect("pool construction");

    let handles: Vec<_> = (0..4)
        .map(|i| {
            pool.exec_with_options(
                "record",
                vec![json!(i)],
                TaskOptions::new().with_affinity(1),
            )
            .expect("submission")
        })
        .collect();
    for handle in handles {
        handle.await.expect("task settles");
    }

    assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
}

// ============================================
// Proxy
// ============================================

#[tokio::test]
async fn test_proxy_binds_advertised_methods() {
    let (pool, _factory) = pool_with(PoolConfig::default().with_max_workers(1));

    let proxy = pool.proxy().await.expect("proxy construction");
    assert!(proxy.contains("add"));
    assert!(proxy.contains("sleep_ms"));

    let sum = proxy
        .call("add", vec![json!(40), json!(2)])
        .expect("bound submission")
        .await;
    assert_eq!(sum, Ok(json!(42)));

    assert!(matches!(
        proxy.call("divide", vec![]),
        Err(PoolError::UnknownMethod(_))
    ));
}
