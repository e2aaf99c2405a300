//! Pending-result primitive for submitted tasks
//!
//! Every submission produces a [`TaskHandle`] for the caller and a
//! [`Resolver`] for whoever settles the task (the dispatcher while queued,
//! the worker transport after dispatch). Settlement is first-call-wins:
//! later resolves, rejects, cancellations and timer expirations are no-ops.
//!
//! Timeouts are deferred while the task is queued. Calling
//! [`TaskHandle::timeout`] before dispatch records the duration; the
//! dispatcher arms the timer at the moment the task is handed to a worker.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;

/// Result a task settles with
pub type TaskResult = Result<Value, TaskError>;

/// Errors a task future can settle with
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The caller cancelled the task
    #[error("task was cancelled")]
    Cancelled,

    /// The task timeout elapsed
    #[error("task timed out after {0:?}")]
    TimedOut(Duration),

    /// The pool was terminated while the task was queued
    #[error("Pool terminated")]
    PoolTerminated,

    /// The worker transport or the user code reported an error
    #[error("{0}")]
    Worker(String),

    /// The resolver was dropped without settling
    #[error("task was abandoned without a result")]
    Abandoned,
}

/// Timeout bookkeeping for a task
///
/// While queued, a requested timeout is only recorded. Dispatch flips the
/// phase, after which timeouts arm immediately.
#[derive(Debug, Clone, Copy)]
enum TimeoutPhase {
    Queued(Option<Duration>),
    Dispatched,
}

struct TaskShared {
    tx: Mutex<Option<oneshot::Sender<TaskResult>>>,
    phase: Mutex<TimeoutPhase>,
}

impl TaskShared {
    /// Settle the task. Returns false when it was already settled.
    fn settle(&self, result: TaskResult) -> bool {
        match self.tx.lock().take() {
            Some(tx) => {
                // A dropped receiver only means nobody is listening anymore.
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    fn is_pending(&self) -> bool {
        self.tx.lock().is_some()
    }
}

fn arm_timeout(shared: &Arc<TaskShared>, timeout: Duration) {
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        shared.settle(Err(TaskError::TimedOut(timeout)));
    });
}

/// Settling side of a task
///
/// Handed to the worker transport together with the call. Both operations
/// are idempotent; the first settlement wins.
#[derive(Clone)]
pub struct Resolver {
    shared: Arc<TaskShared>,
}

impl Resolver {
    /// Settle the task with a result value. Returns false if already settled.
    pub fn resolve(&self, value: Value) -> bool {
        self.shared.settle(Ok(value))
    }

    /// Settle the task with an error. Returns false if already settled.
    pub fn reject(&self, error: TaskError) -> bool {
        self.shared.settle(Err(error))
    }

    /// Whether the task has not settled yet
    pub fn is_pending(&self) -> bool {
        self.shared.is_pending()
    }

    /// Transition the task out of the queued phase and arm any timeout
    /// recorded while it was waiting. Called by the dispatcher exactly once,
    /// at the moment the task is handed to a worker.
    pub(crate) fn mark_dispatched(&self) {
        let deferred = {
            let mut phase = self.shared.phase.lock();
            match *phase {
                TimeoutPhase::Queued(deferred) => {
                    *phase = TimeoutPhase::Dispatched;
                    deferred
                }
                TimeoutPhase::Dispatched => None,
            }
        };
        if let Some(timeout) = deferred {
            arm_timeout(&self.shared, timeout);
        }
    }
}

/// Caller side of a task
///
/// Resolves with the worker's return value or a [`TaskError`]. Dropping the
/// handle does not cancel the task.
pub struct TaskHandle {
    rx: oneshot::Receiver<TaskResult>,
    shared: Arc<TaskShared>,
}

impl TaskHandle {
    /// Whether the task has not settled yet
    pub fn is_pending(&self) -> bool {
        self.shared.is_pending()
    }

    /// Cancel the task
    ///
    /// Before dispatch the task is dropped silently on its queue turn. After
    /// dispatch the settled-first rule applies: cancellation only wins if the
    /// worker has not produced a result yet.
    pub fn cancel(&self) {
        self.shared.settle(Err(TaskError::Cancelled));
    }

    /// Attach a timeout to the task
    ///
    /// While the task is queued the duration is recorded and the timer is
    /// armed when the task is handed to a worker, so queue time never counts
    /// against the limit. Once dispatched, the timer arms immediately.
    pub fn timeout(&self, timeout: Duration) {
        let arm_now = {
            let mut phase = self.shared.phase.lock();
            match *phase {
                TimeoutPhase::Queued(_) => {
                    *phase = TimeoutPhase::Queued(Some(timeout));
                    false
                }
                TimeoutPhase::Dispatched => true,
            }
        };
        if arm_now {
            arm_timeout(&self.shared, timeout);
        }
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("pending", &self.is_pending())
            .finish()
    }
}

impl Future for TaskHandle {
    type Output = TaskResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(TaskError::Abandoned)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Create a linked handle/resolver pair for a fresh task
pub(crate) fn new_task() -> (TaskHandle, Resolver) {
    let (tx, rx) = oneshot::channel();
    let shared = Arc::new(TaskShared {
        tx: Mutex::new(Some(tx)),
        phase: Mutex::new(TimeoutPhase::Queued(None)),
    });
    let handle = TaskHandle {
        rx,
        shared: Arc::clone(&shared),
    };
    (handle, Resolver { shared })
}
