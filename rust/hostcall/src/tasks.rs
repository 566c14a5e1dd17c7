//! Futures and the worker pool that settles them.
//!
//! Scripts never see a [`TaskFuture`] directly: work submitted to a
//! [`WorkerPool`] is recorded under a [`FutureId`], and the id travels through
//! slots as a number. Futures settle exactly once; a cancelled future keeps
//! its `Cancelled` state even if its task later finishes.
//!
//! Workers are plain OS threads fed by a bounded crossbeam channel, so a
//! full queue makes `submit` wait instead of growing without limit.

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{self as cb};
use tracing::{debug, error, warn};

use crate::boundary::catch_panic;
use crate::config::TaskConfig;
use crate::error::BridgeError;
use crate::vm::SlotValue;

/// What a task produces: a slot value or an error message for the script.
pub type TaskResult = Result<SlotValue, String>;

type NamedTask = Arc<dyn Fn(Vec<SlotValue>, &CancelToken) -> TaskResult + Send + Sync>;

const SHUTTING_DOWN: &str = "worker pool is shutting down";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// FutureId / FutureState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FutureId(u64);

impl FutureId {
    pub fn get(self) -> u64 {
        self.0
    }

    /// Id carried in a numeric slot. Ids start at 1, so zero, negative,
    /// fractional and non-finite numbers name no future.
    pub fn from_slot(value: f64) -> Option<Self> {
        let integral = value.is_finite() && value >= 1.0 && value.fract() == 0.0;
        // Above 2^53 a slot number no longer identifies one integer.
        (integral && value <= 9_007_199_254_740_992.0).then(|| FutureId(value as u64))
    }

    pub fn to_slot(self) -> f64 {
        self.0 as f64
    }
}

impl fmt::Display for FutureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "future#{}", self.0)
    }
}

/// State of a future as scripts see it through `getState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FutureState {
    Pending = 0,
    Completed = 1,
    Failed = 2,
    Cancelled = 3,
}

impl FutureState {
    pub fn code(self) -> f64 {
        f64::from(self as u8)
    }
}

// ---------------------------------------------------------------------------
// CancelToken
// ---------------------------------------------------------------------------

/// Cooperative cancellation signal handed to every task.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, wake) = &*self.inner;
        *lock(flag) = true;
        wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *lock(&self.inner.0)
    }

    /// Sleep for `duration` unless cancelled first. Returns `false` when the
    /// sleep was cut short.
    pub fn sleep(&self, duration: Duration) -> bool {
        let (flag, wake) = &*self.inner;
        let guard = lock(flag);
        let (guard, _) = wake
            .wait_timeout_while(guard, duration, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        !*guard
    }
}

// ---------------------------------------------------------------------------
// TaskFuture
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Outcome {
    Pending,
    Completed(SlotValue),
    Failed(String),
    Cancelled,
}

impl Outcome {
    fn state(&self) -> FutureState {
        match self {
            Outcome::Pending => FutureState::Pending,
            Outcome::Completed(_) => FutureState::Completed,
            Outcome::Failed(_) => FutureState::Failed,
            Outcome::Cancelled => FutureState::Cancelled,
        }
    }

    fn result(&self) -> TaskResult {
        match self {
            Outcome::Pending => Err("future not ready".to_string()),
            Outcome::Completed(value) => Ok(value.clone()),
            Outcome::Failed(message) => Err(message.clone()),
            Outcome::Cancelled => Err("future was cancelled".to_string()),
        }
    }
}

#[derive(Debug)]
struct Shared {
    id: FutureId,
    outcome: Mutex<Outcome>,
    done: Condvar,
    token: CancelToken,
}

/// Shared view of one submitted task's result.
#[derive(Debug, Clone)]
pub struct TaskFuture {
    shared: Arc<Shared>,
}

impl TaskFuture {
    fn new(id: FutureId) -> Self {
        Self {
            shared: Arc::new(Shared {
                id,
                outcome: Mutex::new(Outcome::Pending),
                done: Condvar::new(),
                token: CancelToken::new(),
            }),
        }
    }

    pub fn id(&self) -> FutureId {
        self.shared.id
    }

    pub fn state(&self) -> FutureState {
        lock(&self.shared.outcome).state()
    }

    pub fn is_ready(&self) -> bool {
        self.state() != FutureState::Pending
    }

    /// Block until the future settles.
    pub fn wait(&self) -> TaskResult {
        let guard = lock(&self.shared.outcome);
        let guard = self
            .shared
            .done
            .wait_while(guard, |outcome| matches!(outcome, Outcome::Pending))
            .unwrap_or_else(PoisonError::into_inner);
        guard.result()
    }

    /// Like [`TaskFuture::wait`], giving up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskResult> {
        let guard = lock(&self.shared.outcome);
        let (guard, _) = self
            .shared
            .done
            .wait_timeout_while(guard, timeout, |outcome| matches!(outcome, Outcome::Pending))
            .unwrap_or_else(PoisonError::into_inner);
        match *guard {
            Outcome::Pending => None,
            ref settled => Some(settled.result()),
        }
    }

    /// Result without blocking; a pending future is an error.
    pub fn get(&self) -> TaskResult {
        lock(&self.shared.outcome).result()
    }

    /// Cancel a pending future and signal its task. Returns `false` if the
    /// future had already settled.
    pub fn cancel(&self) -> bool {
        let cancelled = self.settle(Outcome::Cancelled);
        if cancelled {
            self.shared.token.cancel();
            debug!(future = %self.id(), "cancelled future");
        }
        cancelled
    }

    pub fn token(&self) -> &CancelToken {
        &self.shared.token
    }

    /// First settlement wins; later ones are dropped.
    fn settle(&self, outcome: Outcome) -> bool {
        let mut current = lock(&self.shared.outcome);
        if !matches!(*current, Outcome::Pending) {
            return false;
        }
        *current = outcome;
        self.shared.done.notify_all();
        true
    }
}

// ---------------------------------------------------------------------------
// WorkerPool
// ---------------------------------------------------------------------------

struct Job {
    future: TaskFuture,
    run: Box<dyn FnOnce(&CancelToken) -> TaskResult + Send>,
}

impl Job {
    fn execute(self) {
        let Job { future, run } = self;
        if future.is_ready() {
            debug!(future = %future.id(), "skipping task settled before it started");
            return;
        }
        let token = future.token().clone();
        let outcome = match catch_panic(AssertUnwindSafe(|| run(&token))) {
            Ok(Ok(value)) => Outcome::Completed(value),
            Ok(Err(message)) => Outcome::Failed(message),
            Err(panic) => {
                warn!(future = %future.id(), error = %panic, "task panicked");
                Outcome::Failed(panic.to_string())
            }
        };
        if !future.settle(outcome) {
            debug!(future = %future.id(), "task finished after its future settled");
        }
    }
}

/// Fixed set of worker threads plus the registry of futures they settle.
pub struct WorkerPool {
    sender: Mutex<Option<cb::Sender<Job>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    futures: Mutex<HashMap<FutureId, TaskFuture>>,
    tasks: Mutex<HashMap<String, NamedTask>>,
    next_id: AtomicU64,
    closing: Arc<AtomicBool>,
    worker_count: usize,
}

impl WorkerPool {
    /// Start the workers described by `config`.
    pub fn new(config: &TaskConfig) -> Result<Self, BridgeError> {
        let worker_count = config.resolved_workers();
        let queue_depth = config.resolved_queue_depth();
        let (sender, receiver) = cb::bounded::<Job>(queue_depth);
        let closing = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(worker_count);
        for idx in 0..worker_count {
            let receiver = receiver.clone();
            let closing = Arc::clone(&closing);
            let handle = thread::Builder::new()
                .name(format!("hostcall-worker-{idx}"))
                .spawn(move || Self::worker_loop(idx, receiver, closing))
                .map_err(|e| BridgeError::TaskPool(format!("cannot spawn worker {idx}: {e}")))?;
            workers.push(handle);
        }
        debug!(workers = worker_count, queue_depth, "started worker pool");

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            futures: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closing,
            worker_count,
        })
    }

    fn worker_loop(idx: usize, receiver: cb::Receiver<Job>, closing: Arc<AtomicBool>) {
        for job in receiver.iter() {
            if closing.load(Ordering::Acquire) {
                job.future.settle(Outcome::Failed(SHUTTING_DOWN.to_string()));
                continue;
            }
            job.execute();
        }
        debug!(worker = idx, "worker exiting");
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Queue `task` and return its future, already recorded in the registry.
    ///
    /// Blocks while the queue is full. After [`WorkerPool::shutdown`] the
    /// future comes back failed.
    pub fn submit<F>(&self, task: F) -> TaskFuture
    where
        F: FnOnce(&CancelToken) -> TaskResult + Send + 'static,
    {
        let id = FutureId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let future = TaskFuture::new(id);
        lock(&self.futures).insert(id, future.clone());

        let sender = lock(&self.sender).clone();
        let Some(sender) = sender.filter(|_| !self.closing.load(Ordering::Acquire)) else {
            future.settle(Outcome::Failed(SHUTTING_DOWN.to_string()));
            return future;
        };
        let job = Job {
            future: future.clone(),
            run: Box::new(task),
        };
        if sender.send(job).is_err() {
            future.settle(Outcome::Failed(SHUTTING_DOWN.to_string()));
        }
        future
    }

    /// Make `task` callable by name through [`WorkerPool::call`]. A later
    /// registration under the same name replaces the earlier one.
    pub fn register_task<F>(&self, name: &str, task: F)
    where
        F: Fn(Vec<SlotValue>, &CancelToken) -> TaskResult + Send + Sync + 'static,
    {
        debug!(task = name, "registered task");
        lock(&self.tasks).insert(name.to_string(), Arc::new(task));
    }

    pub fn has_task(&self, name: &str) -> bool {
        lock(&self.tasks).contains_key(name)
    }

    /// Submit the task registered as `name` with `args`.
    pub fn call(&self, name: &str, args: Vec<SlotValue>) -> Result<TaskFuture, BridgeError> {
        let task = lock(&self.tasks)
            .get(name)
            .cloned()
            .ok_or_else(|| BridgeError::TaskPool(format!("no task registered as `{name}`")))?;
        Ok(self.submit(move |token: &CancelToken| (*task)(args, token)))
    }

    pub fn get(&self, id: FutureId) -> Option<TaskFuture> {
        lock(&self.futures).get(&id).cloned()
    }

    /// Drop `id` from the registry. The task itself keeps running.
    pub fn remove(&self, id: FutureId) -> Option<TaskFuture> {
        lock(&self.futures).remove(&id)
    }

    /// Futures currently in the registry, settled or not.
    pub fn len(&self) -> usize {
        lock(&self.futures).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until every future pending right now has settled.
    pub fn wait_all(&self) {
        let pending: Vec<TaskFuture> = lock(&self.futures)
            .values()
            .filter(|f| !f.is_ready())
            .cloned()
            .collect();
        for future in pending {
            let _ = future.wait();
        }
    }

    /// Cancel running tasks, fail queued ones and join the workers.
    /// Repeated calls do nothing.
    pub fn shutdown(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        for future in lock(&self.futures).values() {
            future.token().cancel();
        }
        drop(lock(&self.sender).take());

        let workers = std::mem::take(&mut *lock(&self.workers));
        let current = thread::current().id();
        for handle in workers {
            if handle.thread().id() == current {
                warn!("worker pool shut down from one of its own workers; not joining it");
                continue;
            }
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
        debug!("worker pool stopped");
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.worker_count)
            .field("futures", &self.len())
            .field("closing", &self.closing.load(Ordering::Relaxed))
            .finish()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
