//! Bounded worker pool.
//!
//! Jobs are closures queued on a bounded crossbeam channel and executed by a
//! fixed set of named threads. Every job carries a [`CancelToken`]; the pool
//! keeps the tokens of queued and running jobs so that a session stop can
//! cancel all of them at once.

use crate::cancel::{CancelToken, Cancelled};
use crate::message::{TaskEvent, TaskId};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Pool sizing.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker threads
    pub workers: usize,
    /// Jobs that may wait in the queue before submission is refused
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 16,
        }
    }
}

/// Why a job did not complete.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

impl From<Cancelled> for TaskError {
    fn from(_: Cancelled) -> Self {
        TaskError::Cancelled
    }
}

/// Outcome of a job: a short human-readable detail on success.
pub type TaskResult = Result<String, TaskError>;

/// Submission errors.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("task queue is full ({0} pending)")]
    QueueFull(usize),

    #[error("task pool is shut down")]
    ShutDown,
}

/// Handed to every job while it runs.
pub struct TaskContext {
    task_id: TaskId,
    token: CancelToken,
    events: Sender<TaskEvent>,
}

impl TaskContext {
    pub fn id(&self) -> TaskId {
        self.task_id
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn check_cancelled(&self) -> Result<(), Cancelled> {
        self.token.check()
    }

    /// Report items processed so far. Callers do their own throttling.
    pub fn report_progress(&self, items: u64) {
        let _ = self.events.send(TaskEvent::Progress {
            task_id: self.task_id,
            items,
        });
    }
}

type JobFn = Box<dyn FnOnce(&TaskContext) -> TaskResult + Send + 'static>;

struct Job {
    id: TaskId,
    name: String,
    token: CancelToken,
    run: JobFn,
}

type InFlight = Arc<Mutex<HashMap<TaskId, CancelToken>>>;

struct PoolInner {
    sender: Mutex<Option<Sender<Job>>>,
    /// Parent of every job token
    root: CancelToken,
    in_flight: InFlight,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl PoolInner {
    fn shutdown(&self) {
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner()).take();
        if sender.is_none() {
            return;
        }
        drop(sender);
        self.root.cancel();

        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for worker in workers {
            let _ = worker.join();
        }
        info!("Task pool shut down");
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Cloneable handle to the worker pool.
#[derive(Clone)]
pub struct TaskPool {
    inner: Arc<PoolInner>,
}

impl TaskPool {
    /// Spawn the workers. The returned receiver yields every [`TaskEvent`].
    pub fn new(config: PoolConfig) -> (Self, Receiver<TaskEvent>) {
        let workers = config.workers.max(1);
        let capacity = config.queue_capacity.max(1);

        let (job_tx, job_rx) = bounded::<Job>(capacity);
        let (event_tx, event_rx) = unbounded();
        let in_flight: InFlight = Arc::new(Mutex::new(HashMap::new()));

        let handles = (0..workers)
            .map(|index| spawn_worker(index, job_rx.clone(), event_tx.clone(), in_flight.clone()))
            .collect();

        info!("Task pool started ({} workers, queue {})", workers, capacity);

        let pool = Self {
            inner: Arc::new(PoolInner {
                sender: Mutex::new(Some(job_tx)),
                root: CancelToken::new(),
                in_flight,
                workers: Mutex::new(handles),
                next_id: AtomicU64::new(1),
                capacity,
            }),
        };
        (pool, event_rx)
    }

    /// Queue a job. Fails immediately if the queue is full.
    pub fn submit<F>(&self, name: &str, job: F) -> Result<TaskId, PoolError>
    where
        F: FnOnce(&TaskContext) -> TaskResult + Send + 'static,
    {
        let guard = self.inner.sender.lock().unwrap_or_else(|e| e.into_inner());
        let sender = guard.as_ref().ok_or(PoolError::ShutDown)?;

        let id = TaskId::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let token = self.inner.root.child();
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, token.clone());

        let job = Job {
            id,
            name: name.to_string(),
            token,
            run: Box::new(job),
        };

        match sender.try_send(job) {
            Ok(()) => {
                debug!("Queued {} ({})", id, name);
                Ok(id)
            }
            Err(err) => {
                self.inner
                    .in_flight
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&id);
                match err {
                    TrySendError::Full(_) => {
                        warn!("Refusing {}: queue full", name);
                        Err(PoolError::QueueFull(self.inner.capacity))
                    }
                    TrySendError::Disconnected(_) => Err(PoolError::ShutDown),
                }
            }
        }
    }

    /// Cancel one queued or running task. Returns `false` if it already finished.
    pub fn cancel(&self, id: TaskId) -> bool {
        let in_flight = self.inner.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        match in_flight.get(&id) {
            Some(token) => {
                token.cancel();
                debug!("Cancellation requested for {}", id);
                true
            }
            None => false,
        }
    }

    /// Cancel every queued or running task. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let in_flight = self.inner.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        for token in in_flight.values() {
            token.cancel();
        }
        if !in_flight.is_empty() {
            info!("Cancelling {} background task(s)", in_flight.len());
        }
        in_flight.len()
    }

    /// Number of queued plus running tasks.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Stop accepting jobs, cancel outstanding ones and join the workers.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

fn spawn_worker(
    index: usize,
    jobs: Receiver<Job>,
    events: Sender<TaskEvent>,
    in_flight: InFlight,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name(format!("task-worker-{}", index))
        .spawn(move || {
            debug!("Task worker {} started", index);
            run_worker_loop(jobs, events, in_flight);
            debug!("Task worker {} stopped", index);
        })
        .expect("Failed to spawn task worker thread")
}

fn run_worker_loop(jobs: Receiver<Job>, events: Sender<TaskEvent>, in_flight: InFlight) {
    // Ends once every sender is dropped and the queue is drained.
    while let Ok(job) = jobs.recv() {
        let Job { id, name, token, run } = job;

        let event = if token.is_cancelled() {
            debug!("{} cancelled before start", id);
            TaskEvent::Cancelled { task_id: id }
        } else {
            let _ = events.send(TaskEvent::Started {
                task_id: id,
                name: name.clone(),
            });
            let ctx = TaskContext {
                task_id: id,
                token,
                events: events.clone(),
            };
            execute(id, &name, run, &ctx)
        };

        in_flight.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
        let _ = events.send(event);
    }
}

/// Run one job inside a panic isolation boundary.
fn execute(id: TaskId, name: &str, run: JobFn, ctx: &TaskContext) -> TaskEvent {
    match panic::catch_unwind(AssertUnwindSafe(|| run(ctx))) {
        Ok(Ok(detail)) => {
            info!("{} ({}) completed: {}", id, name, detail);
            TaskEvent::Completed { task_id: id, detail }
        }
        Ok(Err(TaskError::Cancelled)) => {
            info!("{} ({}) cancelled", id, name);
            TaskEvent::Cancelled { task_id: id }
        }
        Ok(Err(TaskError::Failed(error))) => {
            warn!("{} ({}) failed: {}", id, name, error);
            TaskEvent::Failed { task_id: id, error }
        }
        Err(panic_info) => {
            let error = if let Some(s) = panic_info.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic_info.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic".to_string()
            };
            error!("{} ({}) panicked: {}", id, name, error);
            TaskEvent::Panicked { task_id: id, error }
        }
    }
}
