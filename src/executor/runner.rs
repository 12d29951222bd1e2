//! Task executor handle
//!
//! Intake, lazy one-shot start, capacity adjustment and shutdown.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::ExecutorSettings;
use crate::error::SubmitError;

use super::state::{Dispatcher, TaskHandler};

/// Number of tasks the intake queue buffers ahead of the dispatch loop.
///
/// Independent of the capacity: one task may wait here while the dispatch
/// loop holds another waiting for a permit. Any further submission blocks.
pub const INTAKE_BUFFER: usize = 1;

// ─────────────────────────────────────────────────────────────────
// Task Executor
// ─────────────────────────────────────────────────────────────────

/// Runs each submitted task on its own blocking thread, with at most a fixed
/// number of handlers executing at once.
///
/// The concurrency gate is sized when the first task is submitted, from the
/// capacity stored at that instant. [`set_capacity`](Self::set_capacity)
/// after that point only changes the stored value, never the gate; see
/// [`gate_size`](Self::gate_size).
///
/// Cloning is cheap and every clone feeds the same executor.
pub struct TaskExecutor<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    /// Name used in log fields
    name: Arc<str>,

    /// Handler called once per task
    handler: TaskHandler<T>,

    /// Configured capacity, read once at dispatch start
    capacity: AtomicUsize,

    /// Intake sender; `None` once shut down
    sender: RwLock<Option<mpsc::Sender<T>>>,

    /// Intake receiver, handed to the dispatch loop on start
    intake: Mutex<Option<mpsc::Receiver<T>>>,

    /// Set once the dispatch loop is started
    dispatcher: OnceLock<Dispatcher>,

    /// Closed signal for the dispatch loop
    closed: watch::Sender<bool>,

    /// Runtime the dispatch loop is spawned on
    runtime: Handle,

    #[cfg(test)]
    starts: AtomicUsize,
}

impl<T: Send + 'static> TaskExecutor<T> {
    /// Create a new executor on the current tokio runtime
    ///
    /// A capacity of 0 is accepted: submissions fill the intake queue but no
    /// handler ever runs.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn new<F>(capacity: usize, handler: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self::from_settings(&ExecutorSettings::with_capacity(capacity), handler)
    }

    /// Create a new executor from settings on the current tokio runtime
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn from_settings<F>(settings: &ExecutorSettings, handler: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self::with_handle(Handle::current(), settings, handler)
    }

    /// Create a new executor whose dispatch loop runs on `runtime`
    ///
    /// Use this to build and feed an executor from threads outside the runtime.
    pub fn with_handle<F>(runtime: Handle, settings: &ExecutorSettings, handler: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let (sender, receiver) = mpsc::channel(INTAKE_BUFFER);
        let (closed, _) = watch::channel(false);

        debug!(executor = %settings.name, capacity = settings.capacity, "Executor created");

        Self {
            inner: Arc::new(Inner {
                name: Arc::from(settings.name.as_str()),
                handler: Arc::new(handler),
                capacity: AtomicUsize::new(settings.capacity),
                sender: RwLock::new(Some(sender)),
                intake: Mutex::new(Some(receiver)),
                dispatcher: OnceLock::new(),
                closed,
                runtime,
                #[cfg(test)]
                starts: AtomicUsize::new(0),
            }),
        }
    }

    /// Submit a task, waiting while the intake queue is full
    ///
    /// The first submission starts the dispatch loop. Fails only after
    /// [`shutdown`](Self::shutdown), handing the task back.
    pub async fn submit(&self, task: T) -> Result<(), SubmitError<T>> {
        let Some(sender) = self.intake_sender() else {
            return Err(SubmitError(task));
        };

        sender.send(task).await.map_err(|e| SubmitError(e.0))
    }

    /// Submit a task from synchronous code, blocking the thread while the
    /// intake queue is full
    ///
    /// # Panics
    ///
    /// Panics when called from within an asynchronous execution context; use
    /// [`submit`](Self::submit) there.
    pub fn blocking_submit(&self, task: T) -> Result<(), SubmitError<T>> {
        let Some(sender) = self.intake_sender() else {
            return Err(SubmitError(task));
        };

        sender.blocking_send(task).map_err(|e| SubmitError(e.0))
    }

    /// Clone the intake sender, starting the dispatch loop on first use.
    ///
    /// Holding the read lock across the start orders it against shutdown: a
    /// shutdown either sees the started loop or makes this return `None`.
    fn intake_sender(&self) -> Option<mpsc::Sender<T>> {
        let guard = self.inner.sender.read();
        let sender = guard.as_ref()?.clone();
        self.inner.ensure_started();
        Some(sender)
    }

    /// Update the stored capacity
    ///
    /// Takes effect only if the dispatch loop has not started yet. Once it has,
    /// the gate keeps the size it was built with and this only changes the
    /// value reported by [`capacity`](Self::capacity).
    pub fn set_capacity(&self, capacity: usize) {
        let previous = self.inner.capacity.swap(capacity, Ordering::SeqCst);

        match self.inner.dispatcher.get() {
            Some(dispatcher) => warn!(
                executor = %self.inner.name,
                requested = capacity,
                gate_size = dispatcher.gate_size(),
                "Capacity changed after dispatch start, concurrency gate keeps its original size"
            ),
            None => debug!(
                executor = %self.inner.name,
                previous,
                capacity,
                "Capacity updated"
            ),
        }
    }

    /// Stop accepting tasks and wait for everything accepted to finish
    ///
    /// Tasks already in the intake queue, and submissions already waiting on
    /// it, are still dispatched. Returns once the dispatch loop exited and
    /// every handler returned. Later submissions fail with [`SubmitError`].
    /// With a zero capacity the queued tasks can never run and are dropped.
    ///
    /// Idempotent. Must not be awaited from inside a handler.
    pub async fn shutdown(&self) {
        let sender = self.inner.sender.write().take();
        if sender.is_some() {
            info!(executor = %self.inner.name, "Shutting down executor");
            self.inner.closed.send_replace(true);
        }
        drop(sender);

        if let Some(dispatcher) = self.inner.dispatcher.get() {
            dispatcher.wait(&self.inner.name).await;
        }

        info!(executor = %self.inner.name, "Executor shut down");
    }
}

impl<T> TaskExecutor<T> {
    /// Name used in log fields
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Currently stored capacity
    pub fn capacity(&self) -> usize {
        self.inner.capacity.load(Ordering::SeqCst)
    }

    /// Size of the concurrency gate, `None` until the first submission
    pub fn gate_size(&self) -> Option<usize> {
        self.inner.dispatcher.get().map(Dispatcher::gate_size)
    }

    /// Whether the dispatch loop has been started
    pub fn is_started(&self) -> bool {
        self.inner.dispatcher.get().is_some()
    }

    /// Whether [`shutdown`](TaskExecutor::shutdown) has been called
    pub fn is_closed(&self) -> bool {
        self.inner.sender.read().is_none()
    }
}

impl<T: Send + 'static> Inner<T> {
    /// Start the dispatch loop exactly once, sized from the current capacity
    ///
    /// The intake lock serializes racing first submitters; the receiver is
    /// moved into the dispatch loop by whichever one takes it.
    fn ensure_started(&self) -> Option<&Dispatcher> {
        if let Some(dispatcher) = self.dispatcher.get() {
            return Some(dispatcher);
        }

        let mut intake = self.intake.lock();
        // Re-check under the lock: a racing submitter may have started it
        if let Some(dispatcher) = self.dispatcher.get() {
            return Some(dispatcher);
        }
        let Some(receiver) = intake.take() else {
            warn!(executor = %self.name, "Intake receiver missing, dispatch loop not started");
            return None;
        };

        #[cfg(test)]
        self.starts.fetch_add(1, Ordering::SeqCst);

        let dispatcher = Dispatcher::start(
            &self.runtime,
            self.name.clone(),
            self.capacity.load(Ordering::SeqCst),
            receiver,
            self.handler.clone(),
            self.closed.subscribe(),
        );
        Some(self.dispatcher.get_or_init(|| dispatcher))
    }
}

impl<T> Clone for TaskExecutor<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for TaskExecutor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("name", &self.inner.name)
            .field("capacity", &self.capacity())
            .field("gate_size", &self.gate_size())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::state::MAX_GATE_SIZE;
    use std::time::Duration;

    fn noop_executor(capacity: usize) -> TaskExecutor<u32> {
        TaskExecutor::new(capacity, |_task: u32| {})
    }

    #[tokio::test]
    async fn test_executor_creation() {
        let executor = noop_executor(4);

        assert_eq!(executor.capacity(), 4);
        assert_eq!(executor.name(), "task-executor");
        assert!(!executor.is_started());
        assert!(!executor.is_closed());
        assert_eq!(executor.gate_size(), None);
    }

    #[tokio::test]
    async fn test_first_submit_starts_dispatch() {
        let executor = noop_executor(3);
        executor.submit(1).await.unwrap();

        assert!(executor.is_started());
        assert_eq!(executor.gate_size(), Some(3));
        executor.shutdown().await;
    }

    #[tokio::test]
    async fn test_set_capacity_before_start_sizes_gate() {
        let executor = noop_executor(2);
        executor.set_capacity(5);
        executor.submit(1).await.unwrap();

        assert_eq!(executor.gate_size(), Some(5));
        executor.shutdown().await;
    }

    #[tokio::test]
    async fn test_set_capacity_after_start_keeps_gate() {
        let executor = noop_executor(2);
        executor.submit(1).await.unwrap();
        executor.set_capacity(8);

        assert_eq!(executor.capacity(), 8);
        assert_eq!(executor.gate_size(), Some(2));
        executor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unbounded_capacity_clamps_gate() {
        let handled = Arc::new(AtomicUsize::new(0));
        let counter = handled.clone();
        let executor = TaskExecutor::new(usize::MAX, move |_task: u32| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for i in 0..8 {
            executor.submit(i).await.unwrap();
        }
        assert_eq!(executor.gate_size(), Some(MAX_GATE_SIZE));

        tokio::time::timeout(Duration::from_secs(5), executor.shutdown())
            .await
            .unwrap();
        assert_eq!(handled.load(Ordering::SeqCst), 8);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_first_submitters_start_once() {
        let handled = Arc::new(AtomicUsize::new(0));
        let counter = handled.clone();
        let executor = TaskExecutor::new(2, move |_task: u32| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let barrier = Arc::new(tokio::sync::Barrier::new(16));
        let submitters: Vec<_> = (0..16)
            .map(|i| {
                let executor = executor.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    executor.submit(i).await.unwrap();
                })
            })
            .collect();

        for submitter in submitters {
            submitter.await.unwrap();
        }
        executor.shutdown().await;

        assert_eq!(executor.inner.starts.load(Ordering::SeqCst), 1);
        assert_eq!(handled.load(Ordering::SeqCst), 16);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_returns_task() {
        let executor = noop_executor(1);
        executor.submit(1).await.unwrap();
        executor.shutdown().await;

        assert!(executor.is_closed());
        let err = executor.submit(2).await.unwrap_err();
        assert_eq!(err.into_inner(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_before_start() {
        let executor = noop_executor(1);
        tokio::time::timeout(Duration::from_secs(1), executor.shutdown())
            .await
            .unwrap();

        // A closed executor never starts a dispatch loop
        assert!(executor.submit(1).await.is_err());
        assert!(!executor.is_started());
        assert_eq!(executor.inner.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let executor = noop_executor(2);
        executor.submit(1).await.unwrap();

        executor.shutdown().await;
        executor.shutdown().await;
        assert!(executor.is_closed());
    }

    #[tokio::test]
    async fn test_debug_output() {
        let executor = noop_executor(2);
        let rendered = format!("{:?}", executor);
        assert!(rendered.contains("TaskExecutor"));
        assert!(rendered.contains("capacity: 2"));
    }
}
