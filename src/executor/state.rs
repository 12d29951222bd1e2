//! Dispatch state and the dispatch loop
//!
//! The dispatcher is created exactly once, on the first submission, and owns
//! the concurrency gate for the rest of the executor's life.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, trace, warn};

/// Caller-supplied function invoked once per task
pub(crate) type TaskHandler<T> = Arc<dyn Fn(T) + Send + Sync + 'static>;

/// Largest gate a tokio semaphore can hold and `acquire_many` can drain
pub(crate) const MAX_GATE_SIZE: usize = if Semaphore::MAX_PERMITS < u32::MAX as usize {
    Semaphore::MAX_PERMITS
} else {
    u32::MAX as usize
};

// ─────────────────────────────────────────────────────────────────
// Dispatcher
// ─────────────────────────────────────────────────────────────────

/// State of a started dispatch loop
pub(crate) struct Dispatcher {
    /// Gate size, frozen at start
    gate_size: usize,

    /// Dispatch loop handle, taken by the first shutdown
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Build the gate and spawn the dispatch loop on `runtime`
    pub(crate) fn start<T: Send + 'static>(
        runtime: &Handle,
        name: Arc<str>,
        requested: usize,
        intake: mpsc::Receiver<T>,
        handler: TaskHandler<T>,
        closed: watch::Receiver<bool>,
    ) -> Self {
        let gate_size = requested.min(MAX_GATE_SIZE);
        if gate_size < requested {
            warn!(
                executor = %name,
                requested,
                gate_size,
                "Capacity exceeds semaphore limit, clamping concurrency gate"
            );
        }

        info!(executor = %name, gate_size, "Starting dispatch loop");
        let join = runtime.spawn(dispatch(name, intake, gate_size, handler, closed));

        Self {
            gate_size,
            join: Mutex::new(Some(join)),
        }
    }

    /// Size the concurrency gate was frozen at
    pub(crate) fn gate_size(&self) -> usize {
        self.gate_size
    }

    /// Wait for the dispatch loop to exit
    ///
    /// The loop exits only after every in-flight handler returned. Concurrent
    /// callers queue on the lock and return once the first one is done.
    pub(crate) async fn wait(&self, name: &str) {
        let mut join = self.join.lock().await;
        if let Some(handle) = join.take() {
            if let Err(e) = handle.await {
                warn!(executor = %name, error = %e, "Dispatch loop terminated abnormally");
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Dispatch Loop
// ─────────────────────────────────────────────────────────────────

/// Move tasks from the intake queue to handler executions
///
/// Runs until every intake sender is gone, then waits for all permits to
/// come back so that returning means nothing is in flight.
async fn dispatch<T: Send + 'static>(
    name: Arc<str>,
    mut intake: mpsc::Receiver<T>,
    gate_size: usize,
    handler: TaskHandler<T>,
    closed: watch::Receiver<bool>,
) {
    if gate_size == 0 {
        stall(&name, intake, closed).await;
        return;
    }

    let gate = Arc::new(Semaphore::new(gate_size));

    while let Some(task) = intake.recv().await {
        // The gate is never closed, so acquisition only fails if that changes.
        let permit = match gate.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        trace!(executor = %name, available = gate.available_permits(), "Dispatching task");

        let handler = handler.clone();
        let name = name.clone();
        tokio::task::spawn_blocking(move || execute(&name, &handler, task, permit));
    }

    // gate_size is clamped to MAX_GATE_SIZE, so the cast is lossless
    match gate.acquire_many(gate_size as u32).await {
        Ok(_) => info!(executor = %name, "Dispatch loop drained"),
        Err(e) => warn!(executor = %name, error = %e, "Failed to drain concurrency gate"),
    };
}

/// Dispatch loop for a gate with no permits
///
/// Like the sized loop, it takes one task into hand and then waits for a
/// permit that never comes, so the single buffer slot fills and further
/// submissions block. On close everything held is dropped.
async fn stall<T>(name: &str, mut intake: mpsc::Receiver<T>, mut closed: watch::Receiver<bool>) {
    warn!(executor = %name, "Concurrency gate has no permits, submitted tasks will never run");

    let held = tokio::select! {
        task = intake.recv() => task,
        _ = closed.wait_for(|is_closed| *is_closed) => None,
    };

    // An error means the executor itself is gone, which also counts as closed.
    let _ = closed.wait_for(|is_closed| *is_closed).await;

    intake.close();
    let mut discarded = usize::from(held.is_some());
    while intake.try_recv().is_ok() {
        discarded += 1;
    }

    if discarded > 0 {
        warn!(executor = %name, discarded, "Discarding tasks that could never run");
    }
}

/// Run the handler for one task on a blocking thread
///
/// The permit is released when this returns, on every path. A panicking
/// handler ends only its own execution.
fn execute<T>(name: &str, handler: &TaskHandler<T>, task: T, permit: OwnedSemaphorePermit) {
    let _permit = permit;

    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(task))) {
        warn!(
            executor = %name,
            panic = %panic_message(payload.as_ref()),
            "Task handler panicked"
        );
    }
}

/// Extract a readable message from a panic payload
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
