//! Common test utilities and fixtures
//!
//! This module provides shared test infrastructure

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Records how many handlers run at once and in which order tasks arrive
#[derive(Clone, Default)]
pub struct ConcurrencyTracker {
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<u32>>>,
    first_start: Arc<Mutex<Option<Instant>>>,
}

impl ConcurrencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` while counted as active, recording the task on entry
    pub fn track<F: FnOnce()>(&self, task: u32, work: F) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.seen.lock().unwrap().push(task);
        self.first_start.lock().unwrap().get_or_insert_with(Instant::now);

        work();

        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    /// Handler body that sleeps while active
    pub fn sleeper(&self, delay: Duration) -> impl Fn(u32) + Send + Sync + 'static {
        let tracker = self.clone();
        move |task| tracker.track(task, || thread::sleep(delay))
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// When the first handler started, if any did
    pub fn first_start(&self) -> Option<Instant> {
        *self.first_start.lock().unwrap()
    }

    /// Tasks in the order their handlers started
    pub fn seen(&self) -> Vec<u32> {
        self.seen.lock().unwrap().clone()
    }
}

/// Handler that blocks until the test releases it, one release per task
pub struct Latch {
    release_tx: mpsc::Sender<()>,
    release_rx: Arc<Mutex<mpsc::Receiver<()>>>,
}

impl Latch {
    pub fn new() -> Self {
        let (release_tx, release_rx) = mpsc::channel();
        Self {
            release_tx,
            release_rx: Arc::new(Mutex::new(release_rx)),
        }
    }

    /// Let one waiting handler return
    pub fn release(&self) {
        self.release_tx.send(()).unwrap();
    }

    /// Handler that records into `tracker` and waits for a release
    pub fn handler(&self, tracker: &ConcurrencyTracker) -> impl Fn(u32) + Send + Sync + 'static {
        let tracker = tracker.clone();
        let release_rx = self.release_rx.clone();
        move |task| {
            tracker.track(task, || {
                let _ = release_rx.lock().unwrap().recv();
            })
        }
    }
}

/// Poll `condition` until it holds or the timeout elapses
pub async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
