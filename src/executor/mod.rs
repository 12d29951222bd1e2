//! Bounded task executor module
//!
//! Handles the task execution lifecycle:
//! - Accepting tasks through a single-slot intake queue
//! - Starting the dispatch loop on the first submission
//! - Gating concurrent handler executions with a fixed-size semaphore
//! - Draining in-flight work on shutdown

mod runner;
mod state;

pub use runner::*;
