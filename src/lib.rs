//! Bounded concurrent task executor
//!
//! Callers submit tasks of one type; each task runs on its own thread from the
//! tokio blocking pool, with at most `capacity` handlers executing at once.
//!
//! - Intake is a queue with a single buffer slot. A submission waits once
//!   that slot is taken and the dispatch loop is itself waiting on the gate.
//! - The dispatch loop starts on the first submission, exactly once.
//! - The concurrency gate is a semaphore sized from the capacity stored at
//!   that first submission. Later capacity changes do not resize it.
//! - Handler panics are contained to their own execution and always give
//!   their permit back.
//!
//! ```rust,ignore
//! use bounded_executor::TaskExecutor;
//!
//! #[tokio::main]
//! async fn main() {
//!     let executor = TaskExecutor::new(2, |url: String| {
//!         println!("fetching {url}");
//!     });
//!
//!     for i in 0..5 {
//!         executor.submit(format!("https://example.com/{i}")).await.unwrap();
//!     }
//!
//!     executor.shutdown().await;
//! }
//! ```

pub mod config;
pub mod error;
pub mod executor;
pub mod logging;

pub use config::{ExecutorConfig, ExecutorSettings, LoggingSettings};
pub use error::{Error, ErrorCode, Result, SubmitError};
pub use executor::{TaskExecutor, INTAKE_BUFFER};
