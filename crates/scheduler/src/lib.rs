//! Out-of-core Scheduler Library
//!
//! Execution plumbing shared by the out-of-core cache levels.
//!
//! - [`FrameBudget`] bounds how much wall-clock time a level may spend inside
//!   one per-frame `work()` call on the rendering thread.
//! - [`Worker`] is a dedicated background thread fed by a concurrent queue,
//!   used by levels whose work (disk I/O, CPU-side copies) should overlap with
//!   rendering instead of borrowing frame time.
//! - [`CancellationToken`] lets a level withdraw a queued job.
//!
//! # Example
//!
//! ```
//! use ooc_scheduler::{FrameBudget, Worker, WorkerEvent};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let done = Arc::new(AtomicUsize::new(0));
//! let done_clone = done.clone();
//! let mut worker = Worker::<()>::spawn("example-level", move |event| {
//!     if let WorkerEvent::Wake = event {
//!         let mut budget = FrameBudget::default();
//!         while !budget.should_yield() && done_clone.load(Ordering::SeqCst) < 4 {
//!             done_clone.fetch_add(1, Ordering::SeqCst);
//!         }
//!     }
//! })
//! .unwrap();
//!
//! worker.wake();
//! worker.shutdown_after_pending();
//! assert_eq!(done.load(Ordering::SeqCst), 4);
//! ```

mod cancel;
pub mod frame_budget;
mod worker;

// Re-export public API
pub use cancel::CancellationToken;
pub use frame_budget::{FrameBudget, LEVEL_WORK_BUDGET};
pub use worker::{Worker, WorkerEvent, WorkerShutDown};
