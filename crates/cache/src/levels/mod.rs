//! Concrete cache levels.
//!
//! | level | storage | work |
//! |-------|---------|------|
//! | [`FileSystemLevel`] | authoritative mesh files | none |
//! | [`FilesLevel`] | blob files in a temporary directory | dedicated worker |
//! | [`MainMemoryLevel`] | CPU-side buffers | budgeted pass, then worker |
//! | [`GraphicsMemoryLevel`] | uploaded buffers | budgeted pass on the calling thread |

mod file_system;
mod files;
mod graphics_memory;
mod main_memory;

pub use file_system::FileSystemLevel;
pub use files::FilesLevel;
pub use graphics_memory::GraphicsMemoryLevel;
pub use main_memory::{MainMemoryLevel, MAIN_MEMORY_OBJECT_OVERHEAD};

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use ooc_scheduler::FrameBudget;

use crate::error::CacheError;
use crate::level::{CacheLevel, Step};

/// Background maintenance: budgeted passes until the level stops making progress.
///
/// Yields between passes so the rendering thread can take the container lock
/// for the frame-end re-sort. Returns the step that ended the last pass.
pub(crate) fn maintain(level: &dyn CacheLevel, budget: Duration, active: &AtomicBool) -> Result<Step, CacheError> {
    let mut last = Step::Idle;
    while active.load(Ordering::Acquire) {
        let mut frame = FrameBudget::new(budget);
        last = level.run_budgeted(&mut frame)?;
        if !last.made_progress() {
            break;
        }
        thread::yield_now();
    }
    Ok(last)
}

/// Run [`maintain`] on a worker thread, logging instead of propagating failures
pub(crate) fn maintain_logged(level: &dyn CacheLevel, budget: Duration, active: &AtomicBool) {
    match maintain(level, budget, active) {
        Ok(step) => log::trace!("{}: background pass ended with {:?}", level.kind(), step),
        Err(err) => log::warn!("{}: background maintenance failed: {}", level.kind(), err),
    }
}
