//! Wall-clock work budgets for per-frame cache maintenance
//!
//! Cache levels that must run on the rendering thread (graphics memory) or that
//! borrow frame time before handing off to a background worker (main memory)
//! stop their prefetch/evict loop once the budget for the current frame is spent.
//! A level never does unbounded work inside a single `work()` call.

use std::time::{Duration, Instant};

/// Default wall-clock budget a cache level may spend per frame (10ms)
pub const LEVEL_WORK_BUDGET: Duration = Duration::from_millis(10);

/// Frame budget tracker for bounded maintenance loops
///
/// Created at the start of a level's `work()` call; the loop checks
/// [`FrameBudget::should_yield`] between units of work and returns as soon
/// as it reports `true`. A unit of work already started is always finished.
///
/// # Example
///
/// ```
/// use ooc_scheduler::FrameBudget;
/// use std::time::Duration;
///
/// let mut budget = FrameBudget::new(Duration::from_millis(10));
/// let mut steps = 0;
/// while !budget.should_yield() && steps < 3 {
///     steps += 1;
/// }
/// assert_eq!(steps, 3);
/// ```
#[derive(Debug, Clone)]
pub struct FrameBudget {
    /// When the current pass started
    started: Instant,

    /// Total budget for one pass
    budget: Duration,

    /// Number of yield checks performed in this pass
    check_count: u32,
}

impl FrameBudget {
    /// Create a new budget tracker that starts counting immediately
    pub fn new(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
            check_count: 0,
        }
    }

    fn is_exceeded(&self) -> bool {
        self.started.elapsed() >= self.budget
    }

    /// Check whether the caller should stop working for this pass
    ///
    /// The first check of a pass never yields, so every pass makes progress
    /// on at least one unit of work even with a zero budget.
    pub fn should_yield(&mut self) -> bool {
        self.check_count += 1;
        self.check_count > 1 && self.is_exceeded()
    }
}

impl Default for FrameBudget {
    fn default() -> Self {
        Self::new(LEVEL_WORK_BUDGET)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_frame_budget_creation() {
        let budget = FrameBudget::default();
        assert_eq!(budget.budget, LEVEL_WORK_BUDGET);
        assert!(!budget.is_exceeded());
    }

    #[test]
    fn test_frame_budget_exceeded() {
        let budget = FrameBudget::new(Duration::from_millis(2));
        thread::sleep(Duration::from_millis(4));
        assert!(budget.is_exceeded());
    }

    #[test]
    fn test_zero_budget_runs_exactly_once() {
        let mut budget = FrameBudget::new(Duration::ZERO);
        assert!(!budget.should_yield());
        assert!(budget.should_yield());
        assert_eq!(budget.check_count, 2);
    }

    #[test]
    fn test_should_yield_after_sleep() {
        let mut budget = FrameBudget::new(Duration::from_millis(2));
        assert!(!budget.should_yield());

        thread::sleep(Duration::from_millis(3));
        assert!(budget.should_yield());
    }
}
