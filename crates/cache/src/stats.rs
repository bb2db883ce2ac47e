//! Per-level counters reported once per frame.

use crate::level::{LevelId, LevelKind};

/// Snapshot of one level's occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelStats {
    pub id: LevelId,
    pub kind: LevelKind,
    /// Bytes charged to objects stored at this level
    pub used_memory: usize,
    /// Budget in bytes, 0 for unbounded levels
    pub overall_memory: usize,
    pub object_count: usize,
}

impl LevelStats {
    /// Fill ratio in `[0, 1]`, or `None` for unbounded levels
    pub fn utilization(&self) -> Option<f64> {
        if self.overall_memory == 0 {
            return None;
        }
        Some(self.used_memory as f64 / self.overall_memory as f64)
    }
}

/// Receives the level counters after every frame.
///
/// Purely observational: nothing a sink does feeds back into cache decisions.
pub trait StatsSink: Send + Sync {
    fn report(&self, frame: u32, levels: &[LevelStats]);
}

/// Sink writing the counters to the `log` facade at trace level
#[derive(Debug, Clone, Copy, Default)]
pub struct LogStatsSink;

impl StatsSink for LogStatsSink {
    fn report(&self, frame: u32, levels: &[LevelStats]) {
        for level in levels {
            log::trace!(
                "frame {}: level {} ({}) {}/{} bytes, {} objects",
                frame,
                level.id,
                level.kind,
                level.used_memory,
                level.overall_memory,
                level.object_count
            );
        }
    }
}
