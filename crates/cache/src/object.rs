//! Cache objects: one mesh plus its ranking metadata.

use std::fmt;
use std::sync::Arc;

use crate::level::LevelId;
use crate::mesh::Mesh;
use crate::priority::CacheObjectPriority;

/// Stable identifier of a cache object.
///
/// Also the identity tie-breaker between objects of equal priority: among
/// equals, the older (smaller) id ranks first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(u64);

impl ObjectId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Non-owning handle to a cache object, returned by context queries.
///
/// Cloning is cheap; holding one keeps the mesh alive but does not keep the
/// object registered.
#[derive(Debug, Clone)]
pub struct ObjectRef {
    pub id: ObjectId,
    pub content: Arc<Mesh>,
}

/// Ranking state of one registered mesh, owned by the context's arena.
#[derive(Debug)]
pub(crate) struct CacheObject {
    content: Arc<Mesh>,
    priority: CacheObjectPriority,
    /// Outstanding blocking waits; a pinned object ranks above everything
    pins: u32,
    highest_level_stored: Option<LevelId>,
    /// Priority changed since the last re-sort
    pub(crate) updated: bool,
    /// Position in the sorted order, `None` until the first re-sort
    pub(crate) sorted_index: Option<usize>,
}

impl CacheObject {
    pub(crate) fn new(content: Arc<Mesh>, priority: CacheObjectPriority) -> Self {
        Self {
            content,
            priority,
            pins: 0,
            highest_level_stored: None,
            updated: false,
            sorted_index: None,
        }
    }

    pub(crate) fn content(&self) -> &Arc<Mesh> {
        &self.content
    }

    pub(crate) fn priority(&self) -> CacheObjectPriority {
        self.priority
    }

    pub(crate) fn set_priority(&mut self, priority: CacheObjectPriority) {
        self.priority = priority;
    }

    /// The priority the global order is sorted by
    pub(crate) fn ranking_priority(&self) -> CacheObjectPriority {
        if self.pins > 0 {
            CacheObjectPriority::MAX
        } else {
            self.priority
        }
    }

    pub(crate) fn is_pinned(&self) -> bool {
        self.pins > 0
    }

    /// Returns whether the ranking priority changed
    pub(crate) fn pin(&mut self) -> bool {
        self.pins += 1;
        self.pins == 1
    }

    /// Returns whether the ranking priority changed
    pub(crate) fn unpin(&mut self) -> bool {
        match self.pins {
            0 => false,
            n => {
                self.pins = n - 1;
                self.pins == 0
            }
        }
    }

    pub(crate) fn highest_level_stored(&self) -> Option<LevelId> {
        self.highest_level_stored
    }

    pub(crate) fn set_highest_level_stored(&mut self, level: Option<LevelId>) {
        self.highest_level_stored = level;
    }

    pub(crate) fn is_contained_in(&self, level: LevelId) -> bool {
        self.highest_level_stored.is_some_and(|highest| level <= highest)
    }
}
