//! Ranking key for cache objects.

use std::cmp::Ordering;

/// Three-part priority of a cache object.
///
/// Compared lexicographically: user priority first, then the frame the object
/// was last used in, then how often it was used in that frame. A greater value
/// means more important. Ties between objects are broken by object id in
/// [`crate::CacheContext`], not here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CacheObjectPriority {
    user_priority: u16,
    usage_frame: u32,
    usage_count: u16,
}

impl CacheObjectPriority {
    /// Highest possible priority, used while a caller blocks on an object.
    pub const MAX: Self = Self::new(u16::MAX, u32::MAX, u16::MAX);

    pub const fn new(user_priority: u16, usage_frame: u32, usage_count: u16) -> Self {
        Self {
            user_priority,
            usage_frame,
            usage_count,
        }
    }

    pub fn user_priority(&self) -> u16 {
        self.user_priority
    }

    pub fn usage_frame(&self) -> u32 {
        self.usage_frame
    }

    pub fn usage_count(&self) -> u16 {
        self.usage_count
    }

    /// Same usage, different user priority
    pub fn with_user_priority(self, user_priority: u16) -> Self {
        Self {
            user_priority,
            ..self
        }
    }

    /// Priority after one more use in `frame`.
    ///
    /// A repeated use within the same frame bumps the use count; the first use
    /// in a new frame restarts it at one.
    pub fn used_in(self, frame: u32) -> Self {
        if self.usage_frame == frame {
            Self {
                usage_count: self.usage_count.saturating_add(1),
                ..self
            }
        } else {
            Self {
                usage_frame: frame,
                usage_count: 1,
                ..self
            }
        }
    }
}

impl PartialOrd for CacheObjectPriority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CacheObjectPriority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.user_priority
            .cmp(&other.user_priority)
            .then(self.usage_frame.cmp(&other.usage_frame))
            .then(self.usage_count.cmp(&other.usage_count))
    }
}
