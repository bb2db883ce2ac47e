//! Shared ranking of all cache objects.
//!
//! Every cache level asks the same two questions each frame: "which is the
//! most important object I do not hold yet?" and "which is the least important
//! object I could drop?". The context answers both from one global order of
//! all objects, sorted by descending priority, plus two cursors per level:
//!
//! - `first_missing[L]`: every object before this position is contained in L.
//! - `last_contained[L]`: none of the last `last_contained[L]` objects is
//!   contained in L.
//!
//! Cursors only ever move forward while searching, are narrowed incrementally
//! when a single object enters or leaves a level, and are cut back after a
//! re-sort to the part of the order that did not move. The order itself is
//! rebuilt once per frame by merging the sorted set of objects whose priority
//! changed into the untouched remainder, so the cost is linear in the number
//! of objects rather than a full sort.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::CacheError;
use crate::level::{CacheLevel, LevelId};
use crate::mesh::{Mesh, MeshData};
use crate::object::{CacheObject, ObjectId, ObjectRef};
use crate::priority::CacheObjectPriority;

/// An object together with its position in the global order (0 = most important)
#[derive(Debug, Clone)]
pub struct Ranked {
    pub object: ObjectRef,
    pub rank: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct LevelCursor {
    first_missing: usize,
    last_contained: usize,
}

#[derive(Debug, Default)]
struct Ranking {
    objects: HashMap<ObjectId, CacheObject>,
    /// Descending priority, ties by ascending id
    sorted: Vec<ObjectId>,
    /// Objects whose priority changed (or that are new) since the last re-sort
    updated: Vec<ObjectId>,
    cursors: Vec<LevelCursor>,
}

impl Ranking {
    fn object(&self, id: ObjectId) -> &CacheObject {
        &self.objects[&id]
    }

    fn object_mut(&mut self, id: ObjectId) -> Result<&mut CacheObject, CacheError> {
        self.objects.get_mut(&id).ok_or(CacheError::UnknownObject(id))
    }

    fn object_ref(&self, id: ObjectId) -> ObjectRef {
        ObjectRef {
            id,
            content: self.object(id).content().clone(),
        }
    }

    fn cursor_mut(&mut self, level: LevelId) -> &mut LevelCursor {
        if self.cursors.len() <= level {
            self.cursors.resize(level + 1, LevelCursor::default());
        }
        &mut self.cursors[level]
    }

    fn cursor(&self, level: LevelId) -> LevelCursor {
        self.cursors.get(level).copied().unwrap_or_default()
    }

    fn mark_updated(&mut self, id: ObjectId) {
        let Some(object) = self.objects.get_mut(&id) else {
            return;
        };
        if !object.updated {
            object.updated = true;
            self.updated.push(id);
        }
    }

    fn rank_order(&self, a: &ObjectId, b: &ObjectId) -> Ordering {
        let pa = self.object(*a).ranking_priority();
        let pb = self.object(*b).ranking_priority();
        pb.cmp(&pa).then(a.cmp(b))
    }

    fn advance_first_missing(&mut self, level: LevelId) -> usize {
        let mut position = self.cursor(level).first_missing;
        while position < self.sorted.len() && self.object(self.sorted[position]).is_contained_in(level) {
            position += 1;
        }
        self.cursor_mut(level).first_missing = position;
        position
    }

    fn advance_last_contained(&mut self, level: LevelId) -> usize {
        let len = self.sorted.len();
        let mut from_end = self.cursor(level).last_contained;
        while from_end < len && !self.object(self.sorted[len - 1 - from_end]).is_contained_in(level) {
            from_end += 1;
        }
        self.cursor_mut(level).last_contained = from_end;
        from_end
    }

    fn resort(&mut self) {
        if self.updated.is_empty() {
            return;
        }

        let mut delta = mem::take(&mut self.updated);
        let resorted = if delta.len() * 2 > self.objects.len() {
            // Bulk change: a plain sort is cheaper than merging
            let mut all: Vec<ObjectId> = self.objects.keys().copied().collect();
            all.sort_unstable_by(|a, b| self.rank_order(a, b));
            all
        } else {
            delta.sort_unstable_by(|a, b| self.rank_order(a, b));
            self.merge_delta(&delta)
        };

        let prefix = self
            .sorted
            .iter()
            .zip(&resorted)
            .take_while(|(old, new)| old == new)
            .count();
        let suffix = self
            .sorted
            .iter()
            .rev()
            .zip(resorted.iter().rev())
            .take(self.sorted.len().min(resorted.len()) - prefix)
            .take_while(|(old, new)| old == new)
            .count();

        for cursor in &mut self.cursors {
            cursor.first_missing = cursor.first_missing.min(prefix);
            cursor.last_contained = cursor.last_contained.min(suffix);
        }

        for (index, id) in resorted.iter().enumerate() {
            if let Some(object) = self.objects.get_mut(id) {
                object.sorted_index = Some(index);
                object.updated = false;
            }
        }
        self.sorted = resorted;
    }

    /// Merge the sorted `delta` into the previous order minus the updated objects.
    fn merge_delta(&self, delta: &[ObjectId]) -> Vec<ObjectId> {
        let mut merged = Vec::with_capacity(self.objects.len());
        let mut rest = self
            .sorted
            .iter()
            .copied()
            .filter(|id| !self.object(*id).updated)
            .peekable();
        let mut changed = delta.iter().copied().peekable();

        loop {
            let next = match (rest.peek().copied(), changed.peek().copied()) {
                (Some(a), Some(b)) => {
                    if self.rank_order(&a, &b) == Ordering::Greater {
                        changed.next()
                    } else {
                        rest.next()
                    }
                }
                (Some(_), None) => rest.next(),
                (None, Some(_)) => changed.next(),
                (None, None) => break,
            };
            merged.extend(next);
        }
        merged
    }
}

/// Thread-safe ranking structure shared by the manager and all levels.
///
/// Lock discipline: callers consulting the cursors of a level must hold that
/// level's container lock. The ranking lock is always taken last and never
/// held while calling into a level or touching a mesh payload.
#[derive(Debug, Default)]
pub struct CacheContext {
    ranking: Mutex<Ranking>,
    next_id: AtomicU64,
}

impl CacheContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn ranking(&self) -> MutexGuard<'_, Ranking> {
        self.ranking.lock().unwrap()
    }

    /// Register a new object; it takes part in the order from the next re-sort on
    pub fn add_object(&self, content: Arc<Mesh>, priority: CacheObjectPriority) -> ObjectId {
        let id = ObjectId::from_raw(self.next_id.fetch_add(1, AtomicOrdering::Relaxed) + 1);
        let mut ranking = self.ranking();
        ranking.objects.insert(id, CacheObject::new(content, priority));
        ranking.mark_updated(id);
        id
    }

    /// Unregister an object, returning its mesh
    pub fn remove_object(&self, id: ObjectId) -> Result<Arc<Mesh>, CacheError> {
        let mut ranking = self.ranking();
        let object = ranking.objects.remove(&id).ok_or(CacheError::UnknownObject(id))?;

        if object.updated {
            ranking.updated.retain(|other| *other != id);
        }
        if let Some(index) = object.sorted_index {
            ranking.sorted.remove(index);
            for position in index..ranking.sorted.len() {
                let moved = ranking.sorted[position];
                if let Some(other) = ranking.objects.get_mut(&moved) {
                    other.sorted_index = Some(position);
                }
            }
            // Positions shifted under every cursor
            for cursor in &mut ranking.cursors {
                *cursor = LevelCursor::default();
            }
        }
        Ok(object.content().clone())
    }

    /// Re-sort after all of this frame's priority changes.
    ///
    /// Takes every level's container lock, topmost level first, so no level is
    /// mid-way through consulting its cursors while the order changes.
    pub fn on_end_frame(&self, levels: &[Arc<dyn CacheLevel>]) {
        let _books: Vec<_> = levels.iter().rev().map(|level| level.core().book()).collect();
        self.ranking().resort();
    }

    /// Rank an object above everything else until the matching [`CacheContext::unpin`].
    ///
    /// Pins nest. The object's own priority keeps taking user-priority and
    /// usage updates while it is pinned and is what it ranks by afterwards.
    pub fn pin(&self, id: ObjectId) -> Result<(), CacheError> {
        let mut ranking = self.ranking();
        if ranking.object_mut(id)?.pin() {
            ranking.mark_updated(id);
        }
        Ok(())
    }

    /// Release one [`CacheContext::pin`]
    pub fn unpin(&self, id: ObjectId) -> Result<(), CacheError> {
        let mut ranking = self.ranking();
        if ranking.object_mut(id)?.unpin() {
            ranking.mark_updated(id);
        }
        Ok(())
    }

    pub fn is_pinned(&self, id: ObjectId) -> bool {
        self.ranking().objects.get(&id).is_some_and(CacheObject::is_pinned)
    }

    /// Set the user-controlled part of an object's priority, returning the previous value
    pub fn update_user_priority(&self, id: ObjectId, user_priority: u16) -> Result<u16, CacheError> {
        let mut ranking = self.ranking();
        let object = ranking.object_mut(id)?;
        let previous = object.priority();
        if previous.user_priority() != user_priority {
            object.set_priority(previous.with_user_priority(user_priority));
            ranking.mark_updated(id);
        }
        Ok(previous.user_priority())
    }

    /// Record that an object was used in `frame`
    pub fn update_frame_number(&self, id: ObjectId, frame: u32) -> Result<(), CacheError> {
        let mut ranking = self.ranking();
        let object = ranking.object_mut(id)?;
        let used = object.priority().used_in(frame);
        object.set_priority(used);
        ranking.mark_updated(id);
        Ok(())
    }

    /// The highest-ranked object not contained in `level`, if any
    pub fn most_important_missing_object(&self, level: LevelId) -> Option<Ranked> {
        let mut ranking = self.ranking();
        let position = ranking.advance_first_missing(level);
        let id = *ranking.sorted.get(position)?;
        Some(Ranked {
            object: ranking.object_ref(id),
            rank: position,
        })
    }

    /// The lowest-ranked object that `level` may evict.
    ///
    /// Only objects whose highest stored level is exactly `level` qualify;
    /// anything also held above must first leave the upper level.
    pub fn least_important_stored_object(&self, level: LevelId) -> Option<Ranked> {
        let mut ranking = self.ranking();
        let from_end = ranking.advance_last_contained(level);
        let len = ranking.sorted.len();
        (0..len.saturating_sub(from_end))
            .rev()
            .find(|&position| ranking.object(ranking.sorted[position]).highest_level_stored() == Some(level))
            .map(|position| Ranked {
                object: ranking.object_ref(ranking.sorted[position]),
                rank: position,
            })
    }

    /// Whether `level` holds exactly a prefix of the global order
    pub fn is_target_state_reached(&self, level: LevelId) -> bool {
        let mut ranking = self.ranking();
        let first_missing = ranking.advance_first_missing(level);
        let from_end = ranking.advance_last_contained(level);
        let len = ranking.sorted.len();
        from_end >= len || len - 1 - from_end < first_missing
    }

    /// Record that `id` entered `level`, which must be one above its current highest level
    pub fn add_object_to_level(&self, id: ObjectId, level: LevelId) -> Result<(), CacheError> {
        let mut ranking = self.ranking();
        let len = ranking.sorted.len();
        let object = ranking.object_mut(id)?;

        if object.is_contained_in(level) {
            return Err(CacheError::AlreadyContained { object: id, level });
        }
        let stored = object.highest_level_stored();
        if stored != level.checked_sub(1) {
            return Err(CacheError::LevelTransition {
                object: id,
                level,
                stored,
            });
        }
        object.set_highest_level_stored(Some(level));

        let position = object.sorted_index;
        if let Some(position) = position {
            let cursor = ranking.cursor_mut(level);
            let from_end = len - 1 - position;
            if from_end < cursor.last_contained {
                cursor.last_contained = from_end;
            }
        }
        Ok(())
    }

    /// Record that `id` left `level`, which must be its current highest level
    pub fn remove_object_from_level(&self, id: ObjectId, level: LevelId) -> Result<(), CacheError> {
        let mut ranking = self.ranking();
        let object = ranking.object_mut(id)?;

        let stored = object.highest_level_stored();
        if stored != Some(level) {
            if !object.is_contained_in(level) {
                return Err(CacheError::NotContained { object: id, level });
            }
            return Err(CacheError::LevelTransition {
                object: id,
                level,
                stored,
            });
        }
        object.set_highest_level_stored(level.checked_sub(1));

        let position = object.sorted_index;
        if let Some(position) = position {
            let cursor = ranking.cursor_mut(level);
            if position < cursor.first_missing {
                cursor.first_missing = position;
            }
        }
        Ok(())
    }

    pub fn is_contained(&self, id: ObjectId, level: LevelId) -> bool {
        self.ranking()
            .objects
            .get(&id)
            .is_some_and(|object| object.is_contained_in(level))
    }

    pub fn highest_level_stored(&self, id: ObjectId) -> Result<Option<LevelId>, CacheError> {
        let ranking = self.ranking();
        let object = ranking.objects.get(&id).ok_or(CacheError::UnknownObject(id))?;
        Ok(object.highest_level_stored())
    }

    pub fn priority_of(&self, id: ObjectId) -> Option<CacheObjectPriority> {
        self.ranking().objects.get(&id).map(CacheObject::priority)
    }

    pub fn object_ref(&self, id: ObjectId) -> Option<ObjectRef> {
        let ranking = self.ranking();
        ranking.objects.contains_key(&id).then(|| ranking.object_ref(id))
    }

    /// The mesh wrapped by an object
    pub fn content(&self, id: ObjectId) -> Option<Arc<Mesh>> {
        self.ranking().objects.get(&id).map(|object| object.content().clone())
    }

    /// Swap new data into an object's mesh without changing the mesh's identity
    pub fn set_content(&self, id: ObjectId, data: MeshData) -> Result<(), CacheError> {
        let mesh = self.content(id).ok_or(CacheError::UnknownObject(id))?;
        mesh.set_local_data(data);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.ranking().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranking().objects.is_empty()
    }

    /// Current global order, most important first
    pub fn sorted_snapshot(&self) -> Vec<ObjectId> {
        self.ranking().sorted.clone()
    }

    /// Ids of every registered object, in no particular order
    pub fn object_ids(&self) -> Vec<ObjectId> {
        self.ranking().objects.keys().copied().collect()
    }

    /// Verify the ordering and cursor invariants.
    ///
    /// Only meaningful right after `on_end_frame`, when no priority change is
    /// pending. Linear in objects times levels.
    pub fn check_invariants(&self) -> Result<(), String> {
        let ranking = self.ranking();
        let sorted = &ranking.sorted;

        if sorted.len() != ranking.objects.len() {
            return Err(format!(
                "{} objects sorted, {} registered",
                sorted.len(),
                ranking.objects.len()
            ));
        }
        for (index, pair) in sorted.windows(2).enumerate() {
            if ranking.rank_order(&pair[0], &pair[1]) != Ordering::Less {
                return Err(format!("order broken at position {index}"));
            }
        }
        for (index, id) in sorted.iter().enumerate() {
            if ranking.objects.get(id).and_then(|object| object.sorted_index) != Some(index) {
                return Err(format!("object {id} has a stale position"));
            }
        }
        for (level, cursor) in ranking.cursors.iter().enumerate() {
            if let Some(id) = sorted[..cursor.first_missing.min(sorted.len())]
                .iter()
                .find(|id| !ranking.object(**id).is_contained_in(level))
            {
                return Err(format!("level {level}: {id} is missing before first_missing"));
            }
            let tail = sorted.len().saturating_sub(cursor.last_contained);
            if let Some(id) = sorted[tail..]
                .iter()
                .find(|id| ranking.object(**id).is_contained_in(level))
            {
                return Err(format!("level {level}: {id} is contained after last_contained"));
            }
        }
        Ok(())
    }
}
