//! One tier of the cache hierarchy.
//!
//! Levels form a strict chain: level 0 is the authoritative file system, each
//! following level sits closer to the point of use. A level "contains" an
//! object when the object's highest stored level is at or above the level's
//! id. Objects only ever move one level at a time: into L+1 once present in L,
//! out of L once no longer held in L+1.
//!
//! Concrete levels implement the `do_*` hooks; the provided methods wrap them
//! with the context bookkeeping and the used-memory accounting, and implement
//! the prefetch/evict policy shared by all bounded levels.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam_channel::Sender;
use ooc_scheduler::FrameBudget;

use crate::context::CacheContext;
use crate::error::CacheError;
use crate::mesh::MeshData;
use crate::object::{ObjectId, ObjectRef};
use crate::stats::LevelStats;

/// Position of a level in the chain, 0 = file system
pub type LevelId = usize;

/// Upper bound on the number of levels in one hierarchy
pub const MAX_LEVELS: usize = 8;

/// The concrete level types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LevelKind {
    /// Authoritative mesh files; unbounded, read-only
    FileSystem,
    /// Blob files in a temporary disk-cache directory
    Files,
    /// CPU-side buffers
    MainMemory,
    /// Buffers uploaded to the graphics device
    GraphicsMemory,
}

impl LevelKind {
    pub fn name(&self) -> &'static str {
        match self {
            LevelKind::FileSystem => "file system",
            LevelKind::Files => "disk cache",
            LevelKind::MainMemory => "main memory",
            LevelKind::GraphicsMemory => "graphics memory",
        }
    }
}

impl fmt::Display for LevelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-level bookkeeping, guarded by the level's container lock
#[derive(Debug, Default)]
pub struct LevelBook {
    used_memory: usize,
    sizes: HashMap<ObjectId, usize>,
}

impl LevelBook {
    pub fn used_memory(&self) -> usize {
        self.used_memory
    }

    pub fn object_count(&self) -> usize {
        self.sizes.len()
    }

    /// Size charged for an object stored at this level
    pub fn size_of(&self, id: ObjectId) -> Option<usize> {
        self.sizes.get(&id).copied()
    }

    fn record(&mut self, id: ObjectId, size: usize) {
        self.used_memory += size;
        if let Some(previous) = self.sizes.insert(id, size) {
            self.used_memory -= previous;
        }
    }

    fn forget(&mut self, id: ObjectId) -> usize {
        let size = self.sizes.remove(&id).unwrap_or(0);
        self.used_memory -= size;
        size
    }

    /// Re-charge an object whose real size became known after it was added
    pub fn resize(&mut self, id: ObjectId, size: usize) {
        if let Some(charged) = self.sizes.get_mut(&id) {
            self.used_memory = self.used_memory - *charged + size;
            *charged = size;
        }
    }
}

/// An object too large for a level's eviction policy
#[derive(Debug, Clone)]
pub struct OversizedObject {
    pub object: ObjectRef,
    pub level: LevelId,
    pub size: usize,
}

/// Outcome of one unit of prefetch/evict work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The object was added to this level
    Loaded(ObjectId),
    /// The object was evicted from this level
    Evicted(ObjectId),
    /// The most important missing object is not yet in the level below
    WaitingForLower(ObjectId),
    /// The object was reported for removal from the whole hierarchy
    Oversized(ObjectId),
    /// Target state reached or nothing useful left to do
    Idle,
}

impl Step {
    pub fn made_progress(&self) -> bool {
        matches!(self, Step::Loaded(_) | Step::Evicted(_))
    }
}

/// State shared by every level implementation
pub struct LevelCore {
    id: LevelId,
    kind: LevelKind,
    overall_memory: AtomicUsize,
    book: Mutex<LevelBook>,
    context: Arc<CacheContext>,
    lower: Option<Arc<dyn CacheLevel>>,
    oversized: Sender<OversizedObject>,
}

impl LevelCore {
    /// `overall_memory` of 0 means unbounded
    pub fn new(
        id: LevelId,
        kind: LevelKind,
        overall_memory: usize,
        context: Arc<CacheContext>,
        lower: Option<Arc<dyn CacheLevel>>,
        oversized: Sender<OversizedObject>,
    ) -> Self {
        Self {
            id,
            kind,
            overall_memory: AtomicUsize::new(overall_memory),
            book: Mutex::new(LevelBook::default()),
            context,
            lower,
            oversized,
        }
    }

    pub fn id(&self) -> LevelId {
        self.id
    }

    pub fn kind(&self) -> LevelKind {
        self.kind
    }

    pub fn context(&self) -> &Arc<CacheContext> {
        &self.context
    }

    pub fn lower(&self) -> Option<&Arc<dyn CacheLevel>> {
        self.lower.as_ref()
    }

    pub fn overall_memory(&self) -> usize {
        self.overall_memory.load(Ordering::Relaxed)
    }

    pub fn is_bounded(&self) -> bool {
        self.overall_memory() > 0
    }

    /// Take the container lock
    pub fn book(&self) -> MutexGuard<'_, LevelBook> {
        self.book.lock().unwrap()
    }

    fn report_oversized(&self, object: ObjectRef, size: usize) {
        let report = OversizedObject {
            object,
            level: self.id,
            size,
        };
        // The manager owns the receiver for as long as any level exists
        let _ = self.oversized.send(report);
    }
}

impl fmt::Debug for LevelCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LevelCore")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("overall_memory", &self.overall_memory())
            .finish_non_exhaustive()
    }
}

/// A tier of the cache hierarchy
pub trait CacheLevel: Send + Sync {
    fn core(&self) -> &LevelCore;

    /// Start whatever background machinery the level needs
    fn init(self: Arc<Self>) -> Result<(), CacheError> {
        Ok(())
    }

    /// Stop background machinery; called before the level is dropped
    fn shutdown(&self) {}

    /// Make the object's data resident in this level
    fn do_add_cache_object(&self, book: &mut LevelBook, object: &ObjectRef) -> Result<(), CacheError>;

    /// Drop this level's copy of the object's data
    fn do_remove_cache_object(&self, book: &mut LevelBook, object: &ObjectRef) -> Result<(), CacheError>;

    /// Bring the data of an object contained in this level into the mesh's CPU memory
    fn do_load_cache_object(&self, object: &ObjectRef) -> Result<(), CacheError>;

    /// Copy of the data of an object contained in this level; the mesh is left untouched
    fn do_read_cache_object(&self, object: &ObjectRef) -> Result<MeshData, CacheError>;

    /// Bytes the object occupies (or would occupy) in this level
    fn cache_object_size(&self, object: &ObjectRef) -> usize;

    /// Bounded per-frame maintenance
    fn do_work(&self) -> Result<(), CacheError>;

    fn id(&self) -> LevelId {
        self.core().id()
    }

    fn kind(&self) -> LevelKind {
        self.core().kind()
    }

    fn used_memory(&self) -> usize {
        self.core().book().used_memory()
    }

    fn overall_memory(&self) -> usize {
        self.core().overall_memory()
    }

    fn object_count(&self) -> usize {
        self.core().book().object_count()
    }

    fn stats(&self) -> LevelStats {
        let core = self.core();
        let book = core.book();
        LevelStats {
            id: core.id(),
            kind: core.kind(),
            used_memory: book.used_memory(),
            overall_memory: core.overall_memory(),
            object_count: book.object_count(),
        }
    }

    /// Add an object that is present in the level below
    fn add_cache_object(&self, object: &ObjectRef) -> Result<(), CacheError> {
        let mut book = self.core().book();
        self.add_locked(&mut book, object)
    }

    /// [`CacheLevel::add_cache_object`] with the container lock already held
    fn add_locked(&self, book: &mut LevelBook, object: &ObjectRef) -> Result<(), CacheError> {
        let core = self.core();
        core.context().add_object_to_level(object.id, core.id())?;

        if let Err(err) = self.do_add_cache_object(book, object) {
            core.context().remove_object_from_level(object.id, core.id())?;
            return Err(err);
        }

        let size = self.cache_object_size(object);
        book.record(object.id, size);
        log::trace!("{}: added {} ({} bytes)", core.kind(), object.id, size);
        Ok(())
    }

    /// Remove an object that is not held by the level above
    fn remove_cache_object(&self, object: &ObjectRef) -> Result<(), CacheError> {
        let mut book = self.core().book();
        self.remove_locked(&mut book, object)
    }

    /// [`CacheLevel::remove_cache_object`] with the container lock already held
    fn remove_locked(&self, book: &mut LevelBook, object: &ObjectRef) -> Result<(), CacheError> {
        let core = self.core();
        core.context().remove_object_from_level(object.id, core.id())?;

        if let Err(err) = self.do_remove_cache_object(book, object) {
            core.context().add_object_to_level(object.id, core.id())?;
            return Err(err);
        }

        let size = book.forget(object.id);
        log::trace!("{}: removed {} ({} bytes)", core.kind(), object.id, size);
        Ok(())
    }

    /// Make the object's data available in CPU memory without adding it here.
    ///
    /// Upper levels call this on the level below while holding that level's
    /// container lock, so the object cannot be evicted mid-load.
    fn load_cache_object(&self, object: &ObjectRef) -> Result<(), CacheError> {
        let core = self.core();
        if core.context().is_contained(object.id, core.id()) {
            return self.do_load_cache_object(object);
        }
        match core.lower() {
            Some(lower) => lower.load_cache_object(object),
            None => Err(CacheError::NoLowerLevel(core.id())),
        }
    }

    /// Read a detached copy of the object's data from the nearest level holding it.
    ///
    /// Unlike [`CacheLevel::load_cache_object`] this never touches the mesh's
    /// payload, so other threads cannot observe data that is about to vanish.
    /// Same locking contract as `load_cache_object`.
    fn read_cache_object(&self, object: &ObjectRef) -> Result<MeshData, CacheError> {
        let core = self.core();
        if core.context().is_contained(object.id, core.id()) {
            return self.do_read_cache_object(object);
        }
        match core.lower() {
            Some(lower) => lower.read_cache_object(object),
            None => Err(CacheError::NoLowerLevel(core.id())),
        }
    }

    /// Per-frame entry point
    fn work(&self) -> Result<(), CacheError> {
        self.do_work()
    }

    /// Evict from the bottom of the order until at most `target` bytes are used.
    ///
    /// Returns the number of evicted objects; stops early when nothing is
    /// evictable.
    fn remove_unimportant_cache_objects(&self, target: usize) -> Result<usize, CacheError> {
        let mut book = self.core().book();
        self.remove_unimportant_locked(&mut book, target)
    }

    fn remove_unimportant_locked(&self, book: &mut LevelBook, target: usize) -> Result<usize, CacheError> {
        let core = self.core();
        let mut removed = 0;
        while book.used_memory() > target {
            let Some(victim) = core.context().least_important_stored_object(core.id()) else {
                log::debug!(
                    "{}: {} bytes used, nothing left to evict towards {}",
                    core.kind(),
                    book.used_memory(),
                    target
                );
                break;
            };
            self.remove_locked(book, &victim.object)?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Change the budget, evicting immediately when it shrinks
    fn set_overall_memory(&self, bytes: usize) -> Result<(), CacheError> {
        self.core().overall_memory.store(bytes, Ordering::Relaxed);
        if bytes > 0 {
            self.remove_unimportant_cache_objects(bytes)?;
        }
        Ok(())
    }

    /// One unit of the shared prefetch/evict policy.
    ///
    /// Prefetches the most important missing object when it fits, otherwise
    /// evicts the least important stored object if that one ranks below it.
    fn step(&self, book: &mut LevelBook) -> Result<Step, CacheError> {
        let core = self.core();
        let context = core.context();
        let overall = core.overall_memory();

        if core.is_bounded() && book.used_memory() > overall {
            return match context.least_important_stored_object(core.id()) {
                Some(victim) => {
                    self.remove_locked(book, &victim.object)?;
                    Ok(Step::Evicted(victim.object.id))
                }
                None => Ok(Step::Idle),
            };
        }

        let Some(missing) = context.most_important_missing_object(core.id()) else {
            return Ok(Step::Idle);
        };

        // Keep the level below from evicting the object while it is copied up
        let _lower_book = core.lower().map(|lower| lower.core().book());
        if core.id() > 0 && !context.is_contained(missing.object.id, core.id() - 1) {
            return Ok(Step::WaitingForLower(missing.object.id));
        }

        let size = self.cache_object_size(&missing.object);
        if core.is_bounded() && size > overall / 2 {
            core.report_oversized(missing.object.clone(), size);
            return Ok(Step::Oversized(missing.object.id));
        }

        if !core.is_bounded() || book.used_memory() + size <= overall {
            self.add_locked(book, &missing.object)?;
            return Ok(Step::Loaded(missing.object.id));
        }

        if context.is_target_state_reached(core.id()) {
            return Ok(Step::Idle);
        }
        match context.least_important_stored_object(core.id()) {
            Some(victim) if victim.rank > missing.rank => {
                self.remove_locked(book, &victim.object)?;
                Ok(Step::Evicted(victim.object.id))
            }
            _ => Ok(Step::Idle),
        }
    }

    /// Run [`CacheLevel::step`] until it stops making progress or the budget is spent.
    ///
    /// The container lock is re-taken for every step so the frame-end re-sort
    /// and other threads are never locked out for a whole pass.
    fn run_budgeted(&self, budget: &mut FrameBudget) -> Result<Step, CacheError> {
        let mut last = Step::Idle;
        while !budget.should_yield() {
            let mut book = self.core().book();
            last = self.step(&mut book)?;
            if !last.made_progress() {
                break;
            }
        }
        Ok(last)
    }
}

impl fmt::Debug for dyn CacheLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.core(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_book_accounting() {
        let mut book = LevelBook::default();
        let a = ObjectId::from_raw(1);
        let b = ObjectId::from_raw(2);

        book.record(a, 100);
        book.record(b, 50);
        assert_eq!(book.used_memory(), 150);
        assert_eq!(book.object_count(), 2);

        book.resize(a, 120);
        assert_eq!(book.used_memory(), 170);
        assert_eq!(book.size_of(a), Some(120));

        assert_eq!(book.forget(a), 120);
        assert_eq!(book.forget(a), 0);
        assert_eq!(book.used_memory(), 50);
    }

    #[test]
    fn test_step_progress() {
        assert!(Step::Loaded(ObjectId::from_raw(1)).made_progress());
        assert!(Step::Evicted(ObjectId::from_raw(1)).made_progress());
        assert!(!Step::WaitingForLower(ObjectId::from_raw(1)).made_progress());
        assert!(!Step::Idle.made_progress());
    }

    #[test]
    fn test_level_kind_names() {
        assert_eq!(LevelKind::MainMemory.to_string(), "main memory");
        assert_eq!(LevelKind::Files.name(), "disk cache");
    }
}
