//! Cache manager: owns the level hierarchy and every cache object.
//!
//! One `CacheManager` is created by the application and handed to whatever
//! needs it; clones share the same hierarchy. Scene loading registers meshes
//! through [`CacheManager::add_mesh`], the renderer calls
//! [`CacheManager::trigger`] once per frame (directly or through
//! [`CacheManager::end_of_frame_hook`]), and meshes reach back into the
//! manager through their [`OutOfCoreStrategy`].

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread;

use crossbeam_channel::{Receiver, Sender};

use crate::backend::GraphicsBackend;
use crate::config::CacheConfig;
use crate::context::CacheContext;
use crate::error::CacheError;
use crate::level::{CacheLevel, LevelBook, LevelCore, LevelId, LevelKind, OversizedObject, MAX_LEVELS};
use crate::levels::{FileSystemLevel, FilesLevel, GraphicsMemoryLevel, MainMemoryLevel};
use crate::loader::{FileMeshLoader, MeshLoader};
use crate::mesh::{BoundingBox, Mesh, MeshId, MeshPayload};
use crate::object::{ObjectId, ObjectRef};
use crate::priority::CacheObjectPriority;
use crate::stats::{LevelStats, StatsSink};
use crate::strategy::{DataStrategy, DirectStrategy, OutOfCoreStrategy};

/// Take every level's container lock, topmost first, indexed by level id
fn lock_books(levels: &[Arc<dyn CacheLevel>]) -> Vec<MutexGuard<'_, LevelBook>> {
    let mut books: Vec<_> = levels.iter().rev().map(|level| level.core().book()).collect();
    books.reverse();
    books
}

pub(crate) struct ManagerInner {
    config: CacheConfig,
    enabled: AtomicBool,
    context: Arc<CacheContext>,
    levels: RwLock<Vec<Arc<dyn CacheLevel>>>,
    meshes: Mutex<HashMap<MeshId, ObjectId>>,
    frame: AtomicU32,
    /// Serializes whole frames of level work
    trigger_lock: Mutex<()>,
    oversized_tx: Sender<OversizedObject>,
    oversized_rx: Receiver<OversizedObject>,
    backend: Arc<dyn GraphicsBackend>,
    loader: Arc<dyn MeshLoader>,
    direct: Arc<DirectStrategy>,
    out_of_core: Arc<OutOfCoreStrategy>,
    stats_sink: RwLock<Option<Arc<dyn StatsSink>>>,
}

impl ManagerInner {
    fn levels(&self) -> Vec<Arc<dyn CacheLevel>> {
        self.levels.read().unwrap().clone()
    }

    fn object_of(&self, mesh: &Mesh) -> Result<ObjectId, CacheError> {
        self.meshes
            .lock()
            .unwrap()
            .get(&mesh.id())
            .copied()
            .ok_or(CacheError::UnknownMesh(mesh.id()))
    }

    fn is_registered(&self, mesh: &Mesh) -> bool {
        self.meshes.lock().unwrap().contains_key(&mesh.id())
    }

    pub(crate) fn mesh_display(&self, mesh: &Mesh) -> Result<(), CacheError> {
        if !self.enabled.load(Ordering::Acquire) {
            return Ok(());
        }
        let id = self.object_of(mesh)?;
        self.context.update_frame_number(id, self.frame.load(Ordering::Acquire))
    }

    pub(crate) fn trigger(&self) {
        let _frame = self.trigger_lock.lock().unwrap();
        let levels = self.levels();

        self.context.on_end_frame(&levels);
        for level in &levels {
            if let Err(err) = level.work() {
                log::warn!("cache level {} ({}) failed this frame: {}", level.id(), level.kind(), err);
            }
        }

        for report in self.oversized_rx.try_iter() {
            if let Err(err) = self.remove_large_cache_object(&report.object, report.level, report.size) {
                log::warn!("failed to remove oversized {}: {}", report.object.id, err);
            }
        }

        let frame = self.frame.fetch_add(1, Ordering::AcqRel) + 1;
        let sink = self.stats_sink.read().unwrap().clone();
        if let Some(sink) = sink {
            let stats: Vec<LevelStats> = levels.iter().map(|level| level.stats()).collect();
            sink.report(frame, &stats);
        }
    }

    /// Take an object out of every level and out of the context
    fn evict_and_forget(&self, levels: &[Arc<dyn CacheLevel>], object: &ObjectRef) -> Result<(), CacheError> {
        let mut books = lock_books(levels);
        while let Some(level) = self.context.highest_level_stored(object.id)? {
            levels[level].remove_locked(&mut books[level], object)?;
        }
        self.context.remove_object(object.id)?;
        Ok(())
    }

    fn remove_large_cache_object(&self, object: &ObjectRef, level: LevelId, size: usize) -> Result<(), CacheError> {
        let mut meshes = self.meshes.lock().unwrap();
        if meshes.remove(&object.content.id()).is_none() {
            // Reported more than once before the first report was handled
            return Ok(());
        }
        log::warn!(
            "mesh {} needs {} bytes, more than half of cache level {}; it will be loaded directly from now on",
            object.content.source().display(),
            size,
            level
        );

        let levels = self.levels();
        self.evict_and_forget(&levels, object)?;
        object.content.set_strategy(self.direct.clone());
        Ok(())
    }

    /// Block until `mesh` has CPU-side data, driving frames meanwhile
    pub(crate) fn wait_until_resident(&self, mesh: &Mesh) -> Result<(), CacheError> {
        if mesh.has_local_data() {
            return Ok(());
        }
        let Ok(id) = self.object_of(mesh) else {
            return self.direct.assure_local_vertex_data(mesh);
        };

        let levels = self.levels();
        if !levels.iter().any(|level| level.kind() == LevelKind::MainMemory) {
            // Nothing would ever make the data resident; read it through the hierarchy
            let object = self.context.object_ref(id).ok_or(CacheError::UnknownObject(id))?;
            let top = levels.last().ok_or(CacheError::NoFileSystemLevel)?;
            let _books = lock_books(&levels);
            return top.load_cache_object(&object);
        }

        self.context.pin(id)?;
        let result = loop {
            if mesh.has_local_data() {
                break Ok(());
            }
            if !self.is_registered(mesh) {
                // Demoted while waiting
                break mesh.strategy().assure_local_vertex_data(mesh);
            }
            self.trigger();
            thread::yield_now();
        };

        if self.is_registered(mesh) {
            self.context.unpin(id)?;
        }
        result
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        let meshes = self.meshes.get_mut().unwrap();
        for id in meshes.values() {
            if let Some(mesh) = self.context.content(*id) {
                mesh.set_strategy(self.direct.clone());
            }
        }
        for level in self.levels.get_mut().unwrap().iter().rev() {
            level.shutdown();
        }
    }
}

/// Entry point of the out-of-core mesh cache
#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<ManagerInner>,
}

impl CacheManager {
    /// Create a manager with no levels.
    ///
    /// Levels are added bottom-up with [`CacheManager::add_cache_level`],
    /// starting with the file system level.
    pub fn new(config: CacheConfig, backend: Arc<dyn GraphicsBackend>, loader: Arc<dyn MeshLoader>) -> Self {
        let (oversized_tx, oversized_rx) = crossbeam_channel::unbounded();
        let direct = Arc::new(DirectStrategy::new(loader.clone()));
        let inner = Arc::new_cyclic(|weak| ManagerInner {
            enabled: AtomicBool::new(config.enabled),
            out_of_core: Arc::new(OutOfCoreStrategy::new(
                weak.clone(),
                config.missing_mode,
                config.placeholder_color,
            )),
            config,
            context: Arc::new(CacheContext::new()),
            levels: RwLock::new(Vec::new()),
            meshes: Mutex::new(HashMap::new()),
            frame: AtomicU32::new(0),
            trigger_lock: Mutex::new(()),
            oversized_tx,
            oversized_rx,
            backend,
            loader,
            direct,
            stats_sink: RwLock::new(None),
        });
        Self { inner }
    }

    /// Create a manager with the default hierarchy for `config`.
    ///
    /// File system first, then disk cache, main memory and graphics memory
    /// for every size that is not 0.
    pub fn from_config(config: CacheConfig, backend: Arc<dyn GraphicsBackend>) -> Result<Self, CacheError> {
        let manager = Self::new(config.clone(), backend, Arc::new(FileMeshLoader));
        manager.add_cache_level(LevelKind::FileSystem, 0)?;
        let optional = [
            (LevelKind::Files, config.disk_cache_size),
            (LevelKind::MainMemory, config.main_memory_size),
            (LevelKind::GraphicsMemory, config.graphics_memory_size),
        ];
        for (kind, size) in optional {
            if size > 0 {
                manager.add_cache_level(kind, size)?;
            }
        }
        Ok(manager)
    }

    /// Stack a new level on top of the hierarchy, returning its id.
    ///
    /// The file system level must come first; a disk cache level must sit
    /// directly on the file system level and a graphics memory level directly
    /// on a main memory level.
    pub fn add_cache_level(&self, kind: LevelKind, size: usize) -> Result<LevelId, CacheError> {
        let inner = &self.inner;
        let mut levels = inner.levels.write().unwrap();
        let id = levels.len();
        if id >= MAX_LEVELS {
            return Err(CacheError::TooManyLevels { max: MAX_LEVELS });
        }

        let below = levels.last().map(|level| level.kind());
        let valid = match kind {
            LevelKind::FileSystem => below.is_none(),
            LevelKind::Files => below == Some(LevelKind::FileSystem),
            LevelKind::MainMemory => below.is_some(),
            LevelKind::GraphicsMemory => below == Some(LevelKind::MainMemory),
        };
        if !valid {
            return Err(if below.is_none() {
                CacheError::NoFileSystemLevel
            } else {
                CacheError::InvalidLevel { kind, level: id }
            });
        }

        let size = if kind == LevelKind::FileSystem { 0 } else { size };
        let core = LevelCore::new(
            id,
            kind,
            size,
            inner.context.clone(),
            levels.last().cloned(),
            inner.oversized_tx.clone(),
        );
        let budget = inner.config.work_budget;
        let level: Arc<dyn CacheLevel> = match kind {
            LevelKind::FileSystem => Arc::new(FileSystemLevel::new(core, inner.loader.clone())),
            LevelKind::Files => Arc::new(FilesLevel::new(core, &inner.config.disk_cache_dir, budget)?),
            LevelKind::MainMemory => Arc::new(MainMemoryLevel::new(core, inner.backend.clone(), budget)),
            LevelKind::GraphicsMemory => Arc::new(GraphicsMemoryLevel::new(core, inner.backend.clone(), budget)),
        };
        level.clone().init()?;
        levels.push(level);

        log::debug!("added cache level {} ({}, {} bytes)", id, kind, size);
        Ok(id)
    }

    /// Register a mesh whose data currently lives only in its source file
    pub fn add_file_system_object(&self, mesh: Arc<Mesh>) -> Result<ObjectId, CacheError> {
        let inner = &self.inner;
        let levels = inner.levels();
        let file_system = levels
            .first()
            .filter(|level| level.kind() == LevelKind::FileSystem)
            .ok_or(CacheError::NoFileSystemLevel)?;

        let mut meshes = inner.meshes.lock().unwrap();
        if meshes.contains_key(&mesh.id()) {
            return Err(CacheError::AlreadyRegistered(mesh.id()));
        }

        let id = inner.context.add_object(mesh.clone(), CacheObjectPriority::default());
        let object = ObjectRef {
            id,
            content: mesh.clone(),
        };
        if let Err(err) = file_system.add_cache_object(&object) {
            inner.context.remove_object(id)?;
            return Err(err);
        }

        meshes.insert(mesh.id(), id);
        mesh.set_strategy(inner.out_of_core.clone());
        Ok(id)
    }

    /// Create a mesh for the blob at `source`.
    ///
    /// With the cache enabled the mesh starts empty and is filled by the
    /// cache; otherwise its data is loaded right away.
    pub fn add_mesh(&self, source: impl Into<PathBuf>, bounds: BoundingBox) -> Result<Arc<Mesh>, CacheError> {
        let inner = &self.inner;
        let source = source.into();

        if !self.is_system_enabled() {
            let data = inner.loader.load(&source)?;
            let size = data.byte_size();
            return Ok(Arc::new(Mesh::new(
                source,
                bounds,
                size,
                MeshPayload::with_local(data),
                inner.direct.clone(),
            )));
        }

        let size = inner.loader.probe_size(&source)?;
        let mesh = Arc::new(Mesh::new(
            source,
            bounds,
            size,
            MeshPayload::default(),
            inner.direct.clone(),
        ));
        self.add_file_system_object(mesh.clone())?;
        Ok(mesh)
    }

    /// Unregister a mesh; it keeps working through a direct strategy
    pub fn remove_mesh(&self, mesh: &Mesh) -> Result<(), CacheError> {
        let inner = &self.inner;
        let mut meshes = inner.meshes.lock().unwrap();
        let id = *meshes.get(&mesh.id()).ok_or(CacheError::UnknownMesh(mesh.id()))?;
        let object = inner.context.object_ref(id).ok_or(CacheError::UnknownObject(id))?;

        let levels = inner.levels();
        inner.evict_and_forget(&levels, &object)?;
        meshes.remove(&mesh.id());
        mesh.set_strategy(inner.direct.clone());
        Ok(())
    }

    /// Set a mesh's user priority, returning the previous one.
    ///
    /// Returns 0 without doing anything while the cache is disabled.
    pub fn set_user_priority(&self, mesh: &Mesh, priority: u16) -> Result<u16, CacheError> {
        if !self.is_system_enabled() {
            return Ok(0);
        }
        let id = self.inner.object_of(mesh)?;
        self.inner.context.update_user_priority(id, priority)
    }

    /// Record that `mesh` was submitted for rendering this frame
    pub fn mesh_display(&self, mesh: &Mesh) -> Result<(), CacheError> {
        self.inner.mesh_display(mesh)
    }

    /// Advance the cache by one frame.
    ///
    /// Re-sorts the object order, then lets every level work, bottom to top.
    /// A failing level is logged and skipped; the others still run.
    pub fn trigger(&self) {
        self.inner.trigger();
    }

    /// Demote an object too large for `level` out of the cache entirely
    pub fn remove_large_cache_object(&self, object: &ObjectRef, level: LevelId, size: usize) -> Result<(), CacheError> {
        self.inner.remove_large_cache_object(object, level, size)
    }

    /// Change a level's budget, evicting right away when it shrinks
    pub fn set_overall_memory(&self, level: LevelId, bytes: usize) -> Result<(), CacheError> {
        let level = self.level(level).ok_or(CacheError::UnknownLevel(level))?;
        level.set_overall_memory(bytes)
    }

    /// Drop every level and every cache object.
    ///
    /// Registered meshes fall back to a direct strategy and keep working.
    pub fn clear(&self) {
        let inner = &self.inner;
        let _frame = inner.trigger_lock.lock().unwrap();
        let mut meshes = inner.meshes.lock().unwrap();
        let mut levels = inner.levels.write().unwrap();

        {
            let mut books = lock_books(&levels);
            for (_, id) in meshes.drain() {
                let Some(object) = inner.context.object_ref(id) else {
                    continue;
                };
                object.content.set_strategy(inner.direct.clone());
                loop {
                    match inner.context.highest_level_stored(id) {
                        Ok(Some(level)) => {
                            if let Err(err) = levels[level].remove_locked(&mut books[level], &object) {
                                log::warn!("failed to evict {} from level {}: {}", id, level, err);
                                break;
                            }
                        }
                        _ => break,
                    }
                }
            }
            for id in inner.context.object_ids() {
                if let Err(err) = inner.context.remove_object(id) {
                    log::warn!("failed to forget {}: {}", id, err);
                }
            }
        }

        for level in levels.iter().rev() {
            level.shutdown();
        }
        levels.clear();
        log::debug!("cache cleared");
    }

    /// Route newly added meshes through the cache
    pub fn set_up(&self) {
        self.inner.enabled.store(true, Ordering::Release);
    }

    /// Stop routing meshes through the cache and release everything it holds
    pub fn shut_down(&self) {
        self.inner.enabled.store(false, Ordering::Release);
        self.clear();
    }

    pub fn is_system_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    /// Current counters of every level, bottom to top
    pub fn stats(&self) -> Vec<LevelStats> {
        self.inner.levels().iter().map(|level| level.stats()).collect()
    }

    /// Report level counters to `sink` after every frame
    pub fn set_stats_sink(&self, sink: Option<Arc<dyn StatsSink>>) {
        *self.inner.stats_sink.write().unwrap() = sink;
    }

    /// Callback to register with the renderer's end-of-frame hooks.
    ///
    /// Holds only a weak reference; once the manager is dropped it does nothing.
    pub fn end_of_frame_hook(&self) -> impl Fn() + Send + Sync + 'static {
        let inner = Arc::downgrade(&self.inner);
        move || {
            if let Some(inner) = inner.upgrade() {
                inner.trigger();
            }
        }
    }

    pub fn context(&self) -> &Arc<CacheContext> {
        &self.inner.context
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn backend(&self) -> &Arc<dyn GraphicsBackend> {
        &self.inner.backend
    }

    pub fn level(&self, id: LevelId) -> Option<Arc<dyn CacheLevel>> {
        self.inner.levels.read().unwrap().get(id).cloned()
    }

    pub fn level_count(&self) -> usize {
        self.inner.levels.read().unwrap().len()
    }

    /// Id of the first level of `kind`
    pub fn find_level(&self, kind: LevelKind) -> Option<LevelId> {
        self.inner
            .levels
            .read()
            .unwrap()
            .iter()
            .position(|level| level.kind() == kind)
    }

    /// Cache object registered for `mesh`
    pub fn object_id(&self, mesh: &Mesh) -> Option<ObjectId> {
        self.inner.object_of(mesh).ok()
    }

    /// Number of frames triggered so far
    pub fn frame(&self) -> u32 {
        self.inner.frame.load(Ordering::Acquire)
    }
}

impl fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheManager")
            .field("enabled", &self.is_system_enabled())
            .field("levels", &self.level_count())
            .field("objects", &self.inner.context.len())
            .field("frame", &self.frame())
            .finish()
    }
}
