//! CPU memory level.
//!
//! `work()` spends its frame budget on the calling thread first and, when the
//! budget ran out with prefetch/evict work left, wakes the level's worker to
//! finish the job in the background.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ooc_scheduler::{FrameBudget, Worker, WorkerEvent};

use super::maintain_logged;
use crate::backend::GraphicsBackend;
use crate::error::CacheError;
use crate::level::{CacheLevel, LevelBook, LevelCore};
use crate::mesh::MeshData;
use crate::object::ObjectRef;

/// Fixed bookkeeping charge per resident object, on top of its buffers
pub const MAIN_MEMORY_OBJECT_OVERHEAD: usize = 256;

pub struct MainMemoryLevel {
    core: LevelCore,
    backend: Arc<dyn GraphicsBackend>,
    work_budget: Duration,
    worker: Mutex<Option<Worker<()>>>,
    active: AtomicBool,
}

impl MainMemoryLevel {
    pub fn new(core: LevelCore, backend: Arc<dyn GraphicsBackend>, work_budget: Duration) -> Self {
        Self {
            core,
            backend,
            work_budget,
            worker: Mutex::new(None),
            active: AtomicBool::new(false),
        }
    }
}

impl fmt::Debug for MainMemoryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MainMemoryLevel")
            .field("core", &self.core)
            .field("work_budget", &self.work_budget)
            .finish_non_exhaustive()
    }
}

impl CacheLevel for MainMemoryLevel {
    fn core(&self) -> &LevelCore {
        &self.core
    }

    fn init(self: Arc<Self>) -> Result<(), CacheError> {
        let weak = Arc::downgrade(&self);
        let worker = Worker::spawn(format!("ooc-main-memory-{}", self.core.id()), move |event| {
            if let (WorkerEvent::Wake, Some(level)) = (event, weak.upgrade()) {
                maintain_logged(&*level, level.work_budget, &level.active);
            }
        })?;

        self.active.store(true, Ordering::Release);
        *self.worker.lock().unwrap() = Some(worker);
        log::debug!("{}: worker started", self.core.kind());
        Ok(())
    }

    fn shutdown(&self) {
        self.active.store(false, Ordering::Release);
        let worker = self.worker.lock().unwrap().take();
        if let Some(mut worker) = worker {
            worker.shutdown();
            log::debug!("{}: worker stopped", self.core.kind());
        }
    }

    fn do_add_cache_object(&self, _book: &mut LevelBook, object: &ObjectRef) -> Result<(), CacheError> {
        let mesh = &object.content;
        {
            let mut payload = mesh.payload();
            if payload.has_local_data() {
                return Ok(());
            }
            if payload.is_uploaded() {
                return payload.download(mesh.id(), self.backend.as_ref());
            }
        }

        let lower = self.core.lower().ok_or(CacheError::NoLowerLevel(self.core.id()))?;
        lower.load_cache_object(object)?;
        if !mesh.has_local_data() {
            return Err(CacheError::NoLocalData(mesh.id()));
        }
        Ok(())
    }

    fn do_remove_cache_object(&self, _book: &mut LevelBook, object: &ObjectRef) -> Result<(), CacheError> {
        object.content.payload().release_local_data();
        Ok(())
    }

    fn do_load_cache_object(&self, object: &ObjectRef) -> Result<(), CacheError> {
        let mesh = &object.content;
        if mesh.has_local_data() {
            Ok(())
        } else {
            Err(CacheError::NoLocalData(mesh.id()))
        }
    }

    fn do_read_cache_object(&self, object: &ObjectRef) -> Result<MeshData, CacheError> {
        let mesh = &object.content;
        let resident = mesh.payload().local().cloned();
        resident.ok_or(CacheError::NoLocalData(mesh.id()))
    }

    fn cache_object_size(&self, object: &ObjectRef) -> usize {
        object.content.byte_size() + MAIN_MEMORY_OBJECT_OVERHEAD
    }

    fn do_work(&self) -> Result<(), CacheError> {
        let mut budget = FrameBudget::new(self.work_budget);
        let last = self.run_budgeted(&mut budget)?;
        if last.made_progress() {
            if let Some(worker) = self.worker.lock().unwrap().as_ref() {
                worker.wake();
            }
        }
        Ok(())
    }
}
