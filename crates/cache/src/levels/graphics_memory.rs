//! Graphics memory level.
//!
//! Uploads and releases go through the graphics backend, which is only safe
//! on the rendering thread, so all of this level's work happens inside its
//! budgeted `work()` call.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ooc_scheduler::FrameBudget;

use crate::backend::GraphicsBackend;
use crate::error::CacheError;
use crate::level::{CacheLevel, LevelBook, LevelCore};
use crate::mesh::MeshData;
use crate::object::ObjectRef;

pub struct GraphicsMemoryLevel {
    core: LevelCore,
    backend: Arc<dyn GraphicsBackend>,
    work_budget: Duration,
}

impl GraphicsMemoryLevel {
    pub fn new(core: LevelCore, backend: Arc<dyn GraphicsBackend>, work_budget: Duration) -> Self {
        Self {
            core,
            backend,
            work_budget,
        }
    }
}

impl fmt::Debug for GraphicsMemoryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphicsMemoryLevel")
            .field("core", &self.core)
            .field("work_budget", &self.work_budget)
            .finish_non_exhaustive()
    }
}

impl CacheLevel for GraphicsMemoryLevel {
    fn core(&self) -> &LevelCore {
        &self.core
    }

    /// Fails with [`CacheError::NoLocalData`] unless main memory holds the data
    fn do_add_cache_object(&self, _book: &mut LevelBook, object: &ObjectRef) -> Result<(), CacheError> {
        let mesh = &object.content;
        mesh.payload().upload(mesh.id(), self.backend.as_ref())
    }

    fn do_remove_cache_object(&self, _book: &mut LevelBook, object: &ObjectRef) -> Result<(), CacheError> {
        object.content.payload().remove_gpu_buffers(self.backend.as_ref());
        Ok(())
    }

    fn do_load_cache_object(&self, object: &ObjectRef) -> Result<(), CacheError> {
        let mesh = &object.content;
        mesh.payload().download(mesh.id(), self.backend.as_ref())
    }

    fn do_read_cache_object(&self, object: &ObjectRef) -> Result<MeshData, CacheError> {
        let mesh = &object.content;
        let payload = mesh.payload();
        if let Some(data) = payload.local() {
            return Ok(data.clone());
        }
        let buffers = payload.gpu().ok_or(CacheError::NoLocalData(mesh.id()))?;
        self.backend.download(buffers)
    }

    fn cache_object_size(&self, object: &ObjectRef) -> usize {
        object.content.byte_size()
    }

    fn do_work(&self) -> Result<(), CacheError> {
        let mut budget = FrameBudget::new(self.work_budget);
        self.run_budgeted(&mut budget)?;
        Ok(())
    }
}
