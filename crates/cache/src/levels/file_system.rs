//! Level 0: the mesh files themselves.

use std::fmt;
use std::sync::Arc;

use crate::error::CacheError;
use crate::level::{CacheLevel, LevelBook, LevelCore};
use crate::loader::MeshLoader;
use crate::mesh::MeshData;
use crate::object::ObjectRef;

/// Read-only, unbounded bottom level.
///
/// Every registered object is stored here from the moment it is registered.
/// Nothing is counted against a budget; loading reads the mesh's source file.
pub struct FileSystemLevel {
    core: LevelCore,
    loader: Arc<dyn MeshLoader>,
}

impl FileSystemLevel {
    pub fn new(core: LevelCore, loader: Arc<dyn MeshLoader>) -> Self {
        Self { core, loader }
    }
}

impl fmt::Debug for FileSystemLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSystemLevel").field("core", &self.core).finish_non_exhaustive()
    }
}

impl CacheLevel for FileSystemLevel {
    fn core(&self) -> &LevelCore {
        &self.core
    }

    fn do_add_cache_object(&self, _book: &mut LevelBook, _object: &ObjectRef) -> Result<(), CacheError> {
        Ok(())
    }

    fn do_remove_cache_object(&self, _book: &mut LevelBook, _object: &ObjectRef) -> Result<(), CacheError> {
        Ok(())
    }

    fn do_load_cache_object(&self, object: &ObjectRef) -> Result<(), CacheError> {
        let mesh = &object.content;
        if mesh.has_local_data() {
            return Ok(());
        }
        let data = self.loader.load(mesh.source())?;
        mesh.set_local_data(data);
        Ok(())
    }

    fn do_read_cache_object(&self, object: &ObjectRef) -> Result<MeshData, CacheError> {
        let mesh = &object.content;
        let resident = mesh.payload().local().cloned();
        match resident {
            Some(data) => Ok(data),
            None => self.loader.load(mesh.source()),
        }
    }

    fn cache_object_size(&self, _object: &ObjectRef) -> usize {
        0
    }

    fn do_work(&self) -> Result<(), CacheError> {
        Ok(())
    }
}
