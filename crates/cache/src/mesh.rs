//! Render-facing mesh handle.
//!
//! A [`Mesh`] is what scene code holds on to. Its identity never changes while
//! the cache moves its data around: payloads are swapped in and out of the
//! same object, so any `Arc<Mesh>` stays valid. Every read or display of the
//! data goes through the mesh's pluggable [`DataStrategy`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::backend::GraphicsBackend;
use crate::error::CacheError;
use crate::strategy::{DataStrategy, DisplayOutcome};

/// Process-unique mesh identifier
pub type MeshId = u64;

static NEXT_MESH_ID: AtomicU64 = AtomicU64::new(1);

/// Axis-aligned bounds, used for placeholder rendering
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BoundingBox {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl BoundingBox {
    pub fn new(min: [f32; 3], max: [f32; 3]) -> Self {
        Self { min, max }
    }
}

/// CPU-side vertex and index payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeshData {
    /// Encoded vertex buffer
    pub vertices: Vec<u8>,
    /// Encoded index buffer
    pub indices: Vec<u8>,
}

impl MeshData {
    pub fn new(vertices: Vec<u8>, indices: Vec<u8>) -> Self {
        Self { vertices, indices }
    }

    /// Vertex bytes plus index bytes
    pub fn byte_size(&self) -> usize {
        self.vertices.len() + self.indices.len()
    }
}

/// Handle to vertex/index buffers living in graphics memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuBuffers {
    /// Backend-specific buffer handle
    pub handle: u64,
    pub vertex_bytes: usize,
    pub index_bytes: usize,
}

impl GpuBuffers {
    pub fn byte_size(&self) -> usize {
        self.vertex_bytes + self.index_bytes
    }
}

/// Where a mesh's data currently lives
#[derive(Debug, Default)]
pub struct MeshPayload {
    local: Option<MeshData>,
    gpu: Option<GpuBuffers>,
}

impl MeshPayload {
    pub fn with_local(data: MeshData) -> Self {
        Self {
            local: Some(data),
            gpu: None,
        }
    }

    pub fn has_local_data(&self) -> bool {
        self.local.is_some()
    }

    pub fn is_uploaded(&self) -> bool {
        self.gpu.is_some()
    }

    pub fn local(&self) -> Option<&MeshData> {
        self.local.as_ref()
    }

    pub fn gpu(&self) -> Option<&GpuBuffers> {
        self.gpu.as_ref()
    }

    /// Bytes of CPU-side data, zero when not resident
    pub fn local_byte_size(&self) -> usize {
        self.local.as_ref().map_or(0, MeshData::byte_size)
    }

    /// Bytes of graphics memory in use, zero when not uploaded
    pub fn gpu_byte_size(&self) -> usize {
        self.gpu.as_ref().map_or(0, GpuBuffers::byte_size)
    }

    /// Replace the CPU-side data in place
    pub fn set_local(&mut self, data: MeshData) {
        self.local = Some(data);
    }

    /// Drop the CPU-side data, returning it
    pub fn release_local_data(&mut self) -> Option<MeshData> {
        self.local.take()
    }

    /// Copy the CPU-side data into graphics memory.
    ///
    /// No-op when already uploaded.
    pub fn upload(&mut self, mesh: MeshId, backend: &dyn GraphicsBackend) -> Result<(), CacheError> {
        if self.gpu.is_some() {
            return Ok(());
        }
        let data = self.local.as_ref().ok_or(CacheError::NoLocalData(mesh))?;
        self.gpu = Some(backend.upload(data)?);
        Ok(())
    }

    /// Read the graphics-memory copy back into CPU memory.
    ///
    /// No-op when the data is already local.
    pub fn download(&mut self, mesh: MeshId, backend: &dyn GraphicsBackend) -> Result<(), CacheError> {
        if self.local.is_some() {
            return Ok(());
        }
        let buffers = self.gpu.as_ref().ok_or(CacheError::NoLocalData(mesh))?;
        self.local = Some(backend.download(buffers)?);
        Ok(())
    }

    /// Release the graphics-memory buffers, if any
    pub fn remove_gpu_buffers(&mut self, backend: &dyn GraphicsBackend) {
        if let Some(buffers) = self.gpu.take() {
            backend.release(buffers);
        }
    }
}

/// A mesh whose payload may be managed by the out-of-core cache
pub struct Mesh {
    id: MeshId,
    source: PathBuf,
    bounds: BoundingBox,
    size_hint: AtomicUsize,
    payload: Mutex<MeshPayload>,
    strategy: RwLock<Arc<dyn DataStrategy>>,
}

impl Mesh {
    /// Create a mesh backed by the file at `source`.
    ///
    /// `size_hint` is the expected vertex plus index byte size, used to plan
    /// cache budgets before the data has been loaded.
    pub fn new(
        source: impl Into<PathBuf>,
        bounds: BoundingBox,
        size_hint: usize,
        payload: MeshPayload,
        strategy: Arc<dyn DataStrategy>,
    ) -> Self {
        Self {
            id: NEXT_MESH_ID.fetch_add(1, Ordering::Relaxed),
            source: source.into(),
            bounds,
            size_hint: AtomicUsize::new(size_hint),
            payload: Mutex::new(payload),
            strategy: RwLock::new(strategy),
        }
    }

    pub fn id(&self) -> MeshId {
        self.id
    }

    /// File reference the authoritative data is loaded from
    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn bounds(&self) -> &BoundingBox {
        &self.bounds
    }

    /// Byte size of the mesh data, known even while nothing is resident
    pub fn byte_size(&self) -> usize {
        self.size_hint.load(Ordering::Relaxed)
    }

    /// Lock the payload.
    ///
    /// This is the content lock: it is independent of the cache's ranking lock.
    pub fn payload(&self) -> MutexGuard<'_, MeshPayload> {
        self.payload.lock().unwrap()
    }

    /// Swap new CPU-side data into this mesh, keeping its identity
    pub fn set_local_data(&self, data: MeshData) {
        self.size_hint.store(data.byte_size(), Ordering::Relaxed);
        self.payload().set_local(data);
    }

    pub fn has_local_data(&self) -> bool {
        self.payload().has_local_data()
    }

    pub fn is_uploaded(&self) -> bool {
        self.payload().is_uploaded()
    }

    pub fn strategy(&self) -> Arc<dyn DataStrategy> {
        self.strategy.read().unwrap().clone()
    }

    pub fn set_strategy(&self, strategy: Arc<dyn DataStrategy>) {
        *self.strategy.write().unwrap() = strategy;
    }

    /// Make sure the vertex data is in CPU memory, possibly blocking
    pub fn assure_local_vertex_data(&self) -> Result<(), CacheError> {
        self.strategy().assure_local_vertex_data(self)
    }

    /// Make sure the index data is in CPU memory, possibly blocking
    pub fn assure_local_index_data(&self) -> Result<(), CacheError> {
        self.strategy().assure_local_index_data(self)
    }

    /// Submit this mesh for rendering
    pub fn display(&self, backend: &dyn GraphicsBackend) -> Result<DisplayOutcome, CacheError> {
        self.strategy().display_mesh(self, backend)
    }
}

impl fmt::Debug for Mesh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mesh")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("byte_size", &self.byte_size())
            .finish_non_exhaustive()
    }
}
