//! Graphics backend seam.
//!
//! The cache does not talk to a graphics API directly. Buffer uploads and the
//! three kinds of draw the data strategy can issue go through
//! [`GraphicsBackend`]; [`HeadlessBackend`] keeps "graphics memory" in a map
//! and counts draws, for tools and tests running without a GPU.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::CacheError;
use crate::mesh::{BoundingBox, GpuBuffers, MeshData};

/// Calls the cache makes into the rendering API.
///
/// Buffer management must be called from the rendering thread for APIs that
/// are not thread-safe; the graphics memory level only does so from
/// `CacheManager::trigger`.
pub trait GraphicsBackend: Send + Sync {
    /// Upload vertex and index buffers
    fn upload(&self, data: &MeshData) -> Result<GpuBuffers, CacheError>;

    /// Read buffers back into CPU memory
    fn download(&self, buffers: &GpuBuffers) -> Result<MeshData, CacheError>;

    /// Release buffers
    fn release(&self, buffers: GpuBuffers);

    /// Draw an uploaded mesh
    fn draw(&self, buffers: &GpuBuffers);

    /// Draw straight from CPU-side data
    fn draw_immediate(&self, data: &MeshData);

    /// Draw a colored box standing in for a mesh that is not resident
    fn draw_box(&self, bounds: &BoundingBox, color: [f32; 4]);

    /// Draw a box into the depth buffer only
    fn draw_box_depth_only(&self, bounds: &BoundingBox);
}

/// Draw call counters of a [`HeadlessBackend`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrawCounts {
    pub meshes: u64,
    pub immediate: u64,
    pub boxes: u64,
    pub depth_boxes: u64,
}

/// Backend that simulates graphics memory in process memory
#[derive(Debug, Default)]
pub struct HeadlessBackend {
    buffers: Mutex<HashMap<u64, MeshData>>,
    next_handle: AtomicU64,
    draws: Mutex<DrawCounts>,
    fail_uploads: AtomicBool,
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following upload fail, simulating an out-of-memory device
    pub fn set_fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::Relaxed);
    }

    /// Total bytes currently held in simulated graphics memory
    pub fn resident_bytes(&self) -> usize {
        self.buffers
            .lock()
            .unwrap()
            .values()
            .map(MeshData::byte_size)
            .sum()
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }

    pub fn draw_counts(&self) -> DrawCounts {
        *self.draws.lock().unwrap()
    }
}

impl GraphicsBackend for HeadlessBackend {
    fn upload(&self, data: &MeshData) -> Result<GpuBuffers, CacheError> {
        if self.fail_uploads.load(Ordering::Relaxed) {
            return Err(CacheError::Backend("out of device memory".to_string()));
        }
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed) + 1;
        self.buffers.lock().unwrap().insert(handle, data.clone());
        Ok(GpuBuffers {
            handle,
            vertex_bytes: data.vertices.len(),
            index_bytes: data.indices.len(),
        })
    }

    fn download(&self, buffers: &GpuBuffers) -> Result<MeshData, CacheError> {
        self.buffers
            .lock()
            .unwrap()
            .get(&buffers.handle)
            .cloned()
            .ok_or_else(|| CacheError::Backend(format!("unknown buffer {}", buffers.handle)))
    }

    fn release(&self, buffers: GpuBuffers) {
        self.buffers.lock().unwrap().remove(&buffers.handle);
    }

    fn draw(&self, _buffers: &GpuBuffers) {
        self.draws.lock().unwrap().meshes += 1;
    }

    fn draw_immediate(&self, _data: &MeshData) {
        self.draws.lock().unwrap().immediate += 1;
    }

    fn draw_box(&self, _bounds: &BoundingBox, _color: [f32; 4]) {
        self.draws.lock().unwrap().boxes += 1;
    }

    fn draw_box_depth_only(&self, _bounds: &BoundingBox) {
        self.draws.lock().unwrap().depth_boxes += 1;
    }
}
