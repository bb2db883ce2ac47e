//! Data strategies: how a mesh gets at its data.
//!
//! The renderer never loads mesh data itself. Whenever a mesh is displayed or
//! its CPU-side data is needed, the mesh asks its [`DataStrategy`]. Meshes
//! managed by the cache carry an [`OutOfCoreStrategy`], everything else (and
//! every mesh once the cache lets go of it) a [`DirectStrategy`].

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Weak};

use crate::backend::GraphicsBackend;
use crate::config::ConfigError;
use crate::error::CacheError;
use crate::loader::{FileMeshLoader, MeshLoader};
use crate::manager::ManagerInner;
use crate::mesh::Mesh;

/// What to do when a displayed mesh has no resident data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingMode {
    /// Draw nothing
    Skip,
    /// Draw a colored box in place of the mesh
    #[default]
    Placeholder,
    /// Draw the bounding box into the depth buffer only, so geometry behind
    /// it stays occluded
    DepthOnly,
    /// Stall the caller until the data is resident
    Block,
}

impl MissingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MissingMode::Skip => "skip",
            MissingMode::Placeholder => "placeholder",
            MissingMode::DepthOnly => "depth-only",
            MissingMode::Block => "block",
        }
    }
}

impl fmt::Display for MissingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MissingMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" | "none" => Ok(MissingMode::Skip),
            "placeholder" | "box" => Ok(MissingMode::Placeholder),
            "depth-only" | "depth_only" | "depth" => Ok(MissingMode::DepthOnly),
            "block" | "wait" => Ok(MissingMode::Block),
            other => Err(ConfigError::InvalidValue(format!("unknown missing mode: {}", other))),
        }
    }
}

/// What a display call ended up drawing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayOutcome {
    /// The mesh itself
    Drawn,
    /// A colored stand-in box
    Placeholder,
    /// A depth-only box
    DepthOnly,
    /// Nothing
    Skipped,
}

/// Policy a mesh consults whenever its data is accessed or displayed
pub trait DataStrategy: Send + Sync {
    /// Make the vertex data resident in CPU memory, blocking if necessary
    fn assure_local_vertex_data(&self, mesh: &Mesh) -> Result<(), CacheError>;

    /// Make the index data resident in CPU memory, blocking if necessary.
    ///
    /// Vertex and index data always travel together, so by default this is
    /// the same as [`DataStrategy::assure_local_vertex_data`].
    fn assure_local_index_data(&self, mesh: &Mesh) -> Result<(), CacheError> {
        self.assure_local_vertex_data(mesh)
    }

    /// Submit the mesh for rendering
    fn display_mesh(&self, mesh: &Mesh, backend: &dyn GraphicsBackend) -> Result<DisplayOutcome, CacheError>;
}

/// Wait-then-draw rounds before a blocking display gives up
const BLOCKING_DRAW_ATTEMPTS: usize = 8;

/// Draw whatever data the mesh currently has, if any
fn draw_resident(mesh: &Mesh, backend: &dyn GraphicsBackend) -> bool {
    let payload = mesh.payload();
    if let Some(buffers) = payload.gpu() {
        backend.draw(buffers);
        true
    } else if let Some(data) = payload.local() {
        backend.draw_immediate(data);
        true
    } else {
        false
    }
}

/// Non-cached strategy: load synchronously, upload on first display
pub struct DirectStrategy {
    loader: Arc<dyn MeshLoader>,
}

impl DirectStrategy {
    pub fn new(loader: Arc<dyn MeshLoader>) -> Self {
        Self { loader }
    }
}

impl Default for DirectStrategy {
    fn default() -> Self {
        Self::new(Arc::new(FileMeshLoader))
    }
}

impl fmt::Debug for DirectStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectStrategy").finish_non_exhaustive()
    }
}

impl DataStrategy for DirectStrategy {
    fn assure_local_vertex_data(&self, mesh: &Mesh) -> Result<(), CacheError> {
        if mesh.has_local_data() {
            return Ok(());
        }
        let data = self.loader.load(mesh.source())?;
        mesh.set_local_data(data);
        Ok(())
    }

    fn display_mesh(&self, mesh: &Mesh, backend: &dyn GraphicsBackend) -> Result<DisplayOutcome, CacheError> {
        if !mesh.is_uploaded() {
            self.assure_local_vertex_data(mesh)?;
            mesh.payload().upload(mesh.id(), backend)?;
        }
        draw_resident(mesh, backend);
        Ok(DisplayOutcome::Drawn)
    }
}

/// Strategy of meshes managed by a [`crate::CacheManager`]
pub struct OutOfCoreStrategy {
    manager: Weak<ManagerInner>,
    mode: MissingMode,
    color: [f32; 4],
}

impl OutOfCoreStrategy {
    pub(crate) fn new(manager: Weak<ManagerInner>, mode: MissingMode, color: [f32; 4]) -> Self {
        Self { manager, mode, color }
    }

    pub fn missing_mode(&self) -> MissingMode {
        self.mode
    }
}

impl fmt::Debug for OutOfCoreStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutOfCoreStrategy")
            .field("mode", &self.mode)
            .field("color", &self.color)
            .finish_non_exhaustive()
    }
}

impl DataStrategy for OutOfCoreStrategy {
    fn assure_local_vertex_data(&self, mesh: &Mesh) -> Result<(), CacheError> {
        if mesh.has_local_data() {
            return Ok(());
        }
        match self.manager.upgrade() {
            Some(manager) => manager.wait_until_resident(mesh),
            // The manager is gone; nothing will ever prefetch this mesh
            None => DirectStrategy::default().assure_local_vertex_data(mesh),
        }
    }

    fn display_mesh(&self, mesh: &Mesh, backend: &dyn GraphicsBackend) -> Result<DisplayOutcome, CacheError> {
        let manager = self.manager.upgrade();
        if let Some(manager) = &manager {
            manager.mesh_display(mesh)?;
        }

        if draw_resident(mesh, backend) {
            return Ok(DisplayOutcome::Drawn);
        }

        match self.mode {
            MissingMode::Skip => Ok(DisplayOutcome::Skipped),
            MissingMode::Placeholder => {
                backend.draw_box(mesh.bounds(), self.color);
                Ok(DisplayOutcome::Placeholder)
            }
            MissingMode::DepthOnly => {
                backend.draw_box_depth_only(mesh.bounds());
                Ok(DisplayOutcome::DepthOnly)
            }
            MissingMode::Block => {
                // A background eviction can win the race between the wait and the draw
                for _ in 0..BLOCKING_DRAW_ATTEMPTS {
                    match &manager {
                        Some(manager) => manager.wait_until_resident(mesh)?,
                        None => DirectStrategy::default().assure_local_vertex_data(mesh)?,
                    }
                    if draw_resident(mesh, backend) {
                        return Ok(DisplayOutcome::Drawn);
                    }
                }
                Err(CacheError::NoLocalData(mesh.id()))
            }
        }
    }
}
