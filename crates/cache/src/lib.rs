//! Out-of-core Mesh Cache Library
//!
//! Keeps the most important meshes of a scene resident in the fastest storage
//! that has room for them. A hierarchy of cache levels (file system, disk
//! cache, main memory, graphics memory) shares one global ranking of all
//! cache objects; once per frame every level prefetches the most important
//! object it is missing and evicts the least important one it holds.
//!
//! # Example
//!
//! ```no_run
//! use ooc_cache::{BoundingBox, CacheConfig, CacheManager, HeadlessBackend};
//! use std::sync::Arc;
//!
//! let config = CacheConfig::new(0, 64, 128);
//! let manager = CacheManager::from_config(config, Arc::new(HeadlessBackend::new())).unwrap();
//!
//! let mesh = manager.add_mesh("scene/rock.oocm", BoundingBox::default()).unwrap();
//! manager.set_user_priority(&mesh, 10).unwrap();
//!
//! // once per frame
//! mesh.display(manager.backend().as_ref()).unwrap();
//! manager.trigger();
//! ```

pub mod backend;
pub mod blob;
pub mod config;
pub mod context;
pub mod error;
pub mod level;
pub mod levels;
pub mod loader;
pub mod manager;
pub mod mesh;
pub mod object;
pub mod priority;
pub mod stats;
pub mod strategy;

pub use backend::{DrawCounts, GraphicsBackend, HeadlessBackend};
pub use config::{CacheConfig, ConfigError};
pub use context::{CacheContext, Ranked};
pub use error::CacheError;
pub use level::{CacheLevel, LevelBook, LevelCore, LevelId, LevelKind, OversizedObject, Step, MAX_LEVELS};
pub use levels::{FileSystemLevel, FilesLevel, GraphicsMemoryLevel, MainMemoryLevel, MAIN_MEMORY_OBJECT_OVERHEAD};
pub use loader::{FileMeshLoader, MeshLoader};
pub use manager::CacheManager;
pub use mesh::{BoundingBox, GpuBuffers, Mesh, MeshData, MeshId, MeshPayload};
pub use object::{ObjectId, ObjectRef};
pub use priority::CacheObjectPriority;
pub use stats::{LevelStats, LogStatsSink, StatsSink};
pub use strategy::{DataStrategy, DirectStrategy, DisplayOutcome, MissingMode, OutOfCoreStrategy};
