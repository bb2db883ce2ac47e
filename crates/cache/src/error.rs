//! Error type for the cache hierarchy.
//!
//! Errors here are logic-level failures: a broken invariant in how levels were
//! wired or how an object moved between them, a failed I/O operation inside a
//! level, or a backend refusing an upload. Conditions a level is expected to
//! run into every frame (nothing to evict, waiting for the level below) are
//! not errors; see [`crate::level::Step`].

use std::io;
use std::path::PathBuf;

use crate::level::{LevelId, LevelKind};
use crate::object::ObjectId;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("object {object} cannot move to level {level}: highest stored level is {stored:?}")]
    LevelTransition {
        object: ObjectId,
        level: LevelId,
        stored: Option<LevelId>,
    },
    #[error("object {object} is already contained in level {level}")]
    AlreadyContained { object: ObjectId, level: LevelId },
    #[error("object {object} is not stored at level {level}")]
    NotContained { object: ObjectId, level: LevelId },
    #[error("cannot add more than {max} cache levels")]
    TooManyLevels { max: usize },
    #[error("a {kind:?} level cannot be level {level}")]
    InvalidLevel { kind: LevelKind, level: LevelId },
    #[error("no cache level {0}")]
    UnknownLevel(LevelId),
    #[error("no file system level at the bottom of the hierarchy")]
    NoFileSystemLevel,
    #[error("mesh {0} is already registered with the cache")]
    AlreadyRegistered(u64),
    #[error("mesh {0} is not registered with the cache")]
    UnknownMesh(u64),
    #[error("unknown cache object {0}")]
    UnknownObject(ObjectId),
    #[error("mesh {0} has no local data")]
    NoLocalData(u64),
    #[error("no level below {0} to load from")]
    NoLowerLevel(LevelId),
    #[error("corrupt mesh blob {path}: {reason}")]
    CorruptBlob { path: PathBuf, reason: String },
    #[error("graphics backend error: {0}")]
    Backend(String),
    #[error("cache worker has shut down")]
    WorkerShutDown(#[from] ooc_scheduler::WorkerShutDown),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CacheError {
    /// Whether this error reports a broken structural invariant.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            CacheError::LevelTransition { .. }
                | CacheError::AlreadyContained { .. }
                | CacheError::NotContained { .. }
        )
    }
}
