//! Disk cache level: mesh blobs in a process-owned temporary directory.
//!
//! Adding an object clones its payload and queues the clone for the level's
//! worker, which serializes it to a blob file. Until the write lands the
//! object is served from the in-memory clone and charged with the blob size it
//! will have. Evicting an object whose write is still queued cancels the write
//! instead of touching the disk. An object whose write fails is rolled back
//! out of the level as soon as no upper level holds it.
//!
//! The worker also runs this level's prefetch/evict maintenance, since disk
//! latency is too unpredictable to borrow frame time for.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ooc_scheduler::{CancellationToken, Worker, WorkerEvent, WorkerShutDown};
use tempfile::TempDir;

use super::maintain_logged;
use crate::blob;
use crate::error::CacheError;
use crate::level::{CacheLevel, LevelBook, LevelCore};
use crate::mesh::MeshData;
use crate::object::{ObjectId, ObjectRef};

/// Where an object's blob is
enum FileEntry {
    /// Queued for the writer; `data` serves loads until then
    Pending {
        data: Arc<MeshData>,
        token: CancellationToken,
    },
    Written {
        path: PathBuf,
        size: usize,
    },
    /// The write failed; dropped from the level once nothing above holds it
    Failed { data: Arc<MeshData> },
}

struct WriteJob {
    id: ObjectId,
    path: PathBuf,
    data: Arc<MeshData>,
    token: CancellationToken,
}

/// Bounded disk cache between the file system and main memory
pub struct FilesLevel {
    core: LevelCore,
    /// Declared before `dir` so the writer is joined before the directory goes
    worker: Mutex<Option<Worker<WriteJob>>>,
    entries: Mutex<HashMap<ObjectId, FileEntry>>,
    dir: TempDir,
    next_file: AtomicU64,
    active: AtomicBool,
    work_budget: Duration,
}

impl FilesLevel {
    /// Create the level with a fresh temporary directory inside `parent`
    pub fn new(core: LevelCore, parent: &Path, work_budget: Duration) -> Result<Self, CacheError> {
        fs::create_dir_all(parent)?;
        let dir = tempfile::Builder::new().prefix("ooc-cache-").tempdir_in(parent)?;
        log::debug!("{}: blobs go to {}", core.kind(), dir.path().display());

        Ok(Self {
            core,
            worker: Mutex::new(None),
            entries: Mutex::new(HashMap::new()),
            dir,
            next_file: AtomicU64::new(0),
            active: AtomicBool::new(false),
            work_budget,
        })
    }

    /// Directory holding this level's blobs
    pub fn directory(&self) -> &Path {
        self.dir.path()
    }

    /// Number of objects whose blob has not been written yet
    pub fn pending_writes(&self) -> usize {
        self.entries
            .lock()
            .unwrap()
            .values()
            .filter(|entry| matches!(entry, FileEntry::Pending { .. }))
            .count()
    }

    fn blob_path(&self, id: ObjectId) -> PathBuf {
        // Unique per write, so a stale write can never clobber a re-added object
        let sequence = self.next_file.fetch_add(1, Ordering::Relaxed);
        self.dir.path().join(format!("{}-{}.oocm", id.raw(), sequence))
    }

    fn finish_write(&self, job: WriteJob) {
        if job.token.is_cancelled() {
            return;
        }
        let result = blob::write_blob(&job.path, &job.data);

        let mut book = self.core.book();
        let mut entries = self.entries.lock().unwrap();
        if job.token.is_cancelled() {
            // Evicted while the write was running
            remove_blob_quietly(&job.path);
            return;
        }
        match result {
            Ok(size) => {
                let size = size as usize;
                entries.insert(
                    job.id,
                    FileEntry::Written {
                        path: job.path,
                        size,
                    },
                );
                book.resize(job.id, size);
            }
            Err(err) => {
                log::warn!(
                    "{}: failed to write {} to {}: {}",
                    self.core.kind(),
                    job.id,
                    job.path.display(),
                    err
                );
                remove_blob_quietly(&job.path);
                if let Some(FileEntry::Pending { data, .. }) = entries.remove(&job.id) {
                    entries.insert(job.id, FileEntry::Failed { data });
                }
                drop(entries);
                self.drop_failed_writes(&mut book);
            }
        }
    }

    /// Roll objects whose blob could not be written back out of this level
    fn drop_failed_writes(&self, book: &mut LevelBook) {
        let failed: Vec<ObjectId> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, entry)| matches!(entry, FileEntry::Failed { .. }))
            .map(|(id, _)| *id)
            .collect();

        let context = self.core.context();
        for id in failed {
            // Still held above; retried on the next wake
            if !matches!(context.highest_level_stored(id), Ok(Some(level)) if level == self.core.id()) {
                continue;
            }
            let Some(object) = context.object_ref(id) else {
                continue;
            };
            match self.remove_locked(book, &object) {
                Ok(()) => log::debug!("{}: dropped {} after its write failed", self.core.kind(), id),
                Err(err) => log::warn!("{}: could not drop {}: {}", self.core.kind(), id, err),
            }
        }
    }
}

fn remove_blob_quietly(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != io::ErrorKind::NotFound {
            log::debug!("could not remove {}: {}", path.display(), err);
        }
    }
}

impl fmt::Debug for FilesLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilesLevel")
            .field("core", &self.core)
            .field("dir", &self.dir.path())
            .finish_non_exhaustive()
    }
}

impl CacheLevel for FilesLevel {
    fn core(&self) -> &LevelCore {
        &self.core
    }

    fn init(self: Arc<Self>) -> Result<(), CacheError> {
        let weak = Arc::downgrade(&self);
        let worker = Worker::spawn(format!("ooc-files-{}", self.core.id()), move |event| {
            let Some(level) = weak.upgrade() else {
                return;
            };
            match event {
                WorkerEvent::Task(job) => level.finish_write(job),
                WorkerEvent::Wake => {
                    level.drop_failed_writes(&mut level.core.book());
                    maintain_logged(&*level, level.work_budget, &level.active);
                }
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
        let resident = object.content.payload().local().cloned();
        let data = match resident {
            Some(data) => data,
            None => {
                let lower = self.core.lower().ok_or(CacheError::NoLowerLevel(self.core.id()))?;
                lower.read_cache_object(object)?
            }
        };

        let data = Arc::new(data);
        let token = CancellationToken::new();
        let job = WriteJob {
            id: object.id,
            path: self.blob_path(object.id),
            data: data.clone(),
            token: token.clone(),
        };
        {
            let worker = self.worker.lock().unwrap();
            worker.as_ref().ok_or(WorkerShutDown)?.submit(job)?;
        }

        self.entries
            .lock()
            .unwrap()
            .insert(object.id, FileEntry::Pending { data, token });
        Ok(())
    }

    fn do_remove_cache_object(&self, _book: &mut LevelBook, object: &ObjectRef) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().unwrap();
        match entries.remove(&object.id) {
            Some(FileEntry::Pending { token, .. }) => token.cancel(),
            Some(FileEntry::Failed { .. }) => {}
            Some(FileEntry::Written { path, size }) => {
                if let Err(err) = fs::remove_file(&path) {
                    if err.kind() != io::ErrorKind::NotFound {
                        entries.insert(object.id, FileEntry::Written { path, size });
                        return Err(err.into());
                    }
                }
            }
            None => {}
        }
        Ok(())
    }

    fn do_load_cache_object(&self, object: &ObjectRef) -> Result<(), CacheError> {
        let mesh = &object.content;
        if mesh.has_local_data() {
            return Ok(());
        }

        let path = {
            let entries = self.entries.lock().unwrap();
            match entries.get(&object.id) {
                Some(FileEntry::Pending { data, .. } | FileEntry::Failed { data }) => {
                    mesh.set_local_data(MeshData::clone(data));
                    return Ok(());
                }
                Some(FileEntry::Written { path, .. }) => path.clone(),
                None => {
                    return Err(CacheError::NotContained {
                        object: object.id,
                        level: self.core.id(),
                    })
                }
            }
        };
        mesh.set_local_data(blob::read_blob(&path)?);
        Ok(())
    }

    fn do_read_cache_object(&self, object: &ObjectRef) -> Result<MeshData, CacheError> {
        let path = {
            let entries = self.entries.lock().unwrap();
            match entries.get(&object.id) {
                Some(FileEntry::Pending { data, .. } | FileEntry::Failed { data }) => {
                    return Ok(MeshData::clone(data));
                }
                Some(FileEntry::Written { path, .. }) => path.clone(),
                None => {
                    return Err(CacheError::NotContained {
                        object: object.id,
                        level: self.core.id(),
                    })
                }
            }
        };
        blob::read_blob(&path)
    }

    fn cache_object_size(&self, object: &ObjectRef) -> usize {
        match self.entries.lock().unwrap().get(&object.id) {
            Some(FileEntry::Pending { data, .. } | FileEntry::Failed { data }) => blob::encoded_len(data),
            Some(FileEntry::Written { size, .. }) => *size,
            None => blob::HEADER_LEN + object.content.byte_size(),
        }
    }

    fn do_work(&self) -> Result<(), CacheError> {
        if let Some(worker) = self.worker.lock().unwrap().as_ref() {
            worker.wake();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CacheContext;
    use crate::level::LevelKind;
    use crate::levels::FileSystemLevel;
    use crate::loader::FileMeshLoader;
    use crate::mesh::{BoundingBox, Mesh, MeshPayload};
    use crate::priority::CacheObjectPriority;
    use crate::strategy::DirectStrategy;
    use std::thread;
    use std::time::Instant;

    struct Fixture {
        context: Arc<CacheContext>,
        files: Arc<FilesLevel>,
        object: ObjectRef,
        data: MeshData,
        _scratch: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let scratch = tempfile::tempdir().unwrap();
        let source = scratch.path().join("source.blob");
        let data = MeshData::new(vec![5; 300], vec![6; 100]);
        blob::write_blob(&source, &data).unwrap();

        let context = Arc::new(CacheContext::new());
        let (sender, _receiver) = crossbeam_channel::unbounded();
        let file_system: Arc<dyn CacheLevel> = Arc::new(FileSystemLevel::new(
            LevelCore::new(0, LevelKind::FileSystem, 0, context.clone(), None, sender.clone()),
            Arc::new(FileMeshLoader),
        ));
        let files = Arc::new(
            FilesLevel::new(
                LevelCore::new(1, LevelKind::Files, 1 << 20, context.clone(), Some(file_system.clone()), sender),
                &scratch.path().join("cache"),
                Duration::from_millis(10),
            )
            .unwrap(),
        );
        files.clone().init().unwrap();

        let mesh = Arc::new(Mesh::new(
            &source,
            BoundingBox::default(),
            data.byte_size(),
            MeshPayload::default(),
            Arc::new(DirectStrategy::default()),
        ));
        let id = context.add_object(mesh, CacheObjectPriority::default());
        let object = context.object_ref(id).unwrap();
        file_system.add_cache_object(&object).unwrap();

        Fixture {
            context,
            files,
            object,
            data,
            _scratch: scratch,
        }
    }

    fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "{} never happened", what);
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn wait_for_writes(files: &FilesLevel) {
        wait_until("blob write", || files.pending_writes() == 0);
    }

    fn blob_names(files: &FilesLevel) -> Vec<String> {
        fs::read_dir(files.directory())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_add_writes_blob_and_releases_copy() {
        let fixture = fixture();
        let files = &fixture.files;

        files.add_cache_object(&fixture.object).unwrap();
        assert_eq!(files.used_memory(), blob::encoded_len(&fixture.data));
        assert!(!fixture.object.content.has_local_data());

        wait_for_writes(files);
        assert_eq!(fs::read_dir(files.directory()).unwrap().count(), 1);
        assert_eq!(files.used_memory(), blob::HEADER_LEN + 400);
        assert_eq!(fixture.context.highest_level_stored(fixture.object.id).unwrap(), Some(1));
    }

    #[test]
    fn test_load_reads_written_blob() {
        let fixture = fixture();
        let files = &fixture.files;
        files.add_cache_object(&fixture.object).unwrap();
        wait_for_writes(files);

        files.load_cache_object(&fixture.object).unwrap();
        assert_eq!(fixture.object.content.payload().local(), Some(&fixture.data));
    }

    #[test]
    fn test_remove_deletes_blob() {
        let fixture = fixture();
        let files = &fixture.files;
        files.add_cache_object(&fixture.object).unwrap();
        wait_for_writes(files);

        files.remove_cache_object(&fixture.object).unwrap();
        assert_eq!(files.used_memory(), 0);
        assert_eq!(files.object_count(), 0);
        assert_eq!(fs::read_dir(files.directory()).unwrap().count(), 0);
        assert_eq!(fixture.context.highest_level_stored(fixture.object.id).unwrap(), Some(0));
    }

    #[test]
    fn test_add_requires_running_worker() {
        let fixture = fixture();
        fixture.files.shutdown();

        let err = fixture.files.add_cache_object(&fixture.object).unwrap_err();
        assert!(matches!(err, CacheError::WorkerShutDown(_)));
        // Rolled back
        assert_eq!(fixture.context.highest_level_stored(fixture.object.id).unwrap(), Some(0));
        assert_eq!(fixture.files.used_memory(), 0);
    }

    #[test]
    fn test_remove_cancels_queued_write() {
        let fixture = fixture();
        let files = &fixture.files;
        {
            // The writer cannot record anything while the container lock is held
            let mut book = files.core().book();
            files.add_locked(&mut book, &fixture.object).unwrap();
            files.remove_locked(&mut book, &fixture.object).unwrap();
            assert_eq!(files.pending_writes(), 0);
            assert_eq!(book.used_memory(), 0);
        }

        // Joins a write already in flight and discards queued ones
        files.shutdown();
        assert!(blob_names(files).is_empty());
        assert_eq!(files.used_memory(), 0);
        assert_eq!(files.object_count(), 0);
        assert_eq!(fixture.context.highest_level_stored(fixture.object.id).unwrap(), Some(0));
    }

    #[test]
    fn test_remove_while_writing_discards_blob() {
        let fixture = fixture();
        let files = &fixture.files;
        let first = {
            let mut book = files.core().book();
            files.add_locked(&mut book, &fixture.object).unwrap();
            // The blob lands on disk, then the writer waits for the lock
            wait_until("blob on disk", || blob_names(files).len() == 1);
            let first = blob_names(files).remove(0);
            files.remove_locked(&mut book, &fixture.object).unwrap();
            first
        };

        wait_until("stale blob cleanup", || blob_names(files).is_empty());
        assert_eq!(files.pending_writes(), 0);
        assert_eq!(files.used_memory(), 0);

        files.add_cache_object(&fixture.object).unwrap();
        wait_for_writes(files);
        let names = blob_names(files);
        assert_eq!(names.len(), 1);
        assert_ne!(names[0], first);
        assert_eq!(files.used_memory(), blob::HEADER_LEN + 400);

        files.load_cache_object(&fixture.object).unwrap();
        assert_eq!(fixture.object.content.payload().local(), Some(&fixture.data));
    }

    #[test]
    fn test_failed_write_is_rolled_back() {
        let fixture = fixture();
        let files = &fixture.files;
        fs::remove_dir_all(files.directory()).unwrap();

        files.add_cache_object(&fixture.object).unwrap();
        wait_until("rollback", || files.object_count() == 0);

        assert_eq!(files.pending_writes(), 0);
        assert_eq!(files.used_memory(), 0);
        assert_eq!(fixture.context.highest_level_stored(fixture.object.id).unwrap(), Some(0));
        assert!(!fixture.object.content.has_local_data());
    }

    #[test]
    fn test_add_never_exposes_data_on_the_mesh() {
        let fixture = fixture();
        let files = &fixture.files;
        let mesh = fixture.object.content.clone();
        let stop = Arc::new(AtomicBool::new(false));

        let observer = {
            let mesh = mesh.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let mut seen = false;
                while !stop.load(Ordering::Acquire) {
                    seen |= mesh.has_local_data();
                }
                seen
            })
        };
        for _ in 0..20 {
            files.add_cache_object(&fixture.object).unwrap();
            files.remove_cache_object(&fixture.object).unwrap();
        }
        stop.store(true, Ordering::Release);

        assert!(!observer.join().unwrap());
        assert!(!mesh.has_local_data());
    }
}
