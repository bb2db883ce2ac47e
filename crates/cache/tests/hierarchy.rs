use ooc_cache::{
    blob, BoundingBox, CacheConfig, CacheContext, CacheError, CacheLevel, CacheManager, CacheObjectPriority, DirectStrategy,
    DisplayOutcome, FileMeshLoader, FileSystemLevel, HeadlessBackend, LevelCore, LevelKind, LevelStats,
    MainMemoryLevel, Mesh, MeshData, MeshPayload, MissingMode, StatsSink, MAIN_MEMORY_OBJECT_OVERHEAD,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn write_mesh(dir: &Path, name: &str, bytes: usize) -> PathBuf {
    let path = dir.join(name);
    let vertices = bytes * 3 / 4;
    blob::write_blob(&path, &MeshData::new(vec![7; vertices], vec![9; bytes - vertices])).unwrap();
    path
}

fn manager_with(config: CacheConfig, backend: Arc<HeadlessBackend>, levels: &[(LevelKind, usize)]) -> CacheManager {
    let manager = CacheManager::new(config, backend, Arc::new(FileMeshLoader));
    for (kind, size) in levels {
        manager.add_cache_level(*kind, *size).unwrap();
    }
    manager
}

/// Trigger frames until `done` holds, giving background workers time to run
fn trigger_until(manager: &CacheManager, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "cache did not settle");
        manager.trigger();
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn main_memory_prefetches_registered_mesh() {
    init_logging();
    let scratch = tempfile::tempdir().unwrap();
    let manager = manager_with(
        CacheConfig::default(),
        Arc::new(HeadlessBackend::new()),
        &[(LevelKind::FileSystem, 0), (LevelKind::MainMemory, 1024 * 1024)],
    );

    let source = write_mesh(scratch.path(), "rock.oocm", 100 * 1024);
    let mesh = Arc::new(Mesh::new(
        source,
        BoundingBox::default(),
        100 * 1024,
        MeshPayload::default(),
        Arc::new(DirectStrategy::default()),
    ));
    let id = manager.add_file_system_object(mesh.clone()).unwrap();

    let context = manager.context().clone();
    let mut frames = 0;
    while !context.is_contained(id, 1) {
        assert!(frames < 10, "mesh never reached main memory");
        manager.trigger();
        frames += 1;
    }

    let main_memory = manager.level(1).unwrap();
    assert_eq!(main_memory.used_memory(), 100 * 1024 + MAIN_MEMORY_OBJECT_OVERHEAD);
    assert!(mesh.has_local_data());
    assert!(context.is_target_state_reached(1));
    context.check_invariants().unwrap();
}

#[test]
fn round_trip_restores_level_state() {
    let scratch = tempfile::tempdir().unwrap();
    let context = Arc::new(CacheContext::new());
    let (sender, _receiver) = crossbeam_channel::unbounded();
    let file_system: Arc<dyn CacheLevel> = Arc::new(FileSystemLevel::new(
        LevelCore::new(0, LevelKind::FileSystem, 0, context.clone(), None, sender.clone()),
        Arc::new(FileMeshLoader),
    ));
    let main_memory: Arc<dyn CacheLevel> = Arc::new(MainMemoryLevel::new(
        LevelCore::new(1, LevelKind::MainMemory, 1 << 20, context.clone(), Some(file_system.clone()), sender),
        Arc::new(HeadlessBackend::new()),
        Duration::from_millis(10),
    ));

    let mesh = Arc::new(Mesh::new(
        write_mesh(scratch.path(), "trip.oocm", 2048),
        BoundingBox::default(),
        2048,
        MeshPayload::default(),
        Arc::new(DirectStrategy::default()),
    ));
    let id = context.add_object(mesh, CacheObjectPriority::default());
    let object = context.object_ref(id).unwrap();
    let before = (file_system.used_memory(), main_memory.used_memory());

    file_system.add_cache_object(&object).unwrap();
    main_memory.add_cache_object(&object).unwrap();
    assert_eq!(context.highest_level_stored(id).unwrap(), Some(1));
    assert!(main_memory.add_cache_object(&object).unwrap_err().is_invariant_violation());

    main_memory.remove_cache_object(&object).unwrap();
    file_system.remove_cache_object(&object).unwrap();

    assert_eq!(context.highest_level_stored(id).unwrap(), None);
    assert_eq!((file_system.used_memory(), main_memory.used_memory()), before);
    assert!(!object.content.has_local_data());
}

#[test]
fn skip_mode_display_still_records_usage() {
    let scratch = tempfile::tempdir().unwrap();
    let backend = Arc::new(HeadlessBackend::new());
    let manager = manager_with(
        CacheConfig::default().with_missing_mode(MissingMode::Skip),
        backend.clone(),
        &[(LevelKind::FileSystem, 0)],
    );
    let mesh = manager
        .add_mesh(write_mesh(scratch.path(), "far.oocm", 512), BoundingBox::default())
        .unwrap();
    let id = manager.object_id(&mesh).unwrap();
    let stats_before = manager.stats();

    for frame in 0..3 {
        assert_eq!(mesh.display(backend.as_ref()).unwrap(), DisplayOutcome::Skipped);
        let priority = manager.context().priority_of(id).unwrap();
        assert_eq!(priority.usage_frame(), frame);
        assert_eq!(priority.usage_count(), 1);
        manager.trigger();
    }

    assert!(!mesh.has_local_data());
    assert_eq!(manager.stats(), stats_before);
    assert_eq!(backend.draw_counts().meshes + backend.draw_counts().boxes, 0);
}

#[test]
fn placeholder_until_resident_then_drawn() {
    let scratch = tempfile::tempdir().unwrap();
    let backend = Arc::new(HeadlessBackend::new());
    let manager = manager_with(
        CacheConfig::default(),
        backend.clone(),
        &[
            (LevelKind::FileSystem, 0),
            (LevelKind::MainMemory, 1 << 20),
            (LevelKind::GraphicsMemory, 1 << 20),
        ],
    );
    let mesh = manager
        .add_mesh(write_mesh(scratch.path(), "near.oocm", 4096), BoundingBox::default())
        .unwrap();

    assert_eq!(mesh.display(backend.as_ref()).unwrap(), DisplayOutcome::Placeholder);
    trigger_until(&manager, || mesh.is_uploaded());
    assert_eq!(mesh.display(backend.as_ref()).unwrap(), DisplayOutcome::Drawn);

    let counts = backend.draw_counts();
    assert_eq!(counts.boxes, 1);
    assert_eq!(counts.meshes, 1);
    assert_eq!(backend.resident_bytes(), 4096);
}

#[test]
fn oversized_object_is_demoted_to_direct_loading() {
    init_logging();
    let scratch = tempfile::tempdir().unwrap();
    let backend = Arc::new(HeadlessBackend::new());
    let manager = manager_with(
        CacheConfig::default(),
        backend.clone(),
        &[(LevelKind::FileSystem, 0), (LevelKind::MainMemory, 1000)],
    );
    let mesh = manager
        .add_mesh(write_mesh(scratch.path(), "huge.oocm", 800), BoundingBox::default())
        .unwrap();

    manager.trigger();

    assert!(manager.object_id(&mesh).is_none());
    assert!(manager.context().is_empty());
    assert_eq!(manager.level(1).unwrap().used_memory(), 0);

    assert_eq!(mesh.display(backend.as_ref()).unwrap(), DisplayOutcome::Drawn);
    assert!(mesh.is_uploaded());
}

#[test]
fn disk_cache_keeps_the_most_important_objects() {
    init_logging();
    let scratch = tempfile::tempdir().unwrap();
    let blob_size = blob::HEADER_LEN + 1000;
    let budget = 2 * blob_size + 100;
    let manager = manager_with(
        CacheConfig::default().with_disk_dir(scratch.path().join("disk-cache")),
        Arc::new(HeadlessBackend::new()),
        &[(LevelKind::FileSystem, 0), (LevelKind::Files, budget)],
    );

    let meshes: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|name| {
            manager
                .add_mesh(write_mesh(scratch.path(), &format!("{name}.oocm"), 1000), BoundingBox::default())
                .unwrap()
        })
        .collect();
    for (mesh, priority) in meshes.iter().zip([3, 2, 1]) {
        manager.set_user_priority(mesh, priority).unwrap();
    }
    let ids: Vec<_> = meshes.iter().map(|mesh| manager.object_id(mesh).unwrap()).collect();
    let context = manager.context().clone();

    trigger_until(&manager, || {
        context.is_contained(ids[0], 1) && context.is_contained(ids[1], 1) && context.is_target_state_reached(1)
    });
    assert!(!context.is_contained(ids[2], 1));

    manager.set_user_priority(&meshes[2], 10).unwrap();
    trigger_until(&manager, || {
        context.is_contained(ids[2], 1) && !context.is_contained(ids[1], 1)
    });
    assert!(context.is_contained(ids[0], 1));

    let files = manager.level(1).unwrap();
    assert!(files.used_memory() <= files.overall_memory());
    assert_eq!(files.object_count(), 2);
}

#[test]
fn trigger_survives_a_failing_level() {
    init_logging();
    let scratch = tempfile::tempdir().unwrap();
    let backend = Arc::new(HeadlessBackend::new());
    backend.set_fail_uploads(true);
    let manager = manager_with(
        CacheConfig::default(),
        backend.clone(),
        &[
            (LevelKind::FileSystem, 0),
            (LevelKind::MainMemory, 1 << 20),
            (LevelKind::GraphicsMemory, 1 << 20),
        ],
    );
    let mesh = manager
        .add_mesh(write_mesh(scratch.path(), "stubborn.oocm", 256), BoundingBox::default())
        .unwrap();
    let id = manager.object_id(&mesh).unwrap();

    for _ in 0..3 {
        manager.trigger();
    }
    assert_eq!(manager.context().highest_level_stored(id).unwrap(), Some(1));
    assert_eq!(manager.level(2).unwrap().used_memory(), 0);
    assert_eq!(manager.frame(), 3);

    backend.set_fail_uploads(false);
    manager.trigger();
    assert_eq!(manager.context().highest_level_stored(id).unwrap(), Some(2));
    assert!(mesh.is_uploaded());
}

#[test]
fn corrupt_mesh_file_is_logged_not_fatal() {
    init_logging();
    let scratch = tempfile::tempdir().unwrap();
    let manager = manager_with(
        CacheConfig::default(),
        Arc::new(HeadlessBackend::new()),
        &[(LevelKind::FileSystem, 0), (LevelKind::MainMemory, 1 << 20)],
    );
    let source = write_mesh(scratch.path(), "damaged.oocm", 512);
    let mesh = manager.add_mesh(source.clone(), BoundingBox::default()).unwrap();
    let id = manager.object_id(&mesh).unwrap();

    // Header now claims far more vertex data than the file holds
    let mut bytes = std::fs::read(&source).unwrap();
    bytes[8..16].copy_from_slice(&(u64::MAX / 2).to_le_bytes());
    std::fs::write(&source, &bytes).unwrap();

    for _ in 0..3 {
        manager.trigger();
    }
    assert_eq!(manager.context().highest_level_stored(id).unwrap(), Some(0));
    assert_eq!(manager.level(1).unwrap().used_memory(), 0);
    assert!(!mesh.has_local_data());

    let err = manager.add_mesh(source, BoundingBox::default()).unwrap_err();
    assert!(matches!(err, CacheError::CorruptBlob { .. }));
}

#[test]
fn blocking_display_waits_for_data() {
    let scratch = tempfile::tempdir().unwrap();
    let backend = Arc::new(HeadlessBackend::new());
    let manager = manager_with(
        CacheConfig::default()
            .with_missing_mode(MissingMode::Block)
            .with_disk_dir(scratch.path().join("disk-cache")),
        backend.clone(),
        &[
            (LevelKind::FileSystem, 0),
            (LevelKind::Files, 1 << 20),
            (LevelKind::MainMemory, 1 << 20),
        ],
    );
    let mesh = manager
        .add_mesh(write_mesh(scratch.path(), "wait.oocm", 2000), BoundingBox::default())
        .unwrap();
    let id = manager.object_id(&mesh).unwrap();
    manager.set_user_priority(&mesh, 4).unwrap();

    assert_eq!(mesh.display(backend.as_ref()).unwrap(), DisplayOutcome::Drawn);
    assert!(mesh.has_local_data());
    assert_eq!(backend.draw_counts().immediate, 1);

    // The wait leaves the user priority and the recorded use in place
    let priority = manager.context().priority_of(id).unwrap();
    assert!(!manager.context().is_pinned(id));
    assert_ne!(priority, CacheObjectPriority::MAX);
    assert_eq!(priority.user_priority(), 4);
    assert_eq!(priority.usage_count(), 1);
}

#[test]
fn assure_local_data_without_main_memory_level() {
    let scratch = tempfile::tempdir().unwrap();
    let manager = manager_with(
        CacheConfig::default(),
        Arc::new(HeadlessBackend::new()),
        &[(LevelKind::FileSystem, 0)],
    );
    let mesh = manager
        .add_mesh(write_mesh(scratch.path(), "cpu.oocm", 300), BoundingBox::default())
        .unwrap();

    mesh.assure_local_index_data().unwrap();
    assert_eq!(mesh.payload().local().map(MeshData::byte_size), Some(300));
    assert!(manager.object_id(&mesh).is_some());
}

#[test]
fn shrinking_a_budget_evicts_least_important() {
    let scratch = tempfile::tempdir().unwrap();
    let manager = manager_with(
        CacheConfig::default(),
        Arc::new(HeadlessBackend::new()),
        &[(LevelKind::FileSystem, 0), (LevelKind::MainMemory, 1 << 20)],
    );
    let meshes: Vec<_> = (0..3)
        .map(|i| {
            manager
                .add_mesh(write_mesh(scratch.path(), &format!("{i}.oocm"), 1000), BoundingBox::default())
                .unwrap()
        })
        .collect();
    manager.set_user_priority(&meshes[1], 5).unwrap();
    trigger_until(&manager, || meshes.iter().all(|mesh| mesh.has_local_data()));

    manager.set_overall_memory(1, 1000 + MAIN_MEMORY_OBJECT_OVERHEAD + 10).unwrap();

    let main_memory = manager.level(1).unwrap();
    assert_eq!(main_memory.object_count(), 1);
    assert!(meshes[1].has_local_data());
    assert!(!meshes[0].has_local_data());
    assert!(!meshes[2].has_local_data());
}

#[derive(Default)]
struct RecordingSink {
    reports: Mutex<Vec<(u32, Vec<LevelStats>)>>,
}

impl StatsSink for RecordingSink {
    fn report(&self, frame: u32, levels: &[LevelStats]) {
        self.reports.lock().unwrap().push((frame, levels.to_vec()));
    }
}

#[test]
fn stats_sink_sees_every_frame() {
    let scratch = tempfile::tempdir().unwrap();
    let manager = manager_with(
        CacheConfig::default(),
        Arc::new(HeadlessBackend::new()),
        &[(LevelKind::FileSystem, 0), (LevelKind::MainMemory, 1 << 20)],
    );
    manager
        .add_mesh(write_mesh(scratch.path(), "s.oocm", 100), BoundingBox::default())
        .unwrap();
    let sink = Arc::new(RecordingSink::default());
    manager.set_stats_sink(Some(sink.clone()));

    let hook = manager.end_of_frame_hook();
    hook();
    hook();

    let reports = sink.reports.lock().unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].0, 1);
    assert_eq!(reports[1].0, 2);
    assert_eq!(reports[1].1[1].kind, LevelKind::MainMemory);
    assert_eq!(reports[1].1[1].used_memory, 100 + MAIN_MEMORY_OBJECT_OVERHEAD);
}

#[test]
fn from_config_builds_enabled_levels() {
    let scratch = tempfile::tempdir().unwrap();
    let backend = Arc::new(HeadlessBackend::new());

    let full = CacheManager::from_config(CacheConfig::new(1, 1, 1).with_disk_dir(scratch.path()), backend.clone()).unwrap();
    let kinds: Vec<_> = full.stats().iter().map(|stats| stats.kind).collect();
    assert_eq!(
        kinds,
        [
            LevelKind::FileSystem,
            LevelKind::Files,
            LevelKind::MainMemory,
            LevelKind::GraphicsMemory
        ]
    );

    let lean = CacheManager::from_config(CacheConfig::new(0, 1, 0), backend).unwrap();
    assert_eq!(lean.level_count(), 2);
    assert_eq!(lean.find_level(LevelKind::MainMemory), Some(1));
}

#[test]
fn shut_down_releases_everything() {
    let scratch = tempfile::tempdir().unwrap();
    let backend = Arc::new(HeadlessBackend::new());
    let manager = manager_with(
        CacheConfig::default(),
        backend.clone(),
        &[
            (LevelKind::FileSystem, 0),
            (LevelKind::MainMemory, 1 << 20),
            (LevelKind::GraphicsMemory, 1 << 20),
        ],
    );
    let mesh = manager
        .add_mesh(write_mesh(scratch.path(), "bye.oocm", 640), BoundingBox::default())
        .unwrap();
    trigger_until(&manager, || mesh.is_uploaded());

    manager.shut_down();
    assert!(!manager.is_system_enabled());
    assert_eq!(manager.level_count(), 0);
    assert_eq!(backend.resident_bytes(), 0);

    // Newly added meshes are loaded directly while the system is down
    let direct = manager
        .add_mesh(write_mesh(scratch.path(), "after.oocm", 64), BoundingBox::default())
        .unwrap();
    assert!(direct.has_local_data());

    manager.set_up();
    assert!(manager.is_system_enabled());
}
