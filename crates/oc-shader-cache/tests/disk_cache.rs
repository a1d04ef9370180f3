//! Disk store coherency, codegen invalidation and cancellation

mod common;

use common::{shader, MockContext, MockTranslator};
use oc_shader_cache::specialization::GraphicsStaticState;
use oc_shader_cache::{
    CachedShaderProgram, CachedShaderStage, HostContext, HostProgramHandle, ParallelDiskCacheLoader,
    ProgramStore, ShaderCacheState, ShaderIndexes, ShaderReflection, ShaderStage,
    SpecializationState, CODEGEN_VERSION,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

fn stage(body: &[u8], kind: ShaderStage) -> Option<CachedShaderStage> {
    Some(CachedShaderStage {
        reflection: Some(ShaderReflection::new(kind)),
        code: Arc::from(shader(body)),
        cb1_data: Arc::from(&[7u8, 0, 0, 0][..]),
    })
}

fn program(vertex: &[u8], fragment: &[u8]) -> CachedShaderProgram {
    let mut stages = vec![None; 6];
    stages[1] = stage(vertex, ShaderStage::Vertex);
    stages[5] = stage(fragment, ShaderStage::Fragment);
    CachedShaderProgram {
        host_program: HostProgramHandle::NULL,
        specialization: SpecializationState::new_graphics(GraphicsStaticState::default()),
        stages,
    }
}

fn host_store(dir: &Path) -> ProgramStore {
    ProgramStore::with_host(dir, MockContext::new().store_key())
}

/// Store three programs, each with a host binary
fn populate(dir: &Path) {
    let store = host_store(dir);
    store.add_shader(&program(b"vs0", b"fs0"), b"binary 0").unwrap();
    store.add_shader(&program(b"vs1", b"fs0"), b"binary 1").unwrap();
    store.add_shader(&program(b"vs2", b"fs2"), b"binary 2").unwrap();
}

fn snapshot(dir: &Path) -> BTreeMap<String, Vec<u8>> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| {
            let path = entry.unwrap().path();
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            (name, std::fs::read(&path).unwrap())
        })
        .collect()
}

#[test]
fn test_program_count_tracks_appends_without_rescans() {
    let dir = TempDir::new().unwrap();
    let store = ProgramStore::new(dir.path());

    for i in 0..6u8 {
        let slot = store
            .add_shader(&program(&[b'v', i], &[b'f', i]), &[])
            .unwrap();
        assert_eq!(slot, i as usize);
    }
    assert_eq!(store.program_count().unwrap(), 6);
    assert_eq!(store.guest_entry_count().unwrap(), 12);
    assert_eq!(store.guest_stats().toc_scans, 1);

    // Another session appends; the next write must pick its entry up
    let other = ProgramStore::new(dir.path());
    other.add_shader(&program(b"shared v", b"shared f"), &[]).unwrap();
    store.add_shader(&program(b"shared v", b"v0"), &[]).unwrap();

    assert_eq!(store.guest_stats().toc_scans, 2);
    assert_eq!(store.program_count().unwrap(), 8);
    assert_eq!(store.guest_entry_count().unwrap(), 15);
}

#[test]
fn test_codegen_change_skips_host_binaries() {
    let dir = TempDir::new().unwrap();
    populate(dir.path());

    let store = host_store(dir.path()).with_codegen_version(CODEGEN_VERSION + 1);
    let translator = MockTranslator::default();
    let mut context = MockContext::new();
    let mut indexes = ShaderIndexes::default();
    let cancel = AtomicBool::new(false);

    let summary =
        ParallelDiskCacheLoader::new(&store, &translator, &mut context, &mut indexes, &cancel)
            .with_threads(2)
            .load(&mut |_, _, _| {})
            .unwrap();

    assert_eq!(context.binary_loads, 0);
    assert_eq!(summary.host_loaded, 0);
    assert_eq!(summary.guest_recompiled, 3);
    assert_eq!(translator.translation_count(), 6);
    assert_eq!(indexes.program_count(), 3);

    // Host binaries were rebuilt under the new version
    assert!(summary.host_cache_rewritten);
    let mut files = store.open_host_read_only().unwrap().unwrap();
    for slot in 0..3 {
        assert!(store.read_host_code(&mut files, slot).unwrap().is_some());
    }
}

#[test]
fn test_host_binaries_are_used_when_current() {
    let dir = TempDir::new().unwrap();
    populate(dir.path());
    let before = snapshot(dir.path());

    let store = host_store(dir.path());
    let translator = MockTranslator::default();
    let mut context = MockContext::new();
    let mut indexes = ShaderIndexes::default();
    let cancel = AtomicBool::new(false);

    let summary =
        ParallelDiskCacheLoader::new(&store, &translator, &mut context, &mut indexes, &cancel)
            .load(&mut |_, _, _| {})
            .unwrap();

    assert_eq!(summary.host_loaded, 3);
    assert_eq!(summary.guest_recompiled, 0);
    assert!(!summary.host_cache_rewritten);
    assert_eq!(translator.translation_count(), 0);
    assert_eq!(context.binary_loads, 3);
    assert_eq!(snapshot(dir.path()), before);
}

#[test]
fn test_cancellation_leaves_stores_untouched() {
    let dir = TempDir::new().unwrap();
    populate(dir.path());
    let before = snapshot(dir.path());

    for rejecting in [false, true] {
        let store = host_store(dir.path());
        let translator = MockTranslator::default();
        let mut context = if rejecting {
            MockContext::rejecting_binaries()
        } else {
            MockContext::new()
        };
        let mut indexes = ShaderIndexes::default();
        let cancel = AtomicBool::new(false);
        let mut last = None;

        let summary =
            ParallelDiskCacheLoader::new(&store, &translator, &mut context, &mut indexes, &cancel)
                .with_threads(1)
                .load(&mut |state, done, total| {
                    if state == ShaderCacheState::Loading && done == 1 {
                        cancel.store(true, Ordering::Relaxed);
                    }
                    last = Some((state, done, total));
                })
                .unwrap();

        assert!(summary.cancelled);
        assert!(!summary.host_cache_rewritten);
        assert!(matches!(last, Some((ShaderCacheState::Loaded, _, 3))));
        assert_eq!(snapshot(dir.path()), before);
    }
}

#[test]
fn test_cancel_during_host_rewrite_truncates_cleanly() {
    let dir = TempDir::new().unwrap();
    populate(dir.path());

    let store = host_store(dir.path());
    let translator = MockTranslator::default();
    let cancel = Arc::new(AtomicBool::new(false));
    let mut context = MockContext::rejecting_binaries();
    context.cancel_after_binaries = Some((1, cancel.clone()));
    let mut indexes = ShaderIndexes::default();

    let summary =
        ParallelDiskCacheLoader::new(&store, &translator, &mut context, &mut indexes, &cancel)
            .with_threads(2)
            .load(&mut |_, _, _| {})
            .unwrap();

    // Every program was retranslated before the rewrite began
    assert_eq!(summary.guest_recompiled, 3);
    assert_eq!(indexes.program_count(), 3);
    assert!(summary.cancelled);
    assert!(!summary.host_cache_rewritten);
    assert_eq!(context.binaries_read, 1);

    let mut files = store.open_host_read_only().unwrap().unwrap();
    assert!(store.read_host_code(&mut files, 0).unwrap().is_some());
    for slot in 1..3 {
        assert_eq!(store.read_host_code(&mut files, slot).unwrap(), None);
    }

    // Every TOC entry lies inside the data file
    let toc = std::fs::read(dir.path().join("mock_test.toc")).unwrap();
    let data_len = std::fs::metadata(dir.path().join("mock_test.data")).unwrap().len();
    let entries = &toc[24..];
    assert_eq!(entries.len() % 16, 0);
    for entry in entries.chunks_exact(16) {
        let offset = u64::from_le_bytes(entry[..8].try_into().unwrap());
        let size = u32::from_le_bytes(entry[8..12].try_into().unwrap()) as u64;
        assert!(offset + size <= data_len);
    }

    let report = store.verify().unwrap();
    assert_eq!(report.readable, 3);
    assert_eq!(report.host_binaries, 1);
}

#[test]
fn test_cancel_before_load_loads_nothing() {
    let dir = TempDir::new().unwrap();
    populate(dir.path());

    let store = host_store(dir.path());
    let translator = MockTranslator::default();
    let mut context = MockContext::new();
    let mut indexes = ShaderIndexes::default();
    let cancel = AtomicBool::new(true);
    let mut events = Vec::new();

    let summary =
        ParallelDiskCacheLoader::new(&store, &translator, &mut context, &mut indexes, &cancel)
            .load(&mut |state, done, total| events.push((state, done, total)))
            .unwrap();

    assert!(summary.cancelled);
    assert_eq!(indexes.program_count(), 0);
    assert_eq!(context.binary_loads, 0);
    assert_eq!(
        events,
        vec![(ShaderCacheState::Start, 0, 3), (ShaderCacheState::Loaded, 0, 3)]
    );
}

#[test]
fn test_corrupt_shared_record_stops_scan() {
    let dir = TempDir::new().unwrap();
    populate(dir.path());

    // Point the last slot past the end of the data file
    let toc_path = dir.path().join("shared.toc");
    let mut toc = std::fs::read(&toc_path).unwrap();
    let len = toc.len();
    toc[len - 8..].copy_from_slice(&(1u64 << 32).to_le_bytes());
    std::fs::write(&toc_path, toc).unwrap();

    let store = host_store(dir.path());
    let report = store.verify().unwrap();
    assert_eq!(report.program_count, 3);
    assert_eq!(report.readable, 2);
    assert_eq!(report.host_binaries, 2);
    assert_eq!(report.guest_entries, 5);
}
