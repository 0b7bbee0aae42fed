use std::path::Path;
use std::sync::Arc;

use keel_storage::{MemoryBackend, StorageBackend};
use keel_types::block_hash::BlockHash;
use keel_types::error::{BackendErrorKind, KeelError};
use keel_types::volume::{VolumeState, VolumeType};

use crate::backup::volume_writer::decode_block_volume;
use crate::backup::{BackupSession, EntryMetadata};
use crate::cancel::CancellationToken;
use crate::catalog::Catalog;
use crate::config::BackupConfig;
use crate::filelist::decode_filelist;
use crate::filter::Filter;
use crate::synthetic::SyntheticOutcome;
use crate::testutil::{paths_of, small_config, FailingBackend};

fn meta(mtime: i64) -> EntryMetadata {
    EntryMetadata {
        mtime_ns: mtime,
        mode: 0o644,
        link_target: None,
    }
}

fn volumes_of(catalog: &Catalog, kind: VolumeType) -> Vec<crate::catalog::RemoteVolumeRow> {
    catalog
        .tables()
        .volumes()
        .filter(|v| v.kind == kind)
        .cloned()
        .collect()
}

#[test]
fn first_backup_uploads_blocks_and_filelist() {
    let mut catalog = Catalog::in_memory();
    let backend = Arc::new(MemoryBackend::new());
    let mut session = BackupSession::begin(
        &mut catalog,
        backend.clone(),
        small_config(),
        CancellationToken::new(),
    )
    .unwrap();
    session.add_folder("docs", &meta(1)).unwrap();
    session
        .add_file("docs/a.txt", b"hello world, this is a", &meta(1))
        .unwrap();
    session.add_symlink("latest", "docs/a.txt", &meta(1)).unwrap();
    let summary = session.finish().unwrap();

    assert_eq!(summary.results.examined_files, 3);
    assert_eq!(summary.results.added_files, 3);
    assert_eq!(summary.results.opened_files, 1);
    assert_eq!(summary.results.size_of_added_files, 22);
    assert!(summary.blocks_volumes >= 2);

    let fileset = catalog.fileset(summary.fileset_id).unwrap();
    assert!(fileset.sealed);
    assert!(!fileset.partial);
    assert_eq!(
        paths_of(&catalog, summary.fileset_id),
        vec!["docs", "docs/a.txt", "latest"]
    );
    assert!(catalog.get_incomplete_filesets().is_empty());
    for volume in catalog.tables().volumes() {
        assert_eq!(volume.state, VolumeState::Uploaded, "{}", volume.name);
        let bytes = backend.get(&volume.name).unwrap().unwrap();
        assert_eq!(volume.size, Some(bytes.len() as u64));
    }

    let filelist = backend.get(&summary.filelist_volume).unwrap().unwrap();
    let document = decode_filelist(&filelist).unwrap();
    assert!(!document.partial);
    assert_eq!(document.entries.len(), 3);
}

#[test]
fn every_new_block_lands_in_exactly_one_volume() {
    let mut catalog = Catalog::in_memory();
    let backend = Arc::new(MemoryBackend::new());
    let mut session = BackupSession::begin(
        &mut catalog,
        backend.clone(),
        small_config(),
        CancellationToken::new(),
    )
    .unwrap();
    // Repeated 4-byte blocks dedup inside the run.
    session.add_file("a", b"abcdabcdabcdwxyz", &meta(1)).unwrap();
    session.add_file("b", b"wxyzabcd", &meta(1)).unwrap();
    session.finish().unwrap();

    let mut stored = Vec::new();
    for volume in volumes_of(&catalog, VolumeType::Blocks) {
        let bytes = backend.get(&volume.name).unwrap().unwrap();
        for block in decode_block_volume(&bytes).unwrap().blocks {
            stored.push(block.hash);
        }
    }
    let mut unique = stored.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(stored.len(), unique.len());
    assert_eq!(stored.len(), catalog.tables().block_count());
}

#[test]
fn unchanged_second_backup_uploads_no_blocks() {
    let mut catalog = Catalog::in_memory();
    let backend = Arc::new(MemoryBackend::new());
    let files: [(&str, &[u8]); 2] = [("a", b"0123456789"), ("b", b"abcdefgh")];

    for round in 0..2 {
        let mut session = BackupSession::begin(
            &mut catalog,
            backend.clone(),
            small_config(),
            CancellationToken::new(),
        )
        .unwrap();
        for (path, data) in files {
            session.add_file(path, data, &meta(7)).unwrap();
        }
        let summary = session.finish().unwrap();
        if round == 1 {
            assert_eq!(summary.blocks_volumes, 0);
            assert_eq!(summary.results.examined_files, 2);
            assert_eq!(summary.results.added_files, 0);
            assert_eq!(summary.results.modified_files, 0);
            assert_eq!(summary.results.files_with_timestamp_changed, 0);
        }
    }
    assert_eq!(catalog.tables().filesets().count(), 2);
}

#[test]
fn second_backup_counts_modified_and_touched_files() {
    let mut catalog = Catalog::in_memory();
    let backend = Arc::new(MemoryBackend::new());
    let config = small_config();

    let mut first = BackupSession::begin(
        &mut catalog,
        backend.clone(),
        config.clone(),
        CancellationToken::new(),
    )
    .unwrap();
    first.add_file("edited", b"version one", &meta(1)).unwrap();
    first.add_file("touched", b"same bytes", &meta(1)).unwrap();
    first.add_file("removed", b"bye", &meta(1)).unwrap();
    let first = first.finish().unwrap();

    let mut second = BackupSession::begin(
        &mut catalog,
        backend.clone(),
        config,
        CancellationToken::new(),
    )
    .unwrap();
    assert_eq!(second.previous_fileset(), Some(first.fileset_id));
    second.add_file("edited", b"version two!", &meta(2)).unwrap();
    second.add_file("touched", b"same bytes", &meta(2)).unwrap();
    second.add_file("new", b"hi", &meta(2)).unwrap();
    let results = second.stats();
    let second = second.finish().unwrap();

    assert_eq!(results.added_files, 1);
    assert_eq!(results.modified_files, 1);
    assert_eq!(results.size_of_modified_files, 12);
    assert_eq!(results.files_with_timestamp_changed, 2);
    assert_eq!(
        paths_of(&catalog, second.fileset_id),
        vec!["edited", "new", "touched"]
    );
}

#[test]
fn cancelled_session_rolls_back_open_work() {
    let mut catalog = Catalog::in_memory();
    let backend = Arc::new(MemoryBackend::new());
    let cancel = CancellationToken::new();
    let mut session =
        BackupSession::begin(&mut catalog, backend.clone(), small_config(), cancel.clone())
            .unwrap();
    let fileset = session.fileset_id();
    session.add_file("a", b"ab", &meta(1)).unwrap();
    cancel.cancel();
    let err = session.add_file("b", b"cd", &meta(1)).unwrap_err();
    assert!(matches!(err, KeelError::Cancelled(_)));
    drop(session);

    assert!(!catalog.in_transaction());
    assert!(catalog.fileset_entries(fileset).unwrap().is_empty());
    assert_eq!(catalog.tables().file_count(), 0);
    assert!(backend.is_empty());
}

#[test]
fn interrupted_run_is_recovered_by_next_session() {
    let mut catalog = Catalog::in_memory();
    let backend = Arc::new(MemoryBackend::new());
    let config = small_config();

    let mut first = BackupSession::begin(
        &mut catalog,
        backend.clone(),
        config.clone(),
        CancellationToken::new(),
    )
    .unwrap();
    for path in ["a", "b", "c"] {
        first.add_file(path, path.as_bytes(), &meta(1)).unwrap();
    }
    let complete = first.finish().unwrap().fileset_id;

    let mut interrupted = BackupSession::begin(
        &mut catalog,
        backend.clone(),
        config.clone(),
        CancellationToken::new(),
    )
    .unwrap();
    let base = interrupted.fileset_id();
    interrupted.add_file("a", b"changed a", &meta(2)).unwrap();
    interrupted.add_file("d", b"brand new", &meta(2)).unwrap();
    interrupted.checkpoint().unwrap();
    interrupted.add_file("late", b"never committed", &meta(2)).unwrap();
    drop(interrupted);

    assert_eq!(paths_of(&catalog, base), vec!["a", "d"]);
    let temp = BackupSession::last_temporary_filelist(&catalog).unwrap();
    assert_eq!(catalog.fileset(base).unwrap().volume_id, Some(temp.id));

    let outcome = BackupSession::recover_interrupted(
        &mut catalog,
        backend.as_ref(),
        &config,
        &CancellationToken::new(),
    )
    .unwrap();
    let SyntheticOutcome::Uploaded(synthetic) = outcome else {
        panic!("expected a synthetic filelist, got {outcome:?}");
    };
    assert_eq!(synthetic.base, base);
    assert_eq!(synthetic.predecessor, Some(complete));
    assert_eq!(paths_of(&catalog, synthetic.fileset_id), vec!["a", "b", "c", "d"]);
    assert!(backend.get(&synthetic.volume_name).unwrap().is_some());
    assert!(BackupSession::last_temporary_filelist(&catalog).is_none());

    // The next run compares against the synthetic fileset.
    let next = BackupSession::begin(&mut catalog, backend.clone(), config, CancellationToken::new())
        .unwrap();
    assert_eq!(next.previous_fileset(), Some(synthetic.fileset_id));
}

#[test]
fn failed_block_upload_surfaces_backend_error() {
    let mut catalog = Catalog::in_memory();
    let backend = Arc::new(FailingBackend::new());
    backend.fail_puts(Some(BackendErrorKind::Transient));
    let mut session = BackupSession::begin(
        &mut catalog,
        backend.clone(),
        small_config(),
        CancellationToken::new(),
    )
    .unwrap();
    session.add_file("a", b"0123456789abcdef0123", &meta(1)).unwrap();
    let err = session.finish().unwrap_err();
    assert!(err.is_transient());
    assert!(!catalog.query_volumes_by_state(VolumeState::Uploading).is_empty());
}

#[test]
fn directory_walk_adds_tree() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    std::fs::write(dir.path().join("sub").join("x.txt"), b"xxxxxxxx").unwrap();
    std::fs::write(dir.path().join("y.log"), b"yy").unwrap();

    let mut catalog = Catalog::in_memory();
    let backend = Arc::new(MemoryBackend::new());
    let mut session = BackupSession::begin(
        &mut catalog,
        backend.clone(),
        small_config(),
        CancellationToken::new(),
    )
    .unwrap();
    let filter = Filter::patterns(&["*.log"], false, true).unwrap();
    let added = session.backup_directory(dir.path(), &filter).unwrap();
    assert_eq!(added, 2);
    let summary = session.finish().unwrap();
    assert_eq!(paths_of(&catalog, summary.fileset_id), vec!["sub", "sub/x.txt"]);
}

#[test]
fn walking_a_missing_directory_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut catalog = Catalog::in_memory();
    let backend = Arc::new(MemoryBackend::new());
    let mut session = BackupSession::begin(
        &mut catalog,
        backend,
        small_config(),
        CancellationToken::new(),
    )
    .unwrap();
    assert!(session
        .backup_directory(&dir.path().join("missing"), &Filter::Empty)
        .is_err());
}

#[test]
fn invalid_config_is_rejected_at_begin() {
    let mut catalog = Catalog::in_memory();
    let mut config = small_config();
    config.upload_concurrency = 0;
    let err = BackupSession::begin(
        &mut catalog,
        Arc::new(MemoryBackend::new()),
        config,
        CancellationToken::new(),
    )
    .err()
    .unwrap();
    assert_eq!(err.code(), "config.invalid");
    assert_eq!(catalog.tables().filesets().count(), 0);
}

#[test]
fn later_add_of_a_path_wins_over_a_deferred_one() {
    let mut catalog = Catalog::in_memory();
    let backend = Arc::new(MemoryBackend::new());
    let mut session = BackupSession::begin(
        &mut catalog,
        backend.clone(),
        small_config(),
        CancellationToken::new(),
    )
    .unwrap();
    let fileset = session.fileset_id();
    session.add_file("x", b"second!!", &meta(1)).unwrap();
    session.checkpoint().unwrap();

    // New blocks: held back until the open volume is committed.
    session.add_file("a", b"first", &meta(1)).unwrap();
    // Every block already uploaded: visible at once.
    let second = session.add_file("a", b"second!!", &meta(1)).unwrap();
    session.finish().unwrap();

    assert_eq!(catalog.fileset_entries(fileset).unwrap()["a"], second);
}

#[test]
fn abandoned_session_settles_inflight_uploads() {
    let mut catalog = Catalog::in_memory();
    let backend = Arc::new(MemoryBackend::new());
    let mut session = BackupSession::begin(
        &mut catalog,
        backend.clone(),
        small_config(),
        CancellationToken::new(),
    )
    .unwrap();
    session.add_file("a", b"abcdefghijklmnopqrst", &meta(1)).unwrap();
    drop(session);

    let uploading = catalog.query_volumes_by_state(VolumeState::Uploading);
    assert!(!uploading.is_empty());
    for volume in uploading {
        let bytes = backend.get(&volume.name).unwrap().unwrap();
        assert_eq!(volume.size, Some(bytes.len() as u64));
    }
    assert!(!catalog.in_transaction());
}

fn write_tree(root: &Path) {
    for d in 0..3 {
        let dir = root.join(format!("d{d}"));
        std::fs::create_dir(&dir).unwrap();
        for f in 0..8 {
            let body = format!("dir {d} file {f} {}", "x".repeat(d * 8 + f));
            std::fs::write(dir.join(format!("f{f}")), body).unwrap();
        }
    }
}

/// (path, file id, content hash and length) for one entry.
type ScanRow = (String, u64, Option<(BlockHash, u64)>);

/// Every entry of a walked tree by path, plus the examined count.
fn scan_with(root: &Path, config: BackupConfig) -> (Vec<ScanRow>, u64) {
    let mut catalog = Catalog::in_memory();
    let backend = Arc::new(MemoryBackend::new());
    let mut session =
        BackupSession::begin(&mut catalog, backend, config, CancellationToken::new()).unwrap();
    session.backup_directory(root, &Filter::Empty).unwrap();
    let summary = session.finish().unwrap();

    let entries = catalog
        .fileset_entries(summary.fileset_id)
        .unwrap()
        .iter()
        .map(|(path, id)| {
            let resolved = catalog.resolve_file(*id).unwrap();
            let content = resolved.content.map(|bs| (bs.full_hash, bs.length));
            (path.clone(), id.0, content)
        })
        .collect();
    (entries, summary.results.examined_files)
}

#[test]
fn parallel_scan_matches_single_worker_scan() {
    let dir = tempfile::tempdir().unwrap();
    write_tree(dir.path());

    let mut parallel = small_config();
    parallel.scan_workers = 4;
    parallel.scan_readahead = 1;
    let mut serial = parallel.clone();
    serial.scan_workers = 1;

    let (many, examined) = scan_with(dir.path(), parallel);
    let (one, _) = scan_with(dir.path(), serial);
    assert_eq!(examined, 27);
    assert_eq!(many.len(), 27);

    let strip = |rows: &[ScanRow]| {
        rows.iter()
            .map(|(p, _, c)| (p.clone(), *c))
            .collect::<Vec<_>>()
    };
    assert_eq!(strip(&many), strip(&one));

    // Recorded in walk order no matter which worker finished first.
    let ids: Vec<u64> = many.iter().map(|(_, id, _)| *id).collect();
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    assert_eq!(ids, sorted);

    let body = std::fs::read(dir.path().join("d2").join("f7")).unwrap();
    let chunks: Vec<BlockHash> = body.chunks(4).map(BlockHash::compute).collect();
    let (_, _, content) = many.iter().find(|(p, _, _)| p == "d2/f7").unwrap();
    assert_eq!(*content, Some((BlockHash::combine(&chunks), body.len() as u64)));
}

#[test]
fn configured_filter_drives_the_walk() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("Keep.TXT"), b"keep").unwrap();
    std::fs::write(dir.path().join("drop.tmp"), b"drop").unwrap();

    let mut config = small_config();
    config.case_sensitive_paths = false;
    let filter = Filter::patterns_for(&config, &["*.txt"], true).unwrap();

    let mut catalog = Catalog::in_memory();
    let mut session = BackupSession::begin(
        &mut catalog,
        Arc::new(MemoryBackend::new()),
        config,
        CancellationToken::new(),
    )
    .unwrap();
    session.backup_directory(dir.path(), &filter).unwrap();
    let summary = session.finish().unwrap();
    assert_eq!(paths_of(&catalog, summary.fileset_id), vec!["Keep.TXT"]);
}

#[test]
fn finished_filelist_carries_control_files() {
    let dir = tempfile::tempdir().unwrap();
    let control = dir.path().join("manifest.json");
    std::fs::write(&control, b"{}").unwrap();
    let mut config = small_config();
    config.control_files = vec![control];

    let mut catalog = Catalog::in_memory();
    let backend = Arc::new(MemoryBackend::new());
    let mut session =
        BackupSession::begin(&mut catalog, backend.clone(), config, CancellationToken::new())
            .unwrap();
    session.add_file("a", b"a", &meta(1)).unwrap();
    let summary = session.finish().unwrap();

    let bytes = backend.get(&summary.filelist_volume).unwrap().unwrap();
    let document = decode_filelist(&bytes).unwrap();
    assert_eq!(document.control_files.len(), 1);
    assert_eq!(document.control_files[0].name, "manifest.json");
}
