use keel_types::block_hash::BlockHash;
use keel_types::error::KeelError;

use crate::catalog::{Catalog, ContentRef, Tables};
use crate::config::CatalogConfig;
use crate::testutil::{record_content, record_folder};

#[test]
fn same_block_twice_is_one_block() {
    let mut catalog = Catalog::in_memory();
    let hash = BlockHash::compute(b"abcd");
    let first = catalog.lookup_or_create_block(hash, 4).unwrap();
    let second = catalog.lookup_or_create_block(hash, 4).unwrap();
    assert_eq!(first, second);
    assert_eq!(catalog.tables().block_count(), 1);
}

#[test]
fn known_hash_with_other_size_is_integrity_error() {
    let mut catalog = Catalog::in_memory();
    let hash = BlockHash::compute(b"abcd");
    catalog.lookup_or_create_block(hash, 4).unwrap();
    let err = catalog.lookup_or_create_block(hash, 5).unwrap_err();
    assert!(matches!(
        err,
        KeelError::BlockSizeMismatch {
            existing: 4,
            given: 5,
            ..
        }
    ));
    assert_eq!(err.code(), "block.size_mismatch");
}

#[test]
fn equal_content_shares_a_blockset() {
    let mut catalog = Catalog::in_memory();
    let a = record_content(&mut catalog, "/a", b"hello world!");
    let b = record_content(&mut catalog, "/b", b"hello world!");
    let content_a = catalog.file(a).unwrap().content;
    let content_b = catalog.file(b).unwrap().content;
    assert_eq!(content_a, content_b);

    let blockset = catalog.blockset(content_a.blockset().unwrap()).unwrap();
    assert_eq!(blockset.length, 12);
    assert_eq!(blockset.blocks.len(), 3);
}

#[test]
fn identical_file_version_is_reused() {
    let mut catalog = Catalog::in_memory();
    let first = record_content(&mut catalog, "/a", b"xyz");
    let again = record_content(&mut catalog, "/a", b"xyz");
    let changed = record_content(&mut catalog, "/a", b"xyzw");
    assert_eq!(first, again);
    assert_ne!(first, changed);
}

#[test]
fn record_file_rejects_unknown_blockset() {
    let mut catalog = Catalog::in_memory();
    let folder = record_folder(&mut catalog, "/dir");
    let metadata = catalog.file(folder).unwrap().metadata;
    let bogus = keel_types::ids::BlocksetId(999);
    let err = catalog
        .record_file("/x", ContentRef::Blockset(bogus), metadata)
        .unwrap_err();
    assert!(matches!(err, KeelError::BlocksetNotFound(id) if id == bogus));
}

#[test]
fn resolve_reports_dangling_blockset_with_context() {
    let mut catalog = Catalog::in_memory();
    let file = record_content(&mut catalog, "/a", b"data");
    let content = catalog.file(file).unwrap().content.blockset().unwrap();
    catalog.tables_mut().blocksets.remove(&content);

    let err = catalog.resolve_file(file).unwrap_err();
    match err {
        KeelError::DanglingBlockset {
            file_id,
            path,
            blockset_id,
        } => {
            assert_eq!(file_id, file);
            assert_eq!(path, "/a");
            assert_eq!(blockset_id, content);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn rollback_discards_pending_changes() {
    let mut catalog = Catalog::in_memory();
    record_content(&mut catalog, "/a", b"keep");
    catalog.commit("first").unwrap();
    assert!(!catalog.in_transaction());

    record_content(&mut catalog, "/b", b"drop");
    assert!(catalog.in_transaction());
    assert_eq!(catalog.tables().file_count(), 2);
    assert_eq!(catalog.committed().file_count(), 1);

    catalog.rollback();
    assert_eq!(catalog.tables().file_count(), 1);
}

#[test]
fn failed_transaction_rolls_back() {
    let mut catalog = Catalog::in_memory();
    let result: keel_types::error::Result<()> = catalog.transaction("doomed", |c| {
        record_content(c, "/a", b"temp");
        Err(KeelError::Other("boom".into()))
    });
    assert!(result.is_err());
    assert!(!catalog.in_transaction());
    assert_eq!(catalog.tables().file_count(), 0);
}

#[test]
fn file_backed_catalog_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("catalog.bin");
    let hash = BlockHash::compute(b"abcd");
    {
        let mut catalog = Catalog::open(&path).unwrap();
        catalog.lookup_or_create_block(hash, 4).unwrap();
        record_content(&mut catalog, "/a", b"abcdefgh");
        catalog.commit("save").unwrap();
        // Uncommitted work is not persisted.
        record_content(&mut catalog, "/b", b"lost");
    }
    let reopened = Catalog::open(&path).unwrap();
    assert_eq!(reopened.tables().file_count(), 1);
    assert!(reopened.find_block(&hash).is_some());
}

#[test]
fn missing_catalog_file_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = Catalog::open(dir.path().join("none.bin")).unwrap();
    assert_eq!(catalog.tables().block_count(), 0);
}

#[test]
fn corrupt_catalog_file_reports_preview() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("catalog.bin");
    std::fs::write(&path, vec![0xc1; 100]).unwrap();
    let err = Catalog::open(&path).unwrap_err();
    match err {
        KeelError::Deserialization {
            context, preview, ..
        } => {
            assert_eq!(context, "catalog");
            assert_eq!(preview.total_len, 100);
            assert!(preview.truncated);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn unknown_catalog_version_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("catalog.bin");
    let tables = Tables {
        version: 99,
        ..Tables::default()
    };
    std::fs::write(&path, rmp_serde::to_vec_named(&tables).unwrap()).unwrap();
    let err = Catalog::open(&path).unwrap_err();
    assert!(matches!(
        err,
        KeelError::UnsupportedVersion {
            what: "catalog",
            version: 99
        }
    ));
}

#[test]
fn configured_catalog_persists_at_configured_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("keel.bin");
    let config = CatalogConfig {
        path: path.to_string_lossy().into_owned(),
    };
    let mut catalog = Catalog::from_config(&config).unwrap();
    record_content(&mut catalog, "/a", b"abcd");
    catalog.commit("save").unwrap();
    assert_eq!(catalog.path(), Some(path.as_path()));
    assert!(path.exists());
    assert_eq!(Catalog::from_config(&config).unwrap().tables().file_count(), 1);
}
