//! Behavior tests for the chunked note store: round trips, dedup,
//! tombstones, filters, and corruption handling.

mod common;

use frond::{
    ChunkPolicy, DatabaseHandle, DocId, EntryDoc, LeafDoc, LegacyNoteDoc, Note, NoteDoc, PutMode,
    Settings, StoreError,
};

use common::{current_db, leaf_count, ready_engine};

#[test]
fn single_note_round_trips() {
    let (host, engine) = ready_engine("store-roundtrip", Settings::default());

    let note = Note::new("a.md", "hello", 10, 20);
    engine.put_db_entry(&note, false).unwrap().unwrap();

    let loaded = engine
        .get_db_entry(&DocId::from("a.md"), false, false)
        .unwrap()
        .unwrap();
    assert_eq!(loaded.data, "hello");
    assert_eq!(loaded.children.len(), 1);
    assert_eq!(loaded.ctime, 10);
    assert_eq!(loaded.mtime, 20);

    let db = current_db(&host, "store-roundtrip");
    assert_eq!(leaf_count(&db), 1);
    let leaf = db.get(&loaded.children[0]).unwrap();
    match leaf {
        EntryDoc::Leaf(leaf) => assert_eq!(leaf.data, "hello"),
        other => panic!("expected a leaf, got {other:?}"),
    }
}

#[test]
fn large_binary_payload_chunks_by_the_multiplied_ceiling() {
    let host = common::TestHost::new();
    let engine = frond::Engine::new(
        std::sync::Arc::clone(&host) as std::sync::Arc<dyn frond::Host>,
        "store-large",
        Settings {
            custom_chunk_size: 1,
            ..Settings::default()
        },
    )
    .unwrap()
    .with_chunk_policy(ChunkPolicy {
        text_size: 1_000,
        binary_size: 1_024,
    });
    engine.initialize_database().unwrap();

    let payload = "X".repeat(50_000);
    let note = Note::new("a.md", payload.clone(), 1, 1);
    engine.put_db_entry(&note, true).unwrap().unwrap();

    let loaded = engine
        .get_db_entry(&DocId::from("a.md"), false, false)
        .unwrap()
        .unwrap();
    assert_eq!(loaded.children.len(), 50_000usize.div_ceil(1_024));
    assert_eq!(loaded.data, payload);
}

#[test]
fn identical_payloads_share_leaves_across_notes() {
    let (host, engine) = ready_engine("store-dedup", Settings::default());

    engine
        .put_db_entry(&Note::new("b.md", "foo", 1, 1), false)
        .unwrap();
    let db = current_db(&host, "store-dedup");
    let after_first = leaf_count(&db);

    engine
        .put_db_entry(&Note::new("c.md", "foo", 2, 2), false)
        .unwrap();
    assert_eq!(leaf_count(&db), after_first);

    let b = engine
        .get_db_entry(&DocId::from("b.md"), false, false)
        .unwrap()
        .unwrap();
    let c = engine
        .get_db_entry(&DocId::from("c.md"), false, false)
        .unwrap()
        .unwrap();
    assert_eq!(b.children, c.children);
}

#[test]
fn empty_payload_round_trips_with_no_children() {
    let (host, engine) = ready_engine("store-empty", Settings::default());
    engine
        .put_db_entry(&Note::new("empty.md", "", 1, 1), false)
        .unwrap()
        .unwrap();

    let loaded = engine
        .get_db_entry(&DocId::from("empty.md"), false, false)
        .unwrap()
        .unwrap();
    assert_eq!(loaded.data, "");
    assert!(loaded.children.is_empty());
    assert_eq!(leaf_count(&current_db(&host, "store-empty")), 0);
}

#[test]
fn single_character_payload_is_one_leaf() {
    let (host, engine) = ready_engine("store-tiny", Settings::default());
    engine
        .put_db_entry(&Note::new("tiny.md", "x", 1, 1), false)
        .unwrap()
        .unwrap();

    let loaded = engine
        .get_db_entry(&DocId::from("tiny.md"), false, false)
        .unwrap()
        .unwrap();
    assert_eq!(loaded.children.len(), 1);
    assert_eq!(loaded.data, "x");
    assert_eq!(leaf_count(&current_db(&host, "store-tiny")), 1);
}

#[test]
fn repeated_put_is_idempotent_for_leaves() {
    let (host, engine) = ready_engine("store-idem", Settings::default());
    let note = Note::new("a.md", "stable content", 1, 1);

    engine.put_db_entry(&note, false).unwrap().unwrap();
    let db = current_db(&host, "store-idem");
    let first = engine
        .get_db_entry(&DocId::from("a.md"), false, false)
        .unwrap()
        .unwrap();
    let count = leaf_count(&db);

    engine.put_db_entry(&note, false).unwrap().unwrap();
    let second = engine
        .get_db_entry(&DocId::from("a.md"), false, false)
        .unwrap()
        .unwrap();

    assert_eq!(first.children, second.children);
    assert_eq!(leaf_count(&db), count);
}

#[test]
fn tombstoned_notes_hide_unless_asked() {
    let (_host, engine) = ready_engine("store-tombstone", Settings::default());
    engine
        .put_db_entry(&Note::new("a.md", "doomed", 1, 1), false)
        .unwrap()
        .unwrap();

    assert!(engine.delete_db_entry(&DocId::from("a.md"), None).unwrap());
    assert!(
        engine
            .get_db_entry(&DocId::from("a.md"), false, false)
            .unwrap()
            .is_none()
    );

    let tombstoned = engine
        .get_db_entry(&DocId::from("a.md"), true, false)
        .unwrap()
        .unwrap();
    assert!(tombstoned.deleted);
    assert_eq!(tombstoned.data, "doomed");

    // Deleting what is already gone is a no-op.
    assert!(!engine.delete_db_entry(&DocId::from("b.md"), None).unwrap());
}

#[test]
fn put_delete_put_reads_like_a_fresh_put() {
    let (_host, engine) = ready_engine("store-revive", Settings::default());
    let note = Note::new("a.md", "phoenix", 1, 1);

    engine.put_db_entry(&note, false).unwrap().unwrap();
    engine.delete_db_entry(&DocId::from("a.md"), None).unwrap();
    engine.put_db_entry(&note, false).unwrap().unwrap();

    let loaded = engine
        .get_db_entry(&DocId::from("a.md"), false, false)
        .unwrap()
        .unwrap();
    assert_eq!(loaded.data, "phoenix");
    assert!(!loaded.deleted);
}

#[test]
fn configured_hard_delete_removes_the_metadata() {
    let (_host, engine) = ready_engine(
        "store-hard-delete",
        Settings {
            delete_metadata_of_deleted_files: true,
            ..Settings::default()
        },
    );
    engine
        .put_db_entry(&Note::new("a.md", "gone", 1, 1), false)
        .unwrap()
        .unwrap();

    assert!(engine.delete_db_entry(&DocId::from("a.md"), None).unwrap());
    assert!(
        engine
            .get_db_entry(&DocId::from("a.md"), true, false)
            .unwrap()
            .is_none()
    );
}

#[test]
fn explicit_revision_forces_a_hard_delete() {
    let (_host, engine) = ready_engine("store-rev-delete", Settings::default());
    let revision = engine
        .put_db_entry(&Note::new("a.md", "gone", 1, 1), false)
        .unwrap()
        .unwrap();

    assert!(
        engine
            .delete_db_entry(&DocId::from("a.md"), Some(&revision.rev))
            .unwrap()
    );
    assert!(
        engine
            .get_db_entry(&DocId::from("a.md"), true, false)
            .unwrap()
            .is_none()
    );
}

#[test]
fn prefix_deletion_spares_leaves_and_other_prefixes() {
    let (host, engine) = ready_engine("store-prefix", Settings::default());
    for id in ["work/a.md", "work/b.md", "play/c.md"] {
        engine
            .put_db_entry(&Note::new(id, "content", 1, 1), false)
            .unwrap()
            .unwrap();
    }

    let deleted = engine.delete_db_entry_prefix("work/").unwrap();
    assert_eq!(deleted, 2);

    assert!(
        engine
            .get_db_entry(&DocId::from("work/a.md"), false, false)
            .unwrap()
            .is_none()
    );
    assert!(
        engine
            .get_db_entry(&DocId::from("play/c.md"), false, false)
            .unwrap()
            .is_some()
    );
    // Leaves are compaction's business, not deletion's.
    assert!(leaf_count(&current_db(&host, "store-prefix")) > 0);
}

#[test]
fn prefix_deletion_pages_through_large_tables() {
    let (_host, engine) = ready_engine("store-prefix-pages", Settings::default());
    for index in 0..250 {
        engine
            .put_db_entry(&Note::new(format!("bulk/{index:04}.md"), "x", 1, 1), false)
            .unwrap()
            .unwrap();
    }
    assert_eq!(engine.delete_db_entry_prefix("bulk/").unwrap(), 250);
}

#[test]
fn filtered_paths_are_not_stored() {
    let (_host, engine) = ready_engine(
        "store-filter",
        Settings {
            sync_only_regex: r"\.md$".to_string(),
            ..Settings::default()
        },
    );

    assert!(
        engine
            .put_db_entry(&Note::new("image.png", "blob", 1, 1), false)
            .unwrap()
            .is_none()
    );
    assert!(!engine.is_target_file("image.png"));
    // Special namespaces bypass the patterns entirely.
    assert!(engine.is_target_file("plugin:settings"));
}

#[test]
fn forced_hash_collisions_get_distinct_suffixes() {
    fn constant(_bytes: &[u8]) -> u32 {
        0xc0de
    }
    let host = common::TestHost::new();
    let engine = frond::Engine::new(
        std::sync::Arc::clone(&host) as std::sync::Arc<dyn frond::Host>,
        "store-collide",
        Settings::default(),
    )
    .unwrap()
    .with_leaf_hasher(constant);
    engine.initialize_database().unwrap();

    engine
        .put_db_entry(&Note::new("a.md", "first", 1, 1), false)
        .unwrap()
        .unwrap();
    engine
        .put_db_entry(&Note::new("b.md", "second", 1, 1), false)
        .unwrap()
        .unwrap();

    let a = engine
        .get_db_entry(&DocId::from("a.md"), false, false)
        .unwrap()
        .unwrap();
    let b = engine
        .get_db_entry(&DocId::from("b.md"), false, false)
        .unwrap()
        .unwrap();
    assert_eq!(a.children[0].as_str(), "h:c0de0");
    assert_eq!(b.children[0].as_str(), "h:c0de1");
    assert_eq!(a.data, "first");
    assert_eq!(b.data, "second");
}

#[test]
fn san_check_flags_missing_children() {
    let (host, engine) = ready_engine("store-sancheck", Settings::default());
    engine
        .put_db_entry(&Note::new("a.md", "will corrupt", 1, 1), false)
        .unwrap()
        .unwrap();
    let note = engine
        .get_db_entry_meta(&DocId::from("a.md"), false)
        .unwrap()
        .unwrap();
    assert!(engine.san_check(&note).unwrap());

    // Rip the leaf out from under the note.
    let db = current_db(&host, "store-sancheck");
    let leaf = db.get(&note.children[0]).unwrap();
    db.remove(&note.children[0], leaf.rev().unwrap()).unwrap();

    assert!(!engine.san_check(&note).unwrap());
    assert!(engine.need_scanning());
    let corrupted = engine.take_corrupted_entries();
    assert!(corrupted.contains_key("a.md"));
    assert!(!engine.need_scanning());
}

#[test]
fn unresolvable_children_corrupt_the_read() {
    let (host, engine) = ready_engine("store-corrupt-read", Settings::default());
    let db = current_db(&host, "store-corrupt-read");
    db.put(
        &EntryDoc::Note(NoteDoc {
            id: DocId::from("orphan.bin"),
            rev: None,
            ctime: 1,
            mtime: 1,
            size: 4,
            children: vec![DocId::from("h:missing0")],
            deleted: false,
        }),
        PutMode::Checked,
    )
    .unwrap();

    let err = engine
        .get_db_entry(&DocId::from("orphan.bin"), false, false)
        .unwrap_err();
    assert!(matches!(err, StoreError::MissingChunk { .. }));
    assert!(engine.take_corrupted_entries().contains_key("orphan.bin"));
}

#[test]
fn legacy_flat_notes_read_inline_and_delete_hard() {
    let (host, engine) = ready_engine("store-legacy", Settings::default());
    let db = current_db(&host, "store-legacy");
    db.put(
        &EntryDoc::Legacy(LegacyNoteDoc {
            id: DocId::from("old.md"),
            rev: None,
            ctime: 1,
            mtime: 1,
            size: 6,
            data: "legacy".to_string(),
            deleted: false,
        }),
        PutMode::Checked,
    )
    .unwrap();

    let loaded = engine
        .get_db_entry(&DocId::from("old.md"), false, false)
        .unwrap()
        .unwrap();
    assert_eq!(loaded.data, "legacy");
    assert!(loaded.children.is_empty());

    assert!(engine.delete_db_entry(&DocId::from("old.md"), None).unwrap());
    assert!(
        engine
            .get_db_entry(&DocId::from("old.md"), true, false)
            .unwrap()
            .is_none()
    );
}

#[test]
fn unknown_document_kinds_read_as_absent() {
    let (host, engine) = ready_engine("store-unknown", Settings::default());
    let db = current_db(&host, "store-unknown");
    // A leaf is not a note either.
    db.put(
        &EntryDoc::Leaf(LeafDoc {
            id: DocId::from("h:stray0"),
            rev: None,
            data: "stray".to_string(),
        }),
        PutMode::Checked,
    )
    .unwrap();

    assert!(
        engine
            .get_db_entry(&DocId::from("h:stray0"), false, false)
            .unwrap()
            .is_none()
    );
    assert!(
        engine
            .get_db_entry_meta(&DocId::from("h:stray0"), false)
            .unwrap()
            .is_none()
    );
}

#[test]
fn closed_engine_rejects_writes() {
    let (_host, engine) = ready_engine("store-closed", Settings::default());
    engine.close();
    let err = engine
        .put_db_entry(&Note::new("a.md", "late", 1, 1), false)
        .unwrap_err();
    assert!(matches!(err, StoreError::NotReady));
}
