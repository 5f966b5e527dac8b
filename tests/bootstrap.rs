//! Lifecycle tests: generation migration, node identity, resets.

mod common;

use std::sync::Arc;

use frond::{
    BootstrapError, DatabaseHandle, DocId, EntryDoc, LeafDoc, NoteDoc, PutMode, Settings,
};

use common::{TestHost, current_db, ready_engine};

fn fill(db: &frond::MemoryDatabase, count: usize) {
    for index in 0..count {
        db.put(
            &EntryDoc::Leaf(LeafDoc {
                id: DocId::from(format!("h:seed{index}0").as_str()),
                rev: None,
                data: format!("seed-{index}"),
            }),
            PutMode::Force,
        )
        .unwrap();
    }
}

#[test]
fn first_boot_creates_a_node_identity() {
    let (host, engine) = ready_engine("boot-fresh", Settings::default());
    assert!(engine.is_ready());

    let node_id = engine.node_id().unwrap();
    assert_eq!(node_id.len(), 10);
    assert!(
        node_id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
    );

    let stored = current_db(&host, "boot-fresh")
        .get(&DocId::from(frond::NODE_INFO_DOC_ID))
        .unwrap();
    let EntryDoc::NodeInfo(info) = stored else {
        panic!("expected a node info document");
    };
    assert_eq!(info.nodeid, node_id);
    assert!(info.v20220607);
}

#[test]
fn node_identity_survives_reopen() {
    let host = TestHost::new();
    let engine = frond::Engine::new(
        Arc::clone(&host) as Arc<dyn frond::Host>,
        "boot-stable-id",
        Settings::default(),
    )
    .unwrap();
    engine.initialize_database().unwrap();
    let first = engine.node_id().unwrap();

    engine.close();
    engine.initialize_database().unwrap();
    assert_eq!(engine.node_id().unwrap(), first);
}

#[test]
fn non_empty_old_generation_is_copied_then_dropped() {
    let host = TestHost::new();
    let old = host.seed_local("boot-migrate-livesync");
    fill(&old, 7);
    old.put(
        &EntryDoc::Note(NoteDoc {
            id: DocId::from("carried.bin"),
            rev: None,
            ctime: 1,
            mtime: 1,
            size: 0,
            children: vec![DocId::from("h:seed00")],
            deleted: false,
        }),
        PutMode::Force,
    )
    .unwrap();
    let old_count = old.info().unwrap().doc_count;

    let engine = frond::Engine::new(
        Arc::clone(&host) as Arc<dyn frond::Host>,
        "boot-migrate",
        Settings::default(),
    )
    .unwrap();
    engine.initialize_database().unwrap();

    assert!(engine.is_ready());
    let new_info = current_db(&host, "boot-migrate").info().unwrap();
    assert_eq!(new_info.doc_count, old_count);
    assert!(old.is_destroyed());

    // The copied note is readable through the engine.
    assert!(
        engine
            .get_db_entry(&DocId::from("carried.bin"), false, false)
            .unwrap()
            .is_some()
    );
}

#[test]
fn empty_old_generation_is_left_alone() {
    let host = TestHost::new();
    let old = host.seed_local("boot-empty-old-livesync");

    let engine = frond::Engine::new(
        Arc::clone(&host) as Arc<dyn frond::Host>,
        "boot-empty-old",
        Settings::default(),
    )
    .unwrap();
    engine.initialize_database().unwrap();

    assert!(engine.is_ready());
    assert!(!old.is_destroyed());
}

#[test]
fn failed_migration_leaves_the_engine_not_ready() {
    let host = TestHost::new();
    let old = host.seed_local("boot-failed-livesync");
    fill(&old, 3);
    // The new generation's replicator will reject its first run.
    let new = host.seed_local("boot-failed-livesync-v2");
    new.inject_replication_error(1);

    let engine = frond::Engine::new(
        Arc::clone(&host) as Arc<dyn frond::Host>,
        "boot-failed",
        Settings::default(),
    )
    .unwrap();
    let err = engine.initialize_database().unwrap_err();
    assert!(matches!(err, BootstrapError::MigrationFailed { .. }));
    assert!(!engine.is_ready());
    // The old generation is kept for the operator to deal with.
    assert!(!old.is_destroyed());
}

#[test]
fn reset_database_rebuilds_with_a_fresh_identity() {
    let (host, engine) = ready_engine("boot-reset", Settings::default());
    engine
        .put_db_entry(&frond::Note::new("a.md", "ephemeral", 1, 1), false)
        .unwrap()
        .unwrap();
    let before = engine.node_id().unwrap();

    engine.reset_database().unwrap();

    assert!(engine.is_ready());
    assert_ne!(engine.node_id().unwrap(), before);
    assert!(
        engine
            .get_db_entry(&DocId::from("a.md"), false, false)
            .unwrap()
            .is_none()
    );
    assert_eq!(current_db(&host, "boot-reset").info().unwrap().doc_count, 0);
}

#[test]
fn reset_local_old_database_only_touches_the_old_generation() {
    let host = TestHost::new();
    let old = host.seed_local("boot-reset-old-livesync");
    // Keep the old generation empty so init skips migration.

    let engine = frond::Engine::new(
        Arc::clone(&host) as Arc<dyn frond::Host>,
        "boot-reset-old",
        Settings::default(),
    )
    .unwrap();
    engine.initialize_database().unwrap();
    engine
        .put_db_entry(&frond::Note::new("keep.md", "kept", 1, 1), false)
        .unwrap()
        .unwrap();

    engine.reset_local_old_database().unwrap();
    assert!(old.is_destroyed());
    assert!(
        engine
            .get_db_entry(&DocId::from("keep.md"), false, false)
            .unwrap()
            .is_some()
    );
}

#[test]
fn local_database_info_reports_document_counts() {
    let (_host, engine) = ready_engine("boot-info", Settings::default());
    engine
        .put_db_entry(&frond::Note::new("a.md", "counted", 1, 1), false)
        .unwrap()
        .unwrap();

    let info = engine.local_database_info().unwrap();
    assert_eq!(info.doc_count, 2);
}
