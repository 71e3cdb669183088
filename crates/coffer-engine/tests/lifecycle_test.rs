//! Integration test: merge-forward delete, prune and wipe
//!
//! Three runs share the large file's windows and the medium file's object,
//! which all live in the first snapshot's namespace. Removing snapshots must
//! keep every later one restorable.

mod common;

use std::collections::BTreeSet;

use chrono::Duration;
use coffer_engine::layout::{self, CHUNK_PREFIX};
use coffer_engine::lifecycle::{delete_snapshot, prune, wipe_backup};
use coffer_engine::snapshot::{group_snapshots, load_backup_dir};
use coffer_engine::{CheckpointPolicy, JournalEngine, NoProgress, ShadowState};
use coffer_storage::ObjectStore;
use common::*;
use tokio_util::sync::CancellationToken;

async fn three_runs(store: &ObjectStore, shadow: &ShadowState, src: &std::path::Path) {
    let (keys, opts) = (keys(), opts());
    let engine = JournalEngine {
        store,
        keys: &keys,
        shadow,
        opts: &opts,
    };
    let cancel = CancellationToken::new();
    for (i, day) in [1u32, 2, 3].into_iter().enumerate() {
        if i > 0 {
            let edited = at(day, 0).timestamp() - 60;
            write_file(src, "notes.txt", format!("edit {i}").as_bytes(), edited);
        }
        engine
            .backup("home", src, at(day, 0), &NoProgress, &cancel)
            .await
            .unwrap();
    }
}

async fn assert_restorable(store: &ObjectStore, src: &std::path::Path) {
    let keys = keys();
    let dir = load_backup_dir(store, &keys, "home").await.unwrap();
    for snap in &dir.snapshots {
        let dest = tempfile::tempdir().unwrap();
        let report = restore_into(store, &keys, snap, dest.path()).await;
        assert!(
            report.failures.is_empty(),
            "{} lost data: {:?}",
            snap.decrypted_name,
            report.failures
        );
        assert_eq!(
            std::fs::read(dest.path().join("media/large.bin")).unwrap(),
            std::fs::read(src.join("media/large.bin")).unwrap()
        );
    }
}

#[tokio::test]
async fn deleting_first_snapshot_moves_shared_objects_forward() {
    let src = tempfile::tempdir().unwrap();
    populate(src.path());
    let store = store();
    let shadow = ShadowState::in_memory(CheckpointPolicy::default());
    three_runs(&store, &shadow, src.path()).await;

    let keys = keys();
    let before = load_backup_dir(&store, &keys, "home").await.unwrap();
    let first = before.snapshots[0].decrypted_name.clone();
    let old_ns = layout::snapshot_namespace(&before.encrypted_name, &before.snapshots[0].encrypted_name);
    let new_ns = layout::snapshot_namespace(&before.encrypted_name, &before.snapshots[1].encrypted_name);

    let plan = delete_snapshot(&store, &keys, &shadow, "home", &first).await.unwrap();
    // seven windows plus the standalone medium file
    assert_eq!(plan.rename_objs.len(), 8);
    assert!(plan.rename_objs.iter().all(|r| r.new_object.starts_with(&new_ns)));
    let delete: BTreeSet<_> = plan.delete_objs.iter().collect();
    let rename: BTreeSet<_> = plan.rename_objs.iter().map(|r| &r.old_object).collect();
    assert!(delete.is_disjoint(&rename));

    assert!(store.list(&old_ns).await.unwrap().is_empty());
    let after = load_backup_dir(&store, &keys, "home").await.unwrap();
    assert_eq!(after.snapshots.len(), 2);
    for snap in &after.snapshots {
        assert!(snap.referenced_objects().iter().all(|o| !o.starts_with(&old_ns)));
    }
    assert_restorable(&store, src.path()).await;
}

#[tokio::test]
async fn deleting_middle_snapshot_keeps_neighbours() {
    let src = tempfile::tempdir().unwrap();
    populate(src.path());
    let store = store();
    let shadow = ShadowState::in_memory(CheckpointPolicy::default());
    three_runs(&store, &shadow, src.path()).await;

    let keys = keys();
    let dir = load_backup_dir(&store, &keys, "home").await.unwrap();
    let middle = dir.snapshots[1].decrypted_name.clone();
    let plan = delete_snapshot(&store, &keys, &shadow, "home", &middle).await.unwrap();
    // the middle run only owned its own packed chunk; nothing lives on in its namespace
    assert!(plan.rename_objs.is_empty());
    assert!(plan.delete_objs.iter().all(|o| o.starts_with(CHUNK_PREFIX)));

    let after = load_backup_dir(&store, &keys, "home").await.unwrap();
    assert_eq!(after.snapshots.len(), 2);
    assert_restorable(&store, src.path()).await;
}

#[tokio::test]
async fn deleting_newest_snapshot_does_not_resurrect_old_content() {
    let src = tempfile::tempdir().unwrap();
    populate(src.path());
    let (store, keys, opts) = (store(), keys(), opts());
    let shadow = ShadowState::in_memory(CheckpointPolicy::default());
    let engine = JournalEngine {
        store: &store,
        keys: &keys,
        shadow: &shadow,
        opts: &opts,
    };
    let cancel = CancellationToken::new();

    engine
        .backup("home", src.path(), at(1, 0), &NoProgress, &cancel)
        .await
        .unwrap();
    write_file(src.path(), "notes.txt", b"second draft", at(2, 0).timestamp() - 60);
    engine
        .backup("home", src.path(), at(2, 0), &NoProgress, &cancel)
        .await
        .unwrap();

    let dir = load_backup_dir(&store, &keys, "home").await.unwrap();
    let newest = dir.latest().unwrap().decrypted_name.clone();
    delete_snapshot(&store, &keys, &shadow, "home", &newest)
        .await
        .unwrap();
    let first_time = at(1, 0).timestamp();
    assert!(shadow.with(|db| db.known_paths("home").values().all(|t| *t <= first_time)));

    engine
        .backup("home", src.path(), at(3, 0), &NoProgress, &cancel)
        .await
        .unwrap();
    let dir = load_backup_dir(&store, &keys, "home").await.unwrap();
    assert_eq!(dir.snapshots.len(), 2);
    let (first, latest) = (&dir.snapshots[0], &dir.snapshots[1]);

    let dest = tempfile::tempdir().unwrap();
    let report = restore_into(&store, &keys, latest, dest.path()).await;
    assert!(report.failures.is_empty(), "{:?}", report.failures);
    assert_eq!(std::fs::read(dest.path().join("notes.txt")).unwrap(), b"second draft");

    // untouched files still come from the first snapshot
    assert_eq!(
        latest.rel_paths["media/large.bin"].chunk_extents,
        first.rel_paths["media/large.bin"].chunk_extents
    );
}

#[tokio::test]
async fn prune_applies_retention_and_keeps_newest() {
    let src = tempfile::tempdir().unwrap();
    populate(src.path());
    let store = store();
    let shadow = ShadowState::in_memory(CheckpointPolicy::default());
    three_runs(&store, &shadow, src.path()).await;

    let keys = keys();
    // seen from 2026-03-05 the runs are 4, 3 and 2 days old: the first in
    // (3d,7d], the other two at either end of [1d,3d]
    let now = at(5, 0);
    assert!(prune(&store, &keys, "home", now).await.unwrap().is_empty());

    // a year later only the newest survives
    let pruned = prune(&store, &keys, "home", now + Duration::days(400))
        .await
        .unwrap();
    assert_eq!(pruned.len(), 2);
    let dir = load_backup_dir(&store, &keys, "home").await.unwrap();
    assert_eq!(dir.snapshots.len(), 1);
    assert_eq!(dir.snapshots[0].datetime, at(3, 0));
    assert_restorable(&store, src.path()).await;
}

#[tokio::test]
async fn wipe_removes_every_object_and_local_state() {
    let src = tempfile::tempdir().unwrap();
    populate(src.path());
    let store = store();
    let shadow = ShadowState::in_memory(CheckpointPolicy::default());
    three_runs(&store, &shadow, src.path()).await;

    let keys = keys();
    let removed = wipe_backup(&store, &keys, &shadow, "home").await.unwrap();
    assert!(removed > 0);
    assert!(store.list("").await.unwrap().is_empty());
    assert!(group_snapshots(&store, &keys).await.unwrap().is_empty());
    assert!(shadow.with(|db| db.known_paths("home").is_empty()));
}
