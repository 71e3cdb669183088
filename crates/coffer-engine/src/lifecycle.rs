//! Snapshot lifecycle: merge-forward delete, prune, wipe
//!
//! Deleting a snapshot must never break a later one. Per-file objects in the
//! deleted snapshot's namespace that a later snapshot still points at are
//! moved into the successor's namespace and every later index is rewritten;
//! everything only the deleted snapshot used is removed.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use coffer_core::{CofferError, CofferResult};
use coffer_crypto::KeyRing;
use coffer_storage::ObjectStore;
use tracing::{debug, info, warn};

use crate::checkpoint::{FlushReason, ShadowState};
use crate::layout;
use crate::snapshot::{self, BackupDir};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameObj {
    pub rel_path: String,
    pub old_object: String,
    pub new_object: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeletePlan {
    /// Decrypted name of the snapshot being removed
    pub snapshot: String,
    pub delete_objs: Vec<String>,
    pub rename_objs: Vec<RenameObj>,
}

/// Work out what deleting `snapshot_name` from `dir` takes.
pub fn plan_delete(dir: &BackupDir, snapshot_name: &str) -> CofferResult<DeletePlan> {
    let idx = dir
        .position(snapshot_name)
        .ok_or_else(|| CofferError::NotFound(format!("snapshot {snapshot_name} of {}", dir.name)))?;
    let target = &dir.snapshots[idx];
    let own_ns = layout::snapshot_namespace(&dir.encrypted_name, &target.encrypted_name);
    let successor_ns = dir
        .snapshots
        .get(idx + 1)
        .map(|s| layout::snapshot_namespace(&dir.encrypted_name, &s.encrypted_name));

    let still_used: BTreeSet<String> = dir
        .snapshots
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != idx)
        .flat_map(|(_, s)| s.referenced_objects())
        .collect();

    // object → a path that uses it, for reporting
    let mut owners: BTreeMap<&str, &str> = BTreeMap::new();
    for entry in target.rel_paths.values() {
        for extent in &entry.chunk_extents {
            owners
                .entry(extent.chunk_name.as_str())
                .or_insert(entry.rel_path.as_str());
        }
    }

    let mut plan = DeletePlan {
        snapshot: snapshot_name.to_string(),
        ..Default::default()
    };
    for (object, rel_path) in owners {
        if !still_used.contains(object) {
            plan.delete_objs.push(object.to_string());
            continue;
        }
        if !object.starts_with(&own_ns) {
            continue;
        }
        // only later snapshots can point into this namespace
        let new_object = successor_ns
            .as_deref()
            .and_then(|to| layout::rehome(object, &own_ns, to))
            .ok_or_else(|| {
                CofferError::Storage(format!(
                    "{object} is still referenced but {snapshot_name} has no successor"
                ))
            })?;
        plan.rename_objs.push(RenameObj {
            rel_path: rel_path.to_string(),
            old_object: object.to_string(),
            new_object,
        });
    }
    Ok(plan)
}

/// Carry out a plan: copy moved objects, rewrite later indices, then delete
/// the old objects and finally the snapshot's own index.
pub async fn execute_delete(
    store: &ObjectStore,
    keys: &KeyRing,
    dir: &mut BackupDir,
    plan: &DeletePlan,
) -> CofferResult<()> {
    let idx = dir
        .position(&plan.snapshot)
        .ok_or_else(|| CofferError::NotFound(format!("snapshot {} of {}", plan.snapshot, dir.name)))?;

    for r in &plan.rename_objs {
        ObjectStore::check_name(&r.new_object)?;
        store.copy(&r.old_object, &r.new_object).await?;
        debug!(path = %r.rel_path, from = %r.old_object, to = %r.new_object, "object moved forward");
    }

    let moved: BTreeMap<&str, &str> = plan
        .rename_objs
        .iter()
        .map(|r| (r.old_object.as_str(), r.new_object.as_str()))
        .collect();
    if !moved.is_empty() {
        for later in dir.snapshots.iter_mut().skip(idx + 1) {
            let mut touched = false;
            for entry in later.rel_paths.values_mut() {
                for extent in &mut entry.chunk_extents {
                    if let Some(new) = moved.get(extent.chunk_name.as_str()) {
                        extent.chunk_name = new.to_string();
                        touched = true;
                    }
                }
            }
            if touched {
                snapshot::write_index(store, keys, &dir.encrypted_name, later).await?;
            }
        }
    }

    for object in plan
        .rename_objs
        .iter()
        .map(|r| &r.old_object)
        .chain(&plan.delete_objs)
    {
        store.delete(object).await?;
    }

    let target = dir.snapshots.remove(idx);
    store
        .delete(&layout::index_object(&dir.encrypted_name, &target.encrypted_name))
        .await?;
    info!(
        backup = %dir.name,
        snapshot = %plan.snapshot,
        deleted = plan.delete_objs.len(),
        moved = plan.rename_objs.len(),
        "snapshot deleted"
    );
    Ok(())
}

/// Delete one snapshot of a backup.
///
/// Removing the newest snapshot rewinds the local last-backup times to the
/// snapshot that becomes the newest, so the next run re-uploads whatever
/// changed after it instead of reusing stale extents.
pub async fn delete_snapshot(
    store: &ObjectStore,
    keys: &KeyRing,
    shadow: &ShadowState,
    backup_name: &str,
    snapshot_name: &str,
) -> CofferResult<DeletePlan> {
    let mut dir = snapshot::load_backup_dir(store, keys, backup_name).await?;
    let plan = plan_delete(&dir, snapshot_name)?;

    let newest = dir
        .position(snapshot_name)
        .filter(|i| i + 1 == dir.snapshots.len());
    if let Some(idx) = newest {
        let cap = idx
            .checked_sub(1)
            .and_then(|p| dir.snapshots.get(p))
            .map_or(0, |s| s.datetime.timestamp());
        let rewound = shadow.with_mut(|db| db.rewind_last_backup(backup_name, cap));
        shadow.checkpoint(FlushReason::Forced).await?;
        debug!(backup = backup_name, rewound, cap, "last-backup times rewound");
    }

    execute_delete(store, keys, &mut dir, &plan).await?;
    Ok(plan)
}

/// Inclusive upper bounds, in days, of the age buckets past the first day.
/// Each bucket keeps its oldest and newest snapshot.
const BUCKETS: [i64; 4] = [3, 7, 30, 365];

/// Indices (into `times`) of the snapshots prune keeps.
///
/// Everything younger than a day stays. Within each of the buckets
/// `[1d,3d]`, `(3d,7d]`, `(7d,30d]` and `(30d,365d]` the oldest and newest
/// stay. The newest snapshot overall always stays.
pub fn prune_keep_list(times: &[DateTime<Utc>], now: DateTime<Utc>) -> BTreeSet<usize> {
    let day = Duration::days(1);
    let mut keep = BTreeSet::new();
    for (i, t) in times.iter().enumerate() {
        if now - *t < day {
            keep.insert(i);
        }
    }
    let mut lower = day;
    for (n, hi) in BUCKETS.into_iter().enumerate() {
        let upper = Duration::days(hi);
        let in_bucket = times.iter().enumerate().filter(|(_, t)| {
            let age = now - **t;
            let above = if n == 0 { age >= lower } else { age > lower };
            above && age <= upper
        });
        let oldest = in_bucket.clone().min_by_key(|(_, t)| **t).map(|(i, _)| i);
        let newest = in_bucket.max_by_key(|(_, t)| **t).map(|(i, _)| i);
        keep.extend(oldest);
        keep.extend(newest);
        lower = upper;
    }
    if let Some((i, _)) = times.iter().enumerate().max_by_key(|(_, t)| **t) {
        keep.insert(i);
    }
    keep
}

/// Delete every snapshot the retention schedule does not keep, oldest
/// first. Returns the names of the deleted snapshots.
pub async fn prune(
    store: &ObjectStore,
    keys: &KeyRing,
    backup_name: &str,
    now: DateTime<Utc>,
) -> CofferResult<Vec<String>> {
    let mut dir = snapshot::load_backup_dir(store, keys, backup_name).await?;
    let times: Vec<_> = dir.snapshots.iter().map(|s| s.datetime).collect();
    let keep = prune_keep_list(&times, now);
    let doomed: Vec<String> = dir
        .snapshots
        .iter()
        .enumerate()
        .filter(|(i, _)| !keep.contains(i))
        .map(|(_, s)| s.decrypted_name.clone())
        .collect();

    for name in &doomed {
        let plan = plan_delete(&dir, name)?;
        execute_delete(store, keys, &mut dir, &plan).await?;
    }
    info!(backup = backup_name, pruned = doomed.len(), kept = dir.snapshots.len(), "prune complete");
    Ok(doomed)
}

/// Remove a backup root entirely: its objects, the packed chunks its
/// snapshots reference, and its local state. Indices go last.
pub async fn wipe_backup(
    store: &ObjectStore,
    keys: &KeyRing,
    shadow: &ShadowState,
    backup_name: &str,
) -> CofferResult<usize> {
    if let Some(run) = shadow.with(|db| db.run(backup_name).cloned()) {
        for object in &run.uploaded_objects {
            if let Err(e) = store.delete(object).await {
                warn!(object = %object, "removing object of unfinished run: {e}");
            }
        }
    }

    let dir = snapshot::load_backup_dir(store, keys, backup_name).await?;
    let chunks: BTreeSet<String> = dir
        .snapshots
        .iter()
        .flat_map(|s| s.referenced_objects())
        .filter(|o| o.starts_with(layout::CHUNK_PREFIX))
        .collect();
    let index_prefix = layout::index_prefix(&dir.encrypted_name);
    let (indices, objects): (Vec<String>, Vec<String>) = store
        .list(&layout::backup_prefix(&dir.encrypted_name))
        .await?
        .into_keys()
        .partition(|o| o.starts_with(&index_prefix));

    let mut removed = 0;
    for object in chunks.iter().chain(&objects).chain(&indices) {
        store.delete(object).await?;
        removed += 1;
    }

    shadow.with_mut(|db| db.drop_root(backup_name));
    shadow.checkpoint(FlushReason::Forced).await?;
    info!(backup = backup_name, removed, "backup wiped");
    Ok(removed)
}
