//! Journal engine: one crash-resumable backup run per root
//!
//! A run scans the source tree, records one task per changed, unchanged or
//! deleted path, and then drains the tasks one claim at a time. All journal
//! state lives in the [`ShadowState`]; it is checkpointed before the drain
//! starts, while chunks upload, periodically, and when the run ends. After a
//! crash the next call to [`JournalEngine::backup`] finds the run, returns
//! its in-progress tasks to the queue and carries on.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use coffer_core::config::EngineConfig;
use coffer_core::types::{ChangeKind, CloudRelPath};
use coffer_core::{CofferError, CofferResult};
use coffer_crypto::{encrypt_name, KeyRing};
use coffer_storage::ObjectStore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpoint::{FlushReason, ShadowState};
use crate::encode::{self, UploadTarget};
use crate::layout;
use crate::packer::{ChunkPacker, PackContext};
use crate::snapshot::{self, Snapshot};
use crate::state::{BackupRun, JournalTask, UsageSample};
use crate::supervisor::ProgressSink;
use crate::walk;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Bound on the plaintext of one packed chunk
    pub chunk_size: u64,
    /// Files at least this large are streamed in windows
    pub large_file_threshold: u64,
    pub window_size: u64,
    /// Pause between journal iterations
    pub loop_yield: Duration,
    pub exclude_patterns: Vec<String>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for EngineOptions {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            chunk_size: cfg.chunk_size,
            large_file_threshold: cfg.large_file_threshold,
            window_size: cfg.window_size,
            loop_yield: Duration::from_millis(cfg.loop_yield_ms),
            exclude_patterns: cfg.exclude_patterns.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSummary {
    pub backup_name: String,
    pub snapshot_name: String,
    pub snapshot_time: DateTime<Utc>,
    /// Entries recorded in the index, tombstones included
    pub entries: usize,
    /// Tasks that finished without a result during this process's drain
    pub failed: usize,
    pub uploaded_bytes: u64,
    pub resumed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupOutcome {
    /// Nothing to record: the tree is empty and nothing was known before
    NoChanges,
    Completed(BackupSummary),
}

/// What processing a task produced
enum TaskOutput {
    Done(Option<CloudRelPath>),
    /// A small entry for the packer; finished when its chunk lands
    Pack(Vec<u8>),
}

/// Names shared by every task of one run
struct RunNames {
    enc_backup: String,
    enc_snapshot: String,
}

pub struct JournalEngine<'a> {
    pub store: &'a ObjectStore,
    pub keys: &'a KeyRing,
    pub shadow: &'a ShadowState,
    pub opts: &'a EngineOptions,
}

impl JournalEngine<'_> {
    /// Back up `root` as `backup_name`, or resume the run left behind by a
    /// crash. `now` names the snapshot of a fresh run.
    pub async fn backup(
        &self,
        backup_name: &str,
        root: &Path,
        now: DateTime<Utc>,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> CofferResult<BackupOutcome> {
        let resumed = self.shadow.with(|db| db.run(backup_name).is_some());
        if resumed {
            info!(backup = backup_name, "resuming interrupted run");
        } else if !self.enqueue_run(backup_name, root, now, cancel).await? {
            info!(backup = backup_name, "no changes to record");
            return Ok(BackupOutcome::NoChanges);
        }

        let result = self.drain(backup_name, progress, cancel, resumed).await;
        if let Err(e) = &result {
            if !matches!(
                e,
                CofferError::Cancelled | CofferError::JournalInvariantViolation(_)
            ) {
                // keep what was done so far for the next attempt
                if let Err(ce) = self.shadow.checkpoint(FlushReason::Forced).await {
                    warn!(backup = backup_name, "checkpoint after failed run: {ce}");
                }
            }
        }
        result
    }

    /// Scan, classify and enqueue. Returns false when there is nothing to do.
    async fn enqueue_run(
        &self,
        backup_name: &str,
        root: &Path,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> CofferResult<bool> {
        let scanned = {
            let root = root.to_path_buf();
            let excludes = self.opts.exclude_patterns.clone();
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || walk::scan(&root, &excludes, &cancel))
                .await
                .map_err(|e| CofferError::Other(anyhow::anyhow!("scan task failed: {e}")))??
        };
        let known = self.shadow.with(|db| db.known_paths(backup_name));
        let changes = walk::classify(&scanned, &known);
        if changes.is_empty() {
            return Ok(false);
        }

        let snapshot_name = snapshot::snapshot_name(now);
        let source_root = std::fs::canonicalize(root).unwrap_or_else(|_| PathBuf::from(root));
        self.shadow.with_mut(|db| {
            db.start_run(BackupRun {
                backup_name: backup_name.to_string(),
                snapshot_name: snapshot_name.clone(),
                snapshot_time: now,
                source_root,
                uploaded_objects: Vec::new(),
                uploaded_bytes: 0,
            });
            for change in &changes {
                let id = db.upsert_dir_entry(backup_name, &change.rel_path);
                db.enqueue(backup_name, id, &change.rel_path, change.kind);
            }
        });
        self.shadow.checkpoint(FlushReason::Forced).await?;

        let count = |k: ChangeKind| changes.iter().filter(|c| c.kind == k).count();
        info!(
            backup = backup_name,
            snapshot = %snapshot_name,
            updated = count(ChangeKind::Updated),
            unchanged = count(ChangeKind::Unchanged),
            deleted = count(ChangeKind::Deleted),
            "run enqueued"
        );
        Ok(true)
    }

    async fn drain(
        &self,
        backup_name: &str,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
        resumed: bool,
    ) -> CofferResult<BackupOutcome> {
        let run = self
            .shadow
            .with(|db| db.run(backup_name).cloned())
            .ok_or_else(|| {
                CofferError::JournalInvariantViolation(format!("no run recorded for {backup_name}"))
            })?;

        let reset = self.shadow.with_mut(|db| db.reset_in_progress(backup_name));
        if reset > 0 {
            debug!(backup = backup_name, reset, "in-progress tasks returned to queue");
        }
        self.shadow.checkpoint(FlushReason::Forced).await?;

        let names = RunNames {
            enc_backup: encrypt_name(self.keys.name_key(), backup_name)?,
            enc_snapshot: encrypt_name(self.keys.name_key(), &run.snapshot_name)?,
        };
        let previous = snapshot::load_backup_dir(self.store, self.keys, backup_name)
            .await?
            .predecessor(run.snapshot_time)
            .cloned();

        let ctx = PackContext {
            store: self.store,
            keys: self.keys,
            shadow: self.shadow,
            backup_name,
            backup_time: run.snapshot_time.timestamp(),
        };
        let mut packer = ChunkPacker::new(self.opts.chunk_size);
        let mut failed = 0usize;

        loop {
            if cancel.is_cancelled() {
                return self.abort(backup_name, &names).await;
            }
            self.shadow.checkpoint(FlushReason::Periodic).await?;

            let task = match self.shadow.with_mut(|db| db.claim_task(backup_name)) {
                Ok(task) => task,
                Err(CofferError::NoWorkAvailable) => break,
                Err(e) => return Err(e),
            };

            match self
                .process_task(&task, &run, &names, previous.as_ref())
                .await
            {
                Ok(TaskOutput::Done(result)) => {
                    self.shadow.with_mut(|db| {
                        if result.is_some() {
                            db.set_last_backup(task.dir_entry_id, ctx.backup_time);
                        }
                        db.complete_task(task.task_id, result);
                    });
                }
                Ok(TaskOutput::Pack(buf)) => {
                    if !packer.add_dir_entry(&task.rel_path, &buf, task.task_id, task.dir_entry_id) {
                        packer
                            .complete(&ctx, Some(self.shadow.checkpoint(FlushReason::Opportunistic)))
                            .await?;
                        if !packer.add_dir_entry(&task.rel_path, &buf, task.task_id, task.dir_entry_id) {
                            return Err(CofferError::JournalInvariantViolation(format!(
                                "{} does not fit an empty chunk",
                                task.rel_path
                            )));
                        }
                    }
                }
                Err(e) if e.is_fatal_for_run() => return Err(e),
                Err(e) => {
                    warn!(backup = backup_name, path = %task.rel_path, "task failed: {e}");
                    self.shadow
                        .with_mut(|db| db.complete_task(task.task_id, None));
                    failed += 1;
                }
            }

            let (finished, total) = self.shadow.with(|db| db.progress(backup_name));
            progress.report(finished, total, &task.rel_path);
            if !self.opts.loop_yield.is_zero() {
                tokio::time::sleep(self.opts.loop_yield).await;
            }
        }

        let drained = packer.flush(&ctx).await?;
        if !drained {
            return Err(CofferError::JournalInvariantViolation(format!(
                "{backup_name}: queue empty but tasks unfinished"
            )));
        }
        let (finished, total) = self.shadow.with(|db| db.progress(backup_name));
        progress.report(finished, total, "writing index");

        self.finalize(backup_name, &run, &names, failed, resumed).await
    }

    async fn process_task(
        &self,
        task: &JournalTask,
        run: &BackupRun,
        names: &RunNames,
        previous: Option<&Snapshot>,
    ) -> CofferResult<TaskOutput> {
        match task.change_kind {
            ChangeKind::Deleted => {
                self.shadow
                    .with_mut(|db| db.remove_dir_entry(task.dir_entry_id));
                Ok(TaskOutput::Done(Some(CloudRelPath::tombstone(&task.rel_path))))
            }
            ChangeKind::Unchanged => {
                let reusable = previous
                    .and_then(|s| s.rel_paths.get(&task.rel_path))
                    .filter(|e| !e.is_deleted && !e.chunk_extents.is_empty());
                match reusable {
                    Some(entry) => Ok(TaskOutput::Done(Some(entry.clone()))),
                    None => {
                        debug!(path = %task.rel_path, "no usable prior entry, uploading");
                        self.encode_updated(task, run, names).await
                    }
                }
            }
            ChangeKind::Updated => self.encode_updated(task, run, names).await,
        }
    }

    async fn encode_updated(
        &self,
        task: &JournalTask,
        run: &BackupRun,
        names: &RunNames,
    ) -> CofferResult<TaskOutput> {
        let path = run.source_root.join(&task.rel_path);
        let meta = match encode::metadata_for(&path) {
            Ok(meta) => meta,
            Err(CofferError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %task.rel_path, "vanished since scan, recording as deleted");
                self.shadow
                    .with_mut(|db| db.remove_dir_entry(task.dir_entry_id));
                return Ok(TaskOutput::Done(Some(CloudRelPath::tombstone(&task.rel_path))));
            }
            Err(e) => return Err(e),
        };

        let enc_rel = encrypt_name(self.keys.name_key(), &task.rel_path)?;
        let target = UploadTarget {
            store: self.store,
            keys: self.keys,
            shadow: self.shadow,
            backup_name: &run.backup_name,
            object: layout::entry_object(&names.enc_backup, &names.enc_snapshot, &enc_rel),
        };

        if !meta.is_dir && meta.size >= self.opts.large_file_threshold {
            let extents = target
                .upload_large(&path, &meta, self.opts.window_size)
                .await?;
            return Ok(TaskOutput::Done(Some(CloudRelPath::new(&task.rel_path, extents))));
        }

        let buf = encode::encode_small(&path, &meta).await?;
        if buf.len() as u64 <= self.opts.chunk_size {
            return Ok(TaskOutput::Pack(buf));
        }
        let extent = target.upload_standalone(&buf).await?;
        Ok(TaskOutput::Done(Some(CloudRelPath::new(&task.rel_path, vec![extent]))))
    }

    /// Write the index, drop objects nothing references, and close the run.
    async fn finalize(
        &self,
        backup_name: &str,
        run: &BackupRun,
        names: &RunNames,
        failed: usize,
        resumed: bool,
    ) -> CofferResult<BackupOutcome> {
        let mut snapshot = Snapshot::new(
            names.enc_snapshot.clone(),
            run.snapshot_name.clone(),
            run.snapshot_time,
        );
        for entry in self.shadow.with(|db| db.finished_results(backup_name)) {
            snapshot.insert(entry);
        }
        snapshot::write_index(self.store, self.keys, &names.enc_backup, &snapshot).await?;

        let referenced = snapshot.referenced_objects();
        let uploaded = self
            .shadow
            .with(|db| db.run(backup_name).map(|r| r.uploaded_objects.clone()))
            .unwrap_or_default();
        for object in uploaded.iter().filter(|o| !referenced.contains(*o)) {
            match self.store.delete(object).await {
                Ok(()) => debug!(object = %object, "orphan removed"),
                Err(e) => warn!(object = %object, "removing orphan: {e}"),
            }
        }

        let stored_bytes = self.stored_bytes(&names.enc_backup, &snapshot).await;
        let uploaded_bytes = self.shadow.with_mut(|db| {
            let uploaded_bytes = db
                .clear_run(backup_name)
                .map(|r| r.uploaded_bytes)
                .unwrap_or(0);
            db.record_usage(UsageSample {
                at: run.snapshot_time,
                backup_name: backup_name.to_string(),
                uploaded_bytes,
                stored_bytes,
            });
            uploaded_bytes
        });
        self.shadow.checkpoint(FlushReason::Forced).await?;

        info!(
            backup = backup_name,
            snapshot = %run.snapshot_name,
            entries = snapshot.rel_paths.len(),
            failed,
            uploaded_bytes,
            "backup complete"
        );
        Ok(BackupOutcome::Completed(BackupSummary {
            backup_name: backup_name.to_string(),
            snapshot_name: run.snapshot_name.clone(),
            snapshot_time: run.snapshot_time,
            entries: snapshot.rel_paths.len(),
            failed,
            uploaded_bytes,
            resumed,
        }))
    }

    /// Sealed size of everything the snapshot references. Listing failures
    /// only cost accuracy of the usage record.
    async fn stored_bytes(&self, enc_backup: &str, snapshot: &Snapshot) -> u64 {
        let mut sizes = self
            .store
            .list(&layout::backup_prefix(enc_backup))
            .await
            .unwrap_or_default();
        sizes.extend(self.store.list(layout::CHUNK_PREFIX).await.unwrap_or_default());
        snapshot
            .referenced_objects()
            .iter()
            .filter_map(|o| sizes.get(o))
            .sum()
    }

    /// Roll a cancelled run back: nothing it uploaded survives, and every
    /// path it touched is treated as never backed up.
    async fn abort(&self, backup_name: &str, names: &RunNames) -> CofferResult<BackupOutcome> {
        warn!(backup = backup_name, "run cancelled, rolling back");
        self.store
            .delete(&layout::index_object(&names.enc_backup, &names.enc_snapshot))
            .await?;

        let (uploaded, entry_ids) = self.shadow.with(|db| {
            (
                db.run(backup_name)
                    .map(|r| r.uploaded_objects.clone())
                    .unwrap_or_default(),
                db.tasks_for(backup_name)
                    .into_iter()
                    .map(|t| t.dir_entry_id)
                    .collect::<Vec<_>>(),
            )
        });
        for object in &uploaded {
            if let Err(e) = self.store.delete(object).await {
                warn!(object = %object, "removing object of cancelled run: {e}");
            }
        }

        self.shadow.with_mut(|db| {
            for id in entry_ids {
                db.set_last_backup(id, 0);
            }
            db.clear_run(backup_name);
        });
        self.shadow.checkpoint(FlushReason::Forced).await?;
        info!(backup = backup_name, removed = uploaded.len(), "cancelled run rolled back");
        Err(CofferError::Cancelled)
    }
}
