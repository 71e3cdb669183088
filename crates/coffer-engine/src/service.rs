//! The operations a front end drives, one at a time through the supervisor

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use coffer_core::config::{expand_tilde, CofferConfig};
use coffer_core::{CofferError, CofferResult};
use coffer_crypto::{KdfParams, KeyRing};
use coffer_storage::ObjectStore;
use secrecy::SecretString;
use tracing::info;

use crate::cache::ChunkCache;
use crate::checkpoint::{CheckpointPolicy, DurableStore, ShadowState};
use crate::journal::{BackupOutcome, EngineOptions, JournalEngine};
use crate::lifecycle::{self, DeletePlan};
use crate::repo;
use crate::restore::{self, RestoreOptions, RestoreReport};
use crate::snapshot::{self, BackupDir};
use crate::state::UsageSample;
use crate::supervisor::{Fanout, OperationState, ProgressSink, Supervisor};

pub struct BackupService {
    store: ObjectStore,
    keys: KeyRing,
    shadow: ShadowState,
    cache: ChunkCache,
    opts: EngineOptions,
    restore_opts: RestoreOptions,
    supervisor: Arc<Supervisor>,
}

impl BackupService {
    pub fn new(
        store: ObjectStore,
        keys: KeyRing,
        shadow: ShadowState,
        cache: ChunkCache,
        opts: EngineOptions,
        restore_opts: RestoreOptions,
    ) -> Self {
        let supervisor = Supervisor::new();
        if let Some(at) = shadow.with(|db| db.last_completed()) {
            supervisor.set_last_backup(at);
        }
        Self {
            store,
            keys,
            shadow,
            cache,
            opts,
            restore_opts,
            supervisor,
        }
    }

    /// Wire everything up from configuration: wait for storage, unlock (or
    /// create) the repository, load local state and open the chunk cache.
    pub async fn open(
        config: &CofferConfig,
        store: ObjectStore,
        password: &SecretString,
    ) -> CofferResult<Self> {
        store.wait_reachable().await?;
        let keys = repo::open_or_init(&store, password, &KdfParams::from(&config.crypto)).await?;
        let shadow = ShadowState::open(
            DurableStore::new(expand_tilde(&config.engine.state_path)),
            CheckpointPolicy::from(&config.engine),
        )?;
        let cache = ChunkCache::open(
            expand_tilde(&config.cache.dir),
            config.cache.max_mb.saturating_mul(1024 * 1024),
            store.clone(),
        )
        .await?;
        info!(backend = %config.storage.backend, "repository open");
        Ok(Self::new(
            store,
            keys,
            shadow,
            cache,
            EngineOptions::from(&config.engine),
            RestoreOptions::from(&config.restore),
        ))
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub async fn backup(
        &self,
        backup_name: &str,
        root: &Path,
        progress: &dyn ProgressSink,
    ) -> CofferResult<BackupOutcome> {
        self.backup_at(backup_name, root, Utc::now(), progress).await
    }

    /// `backup` with an explicit snapshot time
    pub async fn backup_at(
        &self,
        backup_name: &str,
        root: &Path,
        now: DateTime<Utc>,
        progress: &dyn ProgressSink,
    ) -> CofferResult<BackupOutcome> {
        let guard = self.supervisor.try_begin(OperationState::BackingUp)?;
        let engine = JournalEngine {
            store: &self.store,
            keys: &self.keys,
            shadow: &self.shadow,
            opts: &self.opts,
        };
        let outcome = engine
            .backup(backup_name, root, now, &Fanout(&guard, progress), guard.token())
            .await;
        if let Ok(BackupOutcome::Completed(summary)) = &outcome {
            self.supervisor.set_last_backup(summary.snapshot_time);
        }
        outcome
    }

    pub async fn snapshots(&self) -> CofferResult<BTreeMap<String, BackupDir>> {
        snapshot::group_snapshots(&self.store, &self.keys).await
    }

    pub async fn backup_dir(&self, backup_name: &str) -> CofferResult<BackupDir> {
        snapshot::load_backup_dir(&self.store, &self.keys, backup_name).await
    }

    /// Restore `snapshot_name` (or the latest snapshot) of a backup into `dest`.
    pub async fn restore(
        &self,
        backup_name: &str,
        snapshot_name: Option<&str>,
        dest: &Path,
        prefix: Option<String>,
        progress: &dyn ProgressSink,
    ) -> CofferResult<RestoreReport> {
        let guard = self.supervisor.try_begin(OperationState::Restoring)?;
        let dir = self.backup_dir(backup_name).await?;
        let snapshot = match snapshot_name {
            Some(name) => dir.find(name),
            None => dir.latest(),
        }
        .ok_or_else(|| {
            CofferError::NotFound(format!(
                "snapshot {} of {backup_name}",
                snapshot_name.unwrap_or("(latest)")
            ))
        })?;

        let opts = RestoreOptions {
            prefix,
            ..self.restore_opts.clone()
        };
        restore::restore_snapshot(
            &self.cache,
            &self.keys,
            snapshot,
            dest,
            &opts,
            &Fanout(&guard, progress),
            guard.token(),
        )
        .await
    }

    /// A pending run may already point at objects of earlier snapshots.
    fn ensure_no_pending_run(&self, backup_name: &str) -> CofferResult<()> {
        if self.shadow.with(|db| db.run(backup_name).is_some()) {
            return Err(CofferError::Busy(format!(
                "unfinished backup of {backup_name}"
            )));
        }
        Ok(())
    }

    pub async fn delete_snapshot(
        &self,
        backup_name: &str,
        snapshot_name: &str,
    ) -> CofferResult<DeletePlan> {
        let _guard = self.supervisor.try_begin(OperationState::Deleting)?;
        self.ensure_no_pending_run(backup_name)?;
        lifecycle::delete_snapshot(&self.store, &self.keys, &self.shadow, backup_name, snapshot_name)
            .await
    }

    pub async fn prune(&self, backup_name: &str, now: DateTime<Utc>) -> CofferResult<Vec<String>> {
        let _guard = self.supervisor.try_begin(OperationState::Pruning)?;
        self.ensure_no_pending_run(backup_name)?;
        lifecycle::prune(&self.store, &self.keys, backup_name, now).await
    }

    pub async fn wipe(&self, backup_name: &str) -> CofferResult<usize> {
        let _guard = self.supervisor.try_begin(OperationState::Wiping)?;
        lifecycle::wipe_backup(&self.store, &self.keys, &self.shadow, backup_name).await
    }

    pub fn usage(&self, since: DateTime<Utc>) -> Vec<UsageSample> {
        self.shadow.with(|db| db.usage_since(since))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use coffer_crypto::KEY_SIZE;
    use coffer_storage::{memory_operator, RetryPolicy};

    #[tokio::test]
    async fn test_status_remembers_last_backup_across_restarts() {
        let store = ObjectStore::new(memory_operator().unwrap(), RetryPolicy::none());
        let shadow = ShadowState::in_memory(CheckpointPolicy::default());
        let at = Utc.with_ymd_and_hms(2026, 3, 4, 5, 0, 0).unwrap();
        shadow.with_mut(|db| {
            db.record_usage(UsageSample {
                at,
                backup_name: "home".into(),
                uploaded_bytes: 10,
                stored_bytes: 10,
            })
        });
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = ChunkCache::open(cache_dir.path(), 1 << 20, store.clone())
            .await
            .unwrap();

        let service = BackupService::new(
            store,
            KeyRing::from_keys([1; KEY_SIZE], [2; KEY_SIZE]),
            shadow,
            cache,
            EngineOptions::default(),
            RestoreOptions::default(),
        );
        let status = service.supervisor().status();
        assert_eq!(status.state, OperationState::Idle);
        assert_eq!(status.last_backup, Some(at));
    }
}
