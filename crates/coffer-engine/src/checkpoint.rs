//! Shadow state with explicit checkpoints
//!
//! The journal runs against an in-memory `StateDb`. It reaches disk only
//! through [`ShadowState::checkpoint`], written atomically (temp + rename) so
//! a crash leaves either the previous or the new checkpoint, never a torn one.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use coffer_core::config::EngineConfig;
use coffer_core::{CofferError, CofferResult};
use tracing::debug;

use crate::state::StateDb;

/// JSON file holding the last checkpoint
#[derive(Debug, Clone)]
pub struct DurableStore {
    path: PathBuf,
}

impl DurableStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the last checkpoint. A missing file is an empty state.
    pub fn load(&self) -> CofferResult<StateDb> {
        if !self.path.exists() {
            return Ok(StateDb::default());
        }
        let content = std::fs::read_to_string(&self.path)?;
        serde_json::from_str(&content).map_err(|e| {
            CofferError::JournalInvariantViolation(format!(
                "parsing state {}: {e}",
                self.path.display()
            ))
        })
    }

    pub async fn save(&self, json: &[u8]) -> CofferResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, json).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CheckpointPolicy {
    /// Opportunistic flushes are skipped until this much time has passed
    pub min_interval: Duration,
    /// A periodic flush happens once this much time has passed
    pub max_interval: Duration,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for CheckpointPolicy {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            min_interval: Duration::from_secs(cfg.checkpoint_min_secs),
            max_interval: Duration::from_secs(cfg.checkpoint_max_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Run start, run end, abort
    Forced,
    /// Piggybacks on a chunk upload; honours `min_interval`
    Opportunistic,
    /// Loop heartbeat; honours `max_interval`
    Periodic,
}

pub struct ShadowState {
    db: Mutex<StateDb>,
    durable: Option<DurableStore>,
    policy: CheckpointPolicy,
    last_flush: tokio::sync::Mutex<Instant>,
}

impl ShadowState {
    /// Open the shadow from the last durable checkpoint.
    pub fn open(durable: DurableStore, policy: CheckpointPolicy) -> CofferResult<Self> {
        let db = durable.load()?;
        Ok(Self {
            db: Mutex::new(db),
            durable: Some(durable),
            policy,
            last_flush: tokio::sync::Mutex::new(Instant::now()),
        })
    }

    /// A shadow that never reaches disk
    pub fn in_memory(policy: CheckpointPolicy) -> Self {
        Self {
            db: Mutex::new(StateDb::default()),
            durable: None,
            policy,
            last_flush: tokio::sync::Mutex::new(Instant::now()),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&StateDb) -> R) -> R {
        let guard = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut StateDb) -> R) -> R {
        let mut guard = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Copy the shadow into the durable store if `reason` says it is due.
    /// Returns whether a flush happened.
    pub async fn checkpoint(&self, reason: FlushReason) -> CofferResult<bool> {
        let mut last = self.last_flush.lock().await;
        let elapsed = last.elapsed();
        let due = match reason {
            FlushReason::Forced => true,
            FlushReason::Opportunistic => elapsed >= self.policy.min_interval,
            FlushReason::Periodic => elapsed >= self.policy.max_interval,
        };
        if !due {
            return Ok(false);
        }

        if let Some(durable) = &self.durable {
            let json = self
                .with(|db| serde_json::to_vec(db))
                .map_err(|e| CofferError::Other(anyhow::anyhow!("serializing state: {e}")))?;
            durable.save(&json).await?;
            debug!(?reason, bytes = json.len(), "state checkpointed");
        }
        *last = Instant::now();
        Ok(true)
    }
}
