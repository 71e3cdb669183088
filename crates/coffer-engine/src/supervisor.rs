//! One operation at a time
//!
//! The supervisor owns the status record shown to users and hands out an
//! [`OperationGuard`] per running operation. A second operation is refused
//! with `Busy` until the guard drops.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use coffer_core::{CofferError, CofferResult};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OperationState {
    Idle,
    BackingUp,
    Restoring,
    Pruning,
    Deleting,
    Wiping,
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OperationState::Idle => "idle",
            OperationState::BackingUp => "backup",
            OperationState::Restoring => "restore",
            OperationState::Pruning => "prune",
            OperationState::Deleting => "delete",
            OperationState::Wiping => "wipe",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusRecord {
    pub state: OperationState,
    pub message: String,
    pub finished: u64,
    pub total: u64,
    pub last_backup: Option<DateTime<Utc>>,
}

impl Default for StatusRecord {
    fn default() -> Self {
        Self {
            state: OperationState::Idle,
            message: String::new(),
            finished: 0,
            total: 0,
            last_backup: None,
        }
    }
}

/// Receives `finished/total` progress from long-running operations
pub trait ProgressSink: Send + Sync {
    fn report(&self, finished: u64, total: u64, message: &str);
}

pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _finished: u64, _total: u64, _message: &str) {}
}

/// Forwards progress to two sinks
pub struct Fanout<'a>(pub &'a dyn ProgressSink, pub &'a dyn ProgressSink);

impl ProgressSink for Fanout<'_> {
    fn report(&self, finished: u64, total: u64, message: &str) {
        self.0.report(finished, total, message);
        self.1.report(finished, total, message);
    }
}

#[derive(Default)]
struct Inner {
    status: StatusRecord,
    current: Option<CancellationToken>,
}

#[derive(Default)]
pub struct Supervisor {
    inner: Mutex<Inner>,
}

impl Supervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start an operation, or fail with `Busy` if one is already running.
    pub fn try_begin(self: &Arc<Self>, kind: OperationState) -> CofferResult<OperationGuard> {
        let mut inner = self.lock();
        if inner.status.state != OperationState::Idle {
            return Err(CofferError::Busy(inner.status.state.to_string()));
        }
        let token = CancellationToken::new();
        inner.status.state = kind;
        inner.status.message = format!("{kind} started");
        inner.status.finished = 0;
        inner.status.total = 0;
        inner.current = Some(token.clone());
        tracing::info!(operation = %kind, "operation started");
        Ok(OperationGuard {
            supervisor: Arc::clone(self),
            token,
        })
    }

    pub fn status(&self) -> StatusRecord {
        self.lock().status.clone()
    }

    /// Ask the running operation to stop. Returns false when idle.
    pub fn cancel_current(&self) -> bool {
        match &self.lock().current {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn set_last_backup(&self, at: DateTime<Utc>) {
        self.lock().status.last_backup = Some(at);
    }
}

/// Held for the lifetime of one operation
pub struct OperationGuard {
    supervisor: Arc<Supervisor>,
    token: CancellationToken,
}

impl OperationGuard {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl ProgressSink for OperationGuard {
    fn report(&self, finished: u64, total: u64, message: &str) {
        let mut inner = self.supervisor.lock();
        inner.status.finished = finished;
        inner.status.total = total;
        inner.status.message = message.to_string();
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        let mut inner = self.supervisor.lock();
        tracing::info!(operation = %inner.status.state, "operation finished");
        inner.status.state = OperationState::Idle;
        inner.status.message = String::new();
        inner.current = None;
    }
}
