//! coffer-engine: incremental encrypted backups on top of coffer-storage
//!
//! A backup run walks a source tree, journals one task per path and drains
//! the journal into sealed objects: small entries packed into shared chunks,
//! large files streamed in windows. Each finished run writes one snapshot
//! index. Snapshots can be restored, merged away or pruned.

pub mod cache;
pub mod checkpoint;
pub mod encode;
pub mod journal;
pub mod layout;
pub mod lifecycle;
pub mod packer;
pub mod repo;
pub mod restore;
pub mod service;
pub mod snapshot;
pub mod state;
pub mod supervisor;
pub mod walk;

pub use cache::ChunkCache;
pub use checkpoint::{CheckpointPolicy, DurableStore, FlushReason, ShadowState};
pub use journal::{BackupOutcome, BackupSummary, EngineOptions, JournalEngine};
pub use lifecycle::{DeletePlan, RenameObj};
pub use restore::{RestoreOptions, RestoreReport};
pub use service::BackupService;
pub use snapshot::{BackupDir, Snapshot};
pub use state::UsageSample;
pub use supervisor::{NoProgress, OperationState, ProgressSink, StatusRecord, Supervisor};
