//! Local backup state: directory entries, the task journal, in-flight runs
//! and usage history.
//!
//! `StateDb` is plain data. All access goes through
//! [`crate::checkpoint::ShadowState`], which owns the live copy and decides
//! when it is flushed to disk.

use chrono::{DateTime, Utc};
use coffer_core::types::{ChangeKind, CloudRelPath, TaskStatus};
use coffer_core::{CofferError, CofferResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A path seen under a backup root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub id: u64,
    pub root_name: String,
    pub rel_path: String,
    /// Unix seconds of the last run that stored this path; 0 = never
    pub last_backup_time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalTask {
    pub task_id: u64,
    pub backup_name: String,
    pub dir_entry_id: u64,
    pub rel_path: String,
    pub change_kind: ChangeKind,
    pub status: TaskStatus,
    pub result: Option<CloudRelPath>,
}

/// One in-flight backup run. Exists from enqueue until the index is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRun {
    pub backup_name: String,
    pub snapshot_name: String,
    pub snapshot_time: DateTime<Utc>,
    pub source_root: PathBuf,
    /// Every object this run has started uploading, for cleanup on abort
    #[serde(default)]
    pub uploaded_objects: Vec<String>,
    #[serde(default)]
    pub uploaded_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSample {
    pub at: DateTime<Utc>,
    pub backup_name: String,
    pub uploaded_bytes: u64,
    pub stored_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDb {
    next_entry_id: u64,
    next_task_id: u64,
    entries: BTreeMap<u64, DirEntry>,
    tasks: BTreeMap<u64, JournalTask>,
    runs: BTreeMap<String, BackupRun>,
    #[serde(default)]
    usage: Vec<UsageSample>,
}

impl StateDb {
    // ── Directory entries ───────────────────────────────────────────────

    /// Id of the entry for `(root, rel_path)`, creating it if unseen.
    pub fn upsert_dir_entry(&mut self, root_name: &str, rel_path: &str) -> u64 {
        if let Some(e) = self.find_dir_entry(root_name, rel_path) {
            return e.id;
        }
        self.next_entry_id += 1;
        let id = self.next_entry_id;
        self.entries.insert(
            id,
            DirEntry {
                id,
                root_name: root_name.to_string(),
                rel_path: rel_path.to_string(),
                last_backup_time: 0,
            },
        );
        id
    }

    pub fn find_dir_entry(&self, root_name: &str, rel_path: &str) -> Option<&DirEntry> {
        self.entries
            .values()
            .find(|e| e.root_name == root_name && e.rel_path == rel_path)
    }

    pub fn dir_entry(&self, id: u64) -> Option<&DirEntry> {
        self.entries.get(&id)
    }

    pub fn remove_dir_entry(&mut self, id: u64) -> Option<DirEntry> {
        self.entries.remove(&id)
    }

    pub fn set_last_backup(&mut self, id: u64, time: i64) {
        if let Some(e) = self.entries.get_mut(&id) {
            e.last_backup_time = time;
        }
    }

    /// Cap every last-backup time of a root at `cap`, returning how many
    /// entries moved back.
    pub fn rewind_last_backup(&mut self, root_name: &str, cap: i64) -> usize {
        let mut rewound = 0;
        for e in self.entries.values_mut() {
            if e.root_name == root_name && e.last_backup_time > cap {
                e.last_backup_time = cap;
                rewound += 1;
            }
        }
        rewound
    }

    /// Known paths of a root with their last-backup times
    pub fn known_paths(&self, root_name: &str) -> BTreeMap<String, i64> {
        self.entries
            .values()
            .filter(|e| e.root_name == root_name)
            .map(|e| (e.rel_path.clone(), e.last_backup_time))
            .collect()
    }

    // ── Runs ────────────────────────────────────────────────────────────

    pub fn start_run(&mut self, run: BackupRun) {
        self.runs.insert(run.backup_name.clone(), run);
    }

    pub fn run(&self, backup_name: &str) -> Option<&BackupRun> {
        self.runs.get(backup_name)
    }

    /// Record an object before its upload starts.
    pub fn note_uploaded_object(&mut self, backup_name: &str, object: &str) {
        if let Some(run) = self.runs.get_mut(backup_name) {
            if !run.uploaded_objects.iter().any(|o| o == object) {
                run.uploaded_objects.push(object.to_string());
            }
        }
    }

    pub fn add_uploaded_bytes(&mut self, backup_name: &str, bytes: u64) {
        if let Some(run) = self.runs.get_mut(backup_name) {
            run.uploaded_bytes += bytes;
        }
    }

    /// Drop a run together with its journal in one step.
    pub fn clear_run(&mut self, backup_name: &str) -> Option<BackupRun> {
        self.tasks.retain(|_, t| t.backup_name != backup_name);
        self.runs.remove(backup_name)
    }

    /// Forget everything about a root: run, journal and entries.
    pub fn drop_root(&mut self, root_name: &str) {
        self.clear_run(root_name);
        self.entries.retain(|_, e| e.root_name != root_name);
    }

    // ── Journal ─────────────────────────────────────────────────────────

    pub fn enqueue(
        &mut self,
        backup_name: &str,
        dir_entry_id: u64,
        rel_path: &str,
        change_kind: ChangeKind,
    ) -> u64 {
        self.next_task_id += 1;
        let task_id = self.next_task_id;
        self.tasks.insert(
            task_id,
            JournalTask {
                task_id,
                backup_name: backup_name.to_string(),
                dir_entry_id,
                rel_path: rel_path.to_string(),
                change_kind,
                status: TaskStatus::Unstarted,
                result: None,
            },
        );
        task_id
    }

    /// Claim the oldest unstarted task of a run, moving it to `InProgress`.
    ///
    /// Returns `NoWorkAvailable` once nothing is left to claim.
    pub fn claim_task(&mut self, backup_name: &str) -> CofferResult<JournalTask> {
        let task = self
            .tasks
            .values_mut()
            .find(|t| t.backup_name == backup_name && t.status == TaskStatus::Unstarted)
            .ok_or(CofferError::NoWorkAvailable)?;
        task.status = TaskStatus::InProgress;
        Ok(task.clone())
    }

    /// Finish a task. A task finishes at most once; later calls are ignored
    /// and return false.
    pub fn complete_task(&mut self, task_id: u64, result: Option<CloudRelPath>) -> bool {
        match self.tasks.get_mut(&task_id) {
            Some(t) if t.status != TaskStatus::Finished => {
                t.status = TaskStatus::Finished;
                t.result = result;
                true
            }
            _ => false,
        }
    }

    /// Return every `InProgress` task of a run to `Unstarted`.
    pub fn reset_in_progress(&mut self, backup_name: &str) -> usize {
        let mut n = 0;
        for t in self.tasks.values_mut() {
            if t.backup_name == backup_name && t.status == TaskStatus::InProgress {
                t.status = TaskStatus::Unstarted;
                n += 1;
            }
        }
        n
    }

    /// `(finished, total)` for a run
    pub fn progress(&self, backup_name: &str) -> (u64, u64) {
        self.tasks
            .values()
            .filter(|t| t.backup_name == backup_name)
            .fold((0, 0), |(f, n), t| {
                (f + u64::from(t.status == TaskStatus::Finished), n + 1)
            })
    }

    pub fn is_drained(&self, backup_name: &str) -> bool {
        let (finished, total) = self.progress(backup_name);
        finished == total
    }

    pub fn tasks_for(&self, backup_name: &str) -> Vec<JournalTask> {
        self.tasks
            .values()
            .filter(|t| t.backup_name == backup_name)
            .cloned()
            .collect()
    }

    /// Results of every finished task that produced one
    pub fn finished_results(&self, backup_name: &str) -> Vec<CloudRelPath> {
        self.tasks
            .values()
            .filter(|t| t.backup_name == backup_name && t.status == TaskStatus::Finished)
            .filter_map(|t| t.result.clone())
            .collect()
    }

    // ── Usage history ───────────────────────────────────────────────────

    pub fn record_usage(&mut self, sample: UsageSample) {
        self.usage.push(sample);
    }

    pub fn usage_since(&self, since: DateTime<Utc>) -> Vec<UsageSample> {
        self.usage.iter().filter(|s| s.at >= since).cloned().collect()
    }

    /// Snapshot time of the newest completed backup of any root
    pub fn last_completed(&self) -> Option<DateTime<Utc>> {
        self.usage.iter().map(|s| s.at).max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn run(name: &str) -> BackupRun {
        BackupRun {
            backup_name: name.into(),
            snapshot_name: "s".into(),
            snapshot_time: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            source_root: PathBuf::from("/src"),
            uploaded_objects: Vec::new(),
            uploaded_bytes: 0,
        }
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let mut db = StateDb::default();
        let a = db.upsert_dir_entry("docs", "a.txt");
        let b = db.upsert_dir_entry("docs", "a.txt");
        let c = db.upsert_dir_entry("photos", "a.txt");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(db.known_paths("docs").len(), 1);
    }

    #[test]
    fn test_rewind_caps_only_that_root() {
        let mut db = StateDb::default();
        let a = db.upsert_dir_entry("docs", "a");
        let b = db.upsert_dir_entry("docs", "b");
        let c = db.upsert_dir_entry("photos", "c");
        db.set_last_backup(a, 300);
        db.set_last_backup(b, 100);
        db.set_last_backup(c, 300);

        assert_eq!(db.rewind_last_backup("docs", 200), 1);
        let docs = db.known_paths("docs");
        assert_eq!(docs["a"], 200);
        assert_eq!(docs["b"], 100);
        assert_eq!(db.known_paths("photos")["c"], 300);
    }

    #[test]
    fn test_last_completed_is_newest_sample() {
        let mut db = StateDb::default();
        assert!(db.last_completed().is_none());
        let t = |d| Utc.with_ymd_and_hms(2026, 1, d, 0, 0, 0).unwrap();
        for (d, name) in [(3, "docs"), (5, "photos"), (4, "docs")] {
            db.record_usage(UsageSample {
                at: t(d),
                backup_name: name.into(),
                uploaded_bytes: 1,
                stored_bytes: 1,
            });
        }
        assert_eq!(db.last_completed(), Some(t(5)));
    }

    #[test]
    fn test_claim_drains_then_signals() {
        let mut db = StateDb::default();
        db.start_run(run("docs"));
        let e = db.upsert_dir_entry("docs", "a");
        db.enqueue("docs", e, "a", ChangeKind::Updated);
        db.enqueue("docs", e, "b", ChangeKind::Updated);

        let t1 = db.claim_task("docs").unwrap();
        let t2 = db.claim_task("docs").unwrap();
        assert_ne!(t1.task_id, t2.task_id);
        assert!(matches!(
            db.claim_task("docs"),
            Err(CofferError::NoWorkAvailable)
        ));
        assert!(matches!(
            db.claim_task("other"),
            Err(CofferError::NoWorkAvailable)
        ));
    }

    #[test]
    fn test_complete_is_exactly_once() {
        let mut db = StateDb::default();
        let e = db.upsert_dir_entry("docs", "a");
        let id = db.enqueue("docs", e, "a", ChangeKind::Updated);
        db.claim_task("docs").unwrap();

        assert!(db.complete_task(id, Some(CloudRelPath::new("a", vec![]))));
        assert!(!db.complete_task(id, None));
        assert_eq!(db.finished_results("docs").len(), 1);
        assert!(db.is_drained("docs"));
    }

    #[test]
    fn test_reset_in_progress() {
        let mut db = StateDb::default();
        let e = db.upsert_dir_entry("docs", "a");
        db.enqueue("docs", e, "a", ChangeKind::Updated);
        db.enqueue("docs", e, "b", ChangeKind::Unchanged);
        let first = db.claim_task("docs").unwrap();
        db.complete_task(first.task_id, None);
        db.claim_task("docs").unwrap();

        assert_eq!(db.progress("docs"), (1, 2));
        assert_eq!(db.reset_in_progress("docs"), 1);
        let again = db.claim_task("docs").unwrap();
        assert_eq!(again.rel_path, "b");
    }

    #[test]
    fn test_clear_run_removes_journal() {
        let mut db = StateDb::default();
        db.start_run(run("docs"));
        db.start_run(run("photos"));
        let e = db.upsert_dir_entry("docs", "a");
        db.enqueue("docs", e, "a", ChangeKind::Updated);
        db.enqueue("photos", e, "p", ChangeKind::Updated);

        assert!(db.clear_run("docs").is_some());
        assert!(db.run("docs").is_none());
        assert!(db.tasks_for("docs").is_empty());
        assert_eq!(db.tasks_for("photos").len(), 1);
        // entries survive a cleared run
        assert!(db.find_dir_entry("docs", "a").is_some());
    }

    #[test]
    fn test_note_uploaded_dedups() {
        let mut db = StateDb::default();
        db.start_run(run("docs"));
        db.note_uploaded_object("docs", "chunks/1");
        db.note_uploaded_object("docs", "chunks/1");
        db.add_uploaded_bytes("docs", 10);
        let r = db.run("docs").unwrap();
        assert_eq!(r.uploaded_objects, vec!["chunks/1"]);
        assert_eq!(r.uploaded_bytes, 10);
    }

    #[test]
    fn test_usage_window() {
        let mut db = StateDb::default();
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        for day in 0..5 {
            db.record_usage(UsageSample {
                at: t0 + chrono::Duration::days(day),
                backup_name: "docs".into(),
                uploaded_bytes: 1,
                stored_bytes: 1,
            });
        }
        assert_eq!(db.usage_since(t0 + chrono::Duration::days(3)).len(), 2);
    }
}
