//! Source tree traversal and change classification

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::UNIX_EPOCH;

use coffer_core::types::ChangeKind;
use coffer_core::{CofferError, CofferResult};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEntry {
    /// `/`-separated, relative to the root
    pub rel_path: String,
    pub is_dir: bool,
    /// Unix seconds
    pub mod_time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub rel_path: String,
    pub kind: ChangeKind,
}

/// Walk `root` and return every file and directory under it, sorted by
/// relative path. Symlinks are skipped. Exclude globs are matched against
/// both the file name and the relative path.
pub fn scan(
    root: &Path,
    exclude_patterns: &[String],
    cancel: &CancellationToken,
) -> CofferResult<Vec<ScanEntry>> {
    let excludes: Vec<glob::Pattern> = exclude_patterns
        .iter()
        .filter_map(|p| match glob::Pattern::new(p) {
            Ok(pat) => Some(pat),
            Err(e) => {
                tracing::warn!(pattern = %p, "ignoring bad exclude pattern: {e}");
                None
            }
        })
        .collect();

    let mut out = Vec::new();
    scan_inner(root, "", &excludes, cancel, &mut out)?;
    out.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    debug!(root = %root.display(), entries = out.len(), "scan complete");
    Ok(out)
}

fn scan_inner(
    dir: &Path,
    prefix: &str,
    excludes: &[glob::Pattern],
    cancel: &CancellationToken,
    out: &mut Vec<ScanEntry>,
) -> CofferResult<()> {
    if cancel.is_cancelled() {
        return Err(CofferError::Cancelled);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_symlink() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            tracing::warn!(path = %entry.path().display(), "skipping non-UTF-8 name");
            continue;
        };
        let rel_path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}/{name}")
        };
        if excludes
            .iter()
            .any(|p| p.matches(&name) || p.matches(&rel_path))
        {
            continue;
        }

        let meta = entry.metadata()?;
        let mod_time = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        if file_type.is_dir() {
            out.push(ScanEntry {
                rel_path: rel_path.clone(),
                is_dir: true,
                mod_time,
            });
            scan_inner(&entry.path(), &rel_path, excludes, cancel, out)?;
        } else if file_type.is_file() {
            out.push(ScanEntry {
                rel_path,
                is_dir: false,
                mod_time,
            });
        }
    }
    Ok(())
}

/// Compare a scan against known paths (`rel_path → last backup time`).
///
/// A seen path is `Unchanged` only if it was backed up before (non-zero time)
/// and modified strictly before that backup. Known paths that were not seen
/// are `Deleted`.
pub fn classify(scan: &[ScanEntry], known: &BTreeMap<String, i64>) -> Vec<Change> {
    let mut seen = BTreeSet::new();
    let mut changes = Vec::with_capacity(scan.len());
    for entry in scan {
        seen.insert(entry.rel_path.as_str());
        let kind = match known.get(&entry.rel_path) {
            Some(&last) if last != 0 && entry.mod_time < last => ChangeKind::Unchanged,
            _ => ChangeKind::Updated,
        };
        changes.push(Change {
            rel_path: entry.rel_path.clone(),
            kind,
        });
    }
    for rel_path in known.keys() {
        if !seen.contains(rel_path.as_str()) {
            changes.push(Change {
                rel_path: rel_path.clone(),
                kind: ChangeKind::Deleted,
            });
        }
    }
    changes
}
