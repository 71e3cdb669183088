//! Restore a snapshot into a local directory

use std::path::{Component, Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use coffer_core::config::RestoreConfig;
use coffer_core::types::{CloudRelPath, EntryMetadata};
use coffer_core::{CofferError, CofferResult};
use coffer_crypto::{decrypt_buffer, decrypt_buffer_returning_nonce, KeyRing, Nonce96};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::ChunkCache;
use crate::encode::decode_header;
use crate::layout::{self, ExtentKind};
use crate::snapshot::Snapshot;
use crate::supervisor::ProgressSink;

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Fail a large file whose window nonces do not step by one
    pub strict_nonce_order: bool,
    /// Only restore this path and what lies beneath it
    pub prefix: Option<String>,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self::from(&RestoreConfig::default())
    }
}

impl From<&RestoreConfig> for RestoreOptions {
    fn from(cfg: &RestoreConfig) -> Self {
        Self {
            strict_nonce_order: cfg.strict_nonce_order,
            prefix: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub files: u64,
    pub dirs: u64,
    pub bytes: u64,
    /// `(rel_path, reason)` for every entry that could not be restored
    pub failures: Vec<(String, String)>,
}

fn under_prefix(rel_path: &str, prefix: Option<&str>) -> bool {
    match prefix.map(|p| p.trim_end_matches('/')) {
        None | Some("") => true,
        Some(p) => rel_path == p || rel_path.strip_prefix(p).is_some_and(|r| r.starts_with('/')),
    }
}

/// Join a stored relative path onto `dest`, refusing anything that could
/// escape it.
fn safe_join(dest: &Path, rel_path: &str) -> CofferResult<PathBuf> {
    let rel = Path::new(rel_path);
    if rel_path.is_empty() || !rel.components().all(|c| matches!(c, Component::Normal(_))) {
        return Err(CofferError::Storage(format!("refusing unsafe path {rel_path:?}")));
    }
    Ok(dest.join(rel))
}

/// Most recently decrypted packed chunk; entries of one chunk are adjacent
/// more often than not.
#[derive(Default)]
struct ChunkMemo {
    name: String,
    plaintext: Vec<u8>,
}

pub async fn restore_snapshot(
    cache: &ChunkCache,
    keys: &KeyRing,
    snapshot: &Snapshot,
    dest: &Path,
    opts: &RestoreOptions,
    progress: &dyn ProgressSink,
    cancel: &CancellationToken,
) -> CofferResult<RestoreReport> {
    tokio::fs::create_dir_all(dest).await?;
    let entries: Vec<&CloudRelPath> = snapshot
        .live_entries()
        .filter(|e| under_prefix(&e.rel_path, opts.prefix.as_deref()))
        .collect();
    let total = entries.len() as u64;
    let mut report = RestoreReport::default();
    let mut memo = ChunkMemo::default();

    for (done, entry) in entries.into_iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(CofferError::Cancelled);
        }
        match restore_entry(cache, keys, entry, dest, opts, &mut memo).await {
            Ok(Restored::Dir) => report.dirs += 1,
            Ok(Restored::File(bytes)) => {
                report.files += 1;
                report.bytes += bytes;
            }
            Err(e) if e.is_fatal_for_run() => return Err(e),
            Err(e) => {
                warn!(path = %entry.rel_path, "restore failed: {e}");
                report.failures.push((entry.rel_path.clone(), e.to_string()));
            }
        }
        progress.report(done as u64 + 1, total, &entry.rel_path);
    }

    info!(
        snapshot = %snapshot.decrypted_name,
        files = report.files,
        dirs = report.dirs,
        bytes = report.bytes,
        failures = report.failures.len(),
        "restore complete"
    );
    Ok(report)
}

enum Restored {
    Dir,
    File(u64),
}

async fn restore_entry(
    cache: &ChunkCache,
    keys: &KeyRing,
    entry: &CloudRelPath,
    dest: &Path,
    opts: &RestoreOptions,
    memo: &mut ChunkMemo,
) -> CofferResult<Restored> {
    let path = safe_join(dest, &entry.rel_path)?;
    let first = entry
        .chunk_extents
        .first()
        .ok_or_else(|| CofferError::Storage(format!("{} has no extents", entry.rel_path)))?;

    if let ExtentKind::Window(_) = layout::extent_kind(&first.chunk_name) {
        return restore_windows(cache, keys, entry, &path, opts).await;
    }

    let buf = match layout::extent_kind(&first.chunk_name) {
        ExtentKind::Packed => {
            if memo.name != first.chunk_name {
                let sealed = cache.fetch(&first.chunk_name).await?;
                memo.plaintext = decrypt_buffer(keys.data_key(), &sealed)?;
                memo.name = first.chunk_name.clone();
            }
            let start = usize::try_from(first.offset).ok();
            let end = start.and_then(|s| s.checked_add(usize::try_from(first.len).ok()?));
            match (start, end) {
                (Some(s), Some(e)) if e <= memo.plaintext.len() => memo.plaintext[s..e].to_vec(),
                _ => {
                    return Err(CofferError::Storage(format!(
                        "extent of {} lies outside chunk {}",
                        entry.rel_path, first.chunk_name
                    )))
                }
            }
        }
        _ => {
            let sealed = cache.fetch(&first.chunk_name).await?;
            decrypt_buffer(keys.data_key(), &sealed)?
        }
    };

    let (meta, offset) = decode_header(&buf)?;
    if meta.is_dir {
        tokio::fs::create_dir_all(&path).await?;
        apply_xattrs(&path, &meta);
        return Ok(Restored::Dir);
    }
    let content = &buf[offset..];
    let tmp = staging_path(&path).await?;
    tokio::fs::write(&tmp, content).await?;
    commit(&tmp, &path, &meta).await?;
    Ok(Restored::File(content.len() as u64))
}

async fn restore_windows(
    cache: &ChunkCache,
    keys: &KeyRing,
    entry: &CloudRelPath,
    path: &Path,
    opts: &RestoreOptions,
) -> CofferResult<Restored> {
    let mut windows: Vec<(u32, &str)> = Vec::with_capacity(entry.chunk_extents.len());
    for extent in &entry.chunk_extents {
        match layout::extent_kind(&extent.chunk_name) {
            ExtentKind::Window(i) => windows.push((i, extent.chunk_name.as_str())),
            _ => {
                return Err(CofferError::Storage(format!(
                    "{} mixes windows with other extents",
                    entry.rel_path
                )))
            }
        }
    }
    windows.sort_by_key(|(i, _)| *i);

    let tmp = staging_path(path).await?;
    let mut file = tokio::fs::File::create(&tmp).await?;
    let mut meta: Option<EntryMetadata> = None;
    let mut previous: Option<Nonce96> = None;
    let mut bytes = 0u64;

    for (i, object) in windows {
        let sealed = cache.fetch(object).await?;
        let (plain, nonce) = decrypt_buffer_returning_nonce(keys.data_key(), &sealed)?;
        if let Some(prev) = &previous {
            if !nonce.is_successor_of(prev) {
                let err = CofferError::NonceSequence {
                    object: object.to_string(),
                    expected: prev.increment().map(|n| n.to_hex()).unwrap_or_default(),
                    found: nonce.to_hex(),
                };
                if opts.strict_nonce_order {
                    drop(file);
                    let _ = tokio::fs::remove_file(&tmp).await;
                    return Err(err);
                }
                warn!(path = %entry.rel_path, "{err}");
            }
        }
        previous = Some(nonce);

        let content = if meta.is_none() {
            let (m, offset) = decode_header(&plain)?;
            meta = Some(m);
            &plain[offset..]
        } else {
            &plain[..]
        };
        file.write_all(content).await?;
        bytes += content.len() as u64;
        debug!(path = %entry.rel_path, window = i, "window restored");
    }
    file.flush().await?;
    drop(file);

    let meta = meta.ok_or_else(|| CofferError::Storage(format!("{} has no header", entry.rel_path)))?;
    commit(&tmp, path, &meta).await?;
    Ok(Restored::File(bytes))
}

fn tmp_path(path: &Path) -> CofferResult<PathBuf> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| CofferError::Storage(format!("bad restore target {}", path.display())))?;
    Ok(path.with_file_name(format!(".{name}.coffer-tmp")))
}

async fn staging_path(path: &Path) -> CofferResult<PathBuf> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tmp_path(path)
}

/// Reapply stored extended attributes. A failure costs that attribute only.
fn apply_xattrs(path: &Path, meta: &EntryMetadata) {
    #[cfg(unix)]
    for (name, value) in &meta.xattrs {
        if let Err(e) = xattr::set(path, name, value) {
            warn!(path = %path.display(), attr = %name, "restoring attribute: {e}");
        }
    }
    #[cfg(not(unix))]
    let _ = (path, meta);
}

/// Move the finished temp file into place, then restore its attributes and
/// mtime.
async fn commit(tmp: &Path, path: &Path, meta: &EntryMetadata) -> CofferResult<()> {
    tokio::fs::rename(tmp, path).await?;
    apply_xattrs(path, meta);
    if let Ok(secs) = u64::try_from(meta.mod_time) {
        let file = std::fs::File::options().write(true).open(path)?;
        file.set_modified(UNIX_EPOCH + Duration::from_secs(secs))?;
    }
    Ok(())
}
