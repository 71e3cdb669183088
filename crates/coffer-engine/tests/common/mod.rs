//! Shared fixtures for engine integration tests

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use chrono::{DateTime, TimeZone, Utc};
use coffer_crypto::{KeyRing, KEY_SIZE};
use coffer_engine::cache::ChunkCache;
use coffer_engine::restore::{restore_snapshot, RestoreOptions, RestoreReport};
use coffer_engine::{EngineOptions, NoProgress, Snapshot};
use coffer_storage::{memory_operator, ObjectStore, RetryPolicy};
use tokio_util::sync::CancellationToken;

/// 2020-01-01, well before any snapshot time used in tests
pub const OLD_MTIME: i64 = 1_577_836_800;

pub fn store() -> ObjectStore {
    ObjectStore::new(memory_operator().unwrap(), RetryPolicy::none())
}

pub fn keys() -> KeyRing {
    KeyRing::from_keys([3; KEY_SIZE], [4; KEY_SIZE])
}

/// Small bounds so every encoding path shows up with tiny files
pub fn opts() -> EngineOptions {
    EngineOptions {
        chunk_size: 256,
        large_file_threshold: 1024,
        window_size: 300,
        loop_yield: Duration::ZERO,
        exclude_patterns: vec!["*.skip".to_string()],
    }
}

pub fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).unwrap()
}

pub fn set_mtime(path: &Path, secs: i64) {
    std::fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(UNIX_EPOCH + Duration::from_secs(secs as u64))
        .unwrap();
}

pub fn write_file(root: &Path, rel: &str, content: &[u8], mtime: i64) -> PathBuf {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, content).unwrap();
    set_mtime(&path, mtime);
    path
}

pub fn patterned(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

/// A tree exercising packed, standalone and windowed entries
pub fn populate(root: &Path) {
    write_file(root, "notes.txt", b"remember the milk", OLD_MTIME);
    write_file(root, "docs/a.md", b"# alpha", OLD_MTIME);
    write_file(root, "docs/b.md", b"# bravo", OLD_MTIME);
    write_file(root, "docs/medium.bin", &patterned(500, 1), OLD_MTIME);
    write_file(root, "media/large.bin", &patterned(2000, 2), OLD_MTIME);
    write_file(root, "junk.skip", b"excluded", OLD_MTIME);
}

pub async fn restore_into(
    store: &ObjectStore,
    keys: &KeyRing,
    snapshot: &Snapshot,
    dest: &Path,
) -> RestoreReport {
    let cache_dir = tempfile::tempdir().unwrap();
    let cache = ChunkCache::open(cache_dir.path(), 1 << 20, store.clone())
        .await
        .unwrap();
    restore_snapshot(
        &cache,
        keys,
        snapshot,
        dest,
        &RestoreOptions::default(),
        &NoProgress,
        &CancellationToken::new(),
    )
    .await
    .unwrap()
}
