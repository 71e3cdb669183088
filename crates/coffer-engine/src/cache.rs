//! Bounded disk cache of sealed chunk objects.
//!
//! Entries are keyed by object name and stored under
//! `{dir}/{key[0..2]}/{key}` where `key` is the blake3 hex of the name.
//! Writes are atomic (temp → rename). Eviction is strict LRU on the access
//! tick and runs only when an incoming object needs room. A hit also bumps
//! the file's mtime, which is what orders the cache after a reopen.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::Context;
use coffer_core::CofferResult;
use coffer_storage::ObjectStore;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct Slot {
    size: u64,
    last_access: u64,
}

#[derive(Debug, Default)]
struct Index {
    slots: HashMap<String, Slot>,
    used: u64,
    tick: u64,
}

impl Index {
    fn touch(&mut self, key: &str) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(slot) = self.slots.get_mut(key) {
            slot.last_access = tick;
        }
    }

    fn insert(&mut self, key: String, size: u64) {
        self.tick += 1;
        self.used += size;
        self.slots.insert(
            key,
            Slot {
                size,
                last_access: self.tick,
            },
        );
    }

    fn lru_victim(&self) -> Option<String> {
        self.slots
            .iter()
            .min_by_key(|(_, s)| s.last_access)
            .map(|(k, _)| k.clone())
    }
}

pub struct ChunkCache {
    dir: PathBuf,
    max_bytes: u64,
    store: ObjectStore,
    index: Mutex<Index>,
}

impl ChunkCache {
    /// Open the cache at `dir`, picking up entries left by earlier runs.
    /// Existing files are ordered by mtime so older files are evicted first.
    pub async fn open(dir: impl Into<PathBuf>, max_bytes: u64, store: ObjectStore) -> CofferResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating cache dir: {}", dir.display()))?;

        let mut found: Vec<(String, u64, std::time::SystemTime)> = Vec::new();
        let mut top = fs::read_dir(&dir).await?;
        while let Some(shard) = top.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut inner = fs::read_dir(shard.path()).await?;
            while let Some(entry) = inner.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.ends_with(".tmp") {
                    let _ = fs::remove_file(entry.path()).await;
                    continue;
                }
                let meta = entry.metadata().await?;
                if meta.is_file() {
                    let mtime = meta.modified().unwrap_or(std::time::UNIX_EPOCH);
                    found.push((name, meta.len(), mtime));
                }
            }
        }
        found.sort_by_key(|(_, _, mtime)| *mtime);

        let mut index = Index::default();
        for (key, size, _) in found {
            index.insert(key, size);
        }
        debug!(dir = %dir.display(), entries = index.slots.len(), bytes = index.used, "chunk cache opened");

        Ok(Self {
            dir,
            max_bytes,
            store,
            index: Mutex::new(index),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    fn key_for(object: &str) -> String {
        blake3::hash(object.as_bytes()).to_hex().to_string()
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(&key[..2]).join(key)
    }

    /// Sealed bytes of `object`, from disk if cached, otherwise downloaded
    /// and cached before returning.
    pub async fn fetch(&self, object: &str) -> CofferResult<Vec<u8>> {
        let key = Self::key_for(object);
        let path = self.path_for(&key);

        let mut index = self.index.lock().await;
        if index.slots.contains_key(&key) {
            match fs::read(&path).await {
                Ok(data) => {
                    index.touch(&key);
                    if let Err(e) = touch_mtime(&path) {
                        debug!(object, "could not bump cache mtime: {e}");
                    }
                    return Ok(data);
                }
                Err(e) => {
                    // file vanished underneath us; forget it and refetch
                    debug!(object, "cached file unreadable, refetching: {e}");
                    if let Some(slot) = index.slots.remove(&key) {
                        index.used = index.used.saturating_sub(slot.size);
                    }
                }
            }
        }
        drop(index);

        let data = self.store.download(object).await?;
        self.admit(&key, &path, &data).await?;
        Ok(data)
    }

    async fn admit(&self, key: &str, path: &Path, data: &[u8]) -> CofferResult<()> {
        let size = data.len() as u64;
        if size > self.max_bytes {
            debug!(bytes = size, "object larger than cache, not cached");
            return Ok(());
        }

        let mut index = self.index.lock().await;
        if index.slots.contains_key(key) {
            index.touch(key);
            return Ok(());
        }
        while index.used + size > self.max_bytes {
            let Some(victim) = index.lru_victim() else {
                break;
            };
            if let Some(slot) = index.slots.remove(&victim) {
                index.used = index.used.saturating_sub(slot.size);
            }
            let _ = fs::remove_file(self.path_for(&victim)).await;
            debug!(key = %victim, "evicted");
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating cache shard: {}", parent.display()))?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data)
            .await
            .with_context(|| format!("writing cache tmp: {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .await
            .with_context(|| format!("renaming cache entry: {}", path.display()))?;
        index.insert(key.to_string(), size);
        Ok(())
    }

    pub async fn contains(&self, object: &str) -> bool {
        self.index
            .lock()
            .await
            .slots
            .contains_key(&Self::key_for(object))
    }

    /// Bytes currently held on disk
    pub async fn usage(&self) -> u64 {
        self.index.lock().await.used
    }
}

fn touch_mtime(path: &Path) -> std::io::Result<()> {
    std::fs::File::options()
        .write(true)
        .open(path)?
        .set_modified(SystemTime::now())
}
