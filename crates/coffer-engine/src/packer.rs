//! Chunk packer: many small entries, one sealed object
//!
//! Entries accumulate in plaintext until the next one would push the chunk
//! past its bound. `complete` then seals and uploads the chunk and only after
//! the upload lands are the packed tasks finished with their extents.

use std::future::Future;

use coffer_core::types::{ChunkExtent, CloudRelPath};
use coffer_core::CofferResult;
use coffer_crypto::KeyRing;
use coffer_storage::ObjectStore;
use tracing::{debug, warn};

use crate::checkpoint::ShadowState;
use crate::layout;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedItem {
    pub rel_path: String,
    pub offset: u64,
    pub len: u64,
    pub task_id: u64,
    pub dir_entry_id: u64,
}

/// Everything `complete` needs to upload and journal a chunk
pub struct PackContext<'a> {
    pub store: &'a ObjectStore,
    pub keys: &'a KeyRing,
    pub shadow: &'a ShadowState,
    pub backup_name: &'a str,
    /// Written as the last-backup time of every packed entry
    pub backup_time: i64,
}

#[derive(Debug)]
pub struct ChunkPacker {
    bound: u64,
    plaintext: Vec<u8>,
    items: Vec<PackedItem>,
}

impl ChunkPacker {
    pub fn new(bound: u64) -> Self {
        Self {
            bound,
            plaintext: Vec::new(),
            items: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn size(&self) -> u64 {
        self.plaintext.len() as u64
    }

    pub fn items(&self) -> &[PackedItem] {
        &self.items
    }

    /// Append an entry if the chunk stays within its bound. A rejected entry
    /// leaves the packer untouched.
    pub fn add_dir_entry(
        &mut self,
        rel_path: &str,
        buf: &[u8],
        task_id: u64,
        dir_entry_id: u64,
    ) -> bool {
        let offset = self.plaintext.len() as u64;
        if offset + buf.len() as u64 > self.bound {
            return false;
        }
        self.plaintext.extend_from_slice(buf);
        self.items.push(PackedItem {
            rel_path: rel_path.to_string(),
            offset,
            len: buf.len() as u64,
            task_id,
            dir_entry_id,
        });
        true
    }

    /// Seal and upload the chunk, running `side` concurrently with the
    /// upload. Tasks are finished only once both are done. Returns whether
    /// the run's journal is fully drained.
    pub async fn complete<F, T>(&mut self, ctx: &PackContext<'_>, side: Option<F>) -> CofferResult<bool>
    where
        F: Future<Output = CofferResult<T>>,
    {
        if self.items.is_empty() {
            if let Some(side) = side {
                side.await?;
            }
            return Ok(ctx.shadow.with(|db| db.is_drained(ctx.backup_name)));
        }

        let name = layout::new_chunk_name();
        ctx.shadow
            .with_mut(|db| db.note_uploaded_object(ctx.backup_name, &name));
        let sealed = coffer_crypto::encrypt_buffer(ctx.keys.data_key(), &self.plaintext)?;
        let sealed_len = sealed.len() as u64;

        let upload = ctx.store.upload(&name, sealed);
        let (uploaded, side_result) = match side {
            Some(side) => {
                let (u, s) = tokio::join!(upload, side);
                (u, Some(s))
            }
            None => (upload.await, None),
        };
        uploaded?;
        if let Some(Err(e)) = side_result {
            warn!(chunk = %name, "side task during chunk upload failed: {e}");
            return Err(e);
        }

        let items = std::mem::take(&mut self.items);
        self.plaintext.clear();
        let drained = ctx.shadow.with_mut(|db| {
            db.add_uploaded_bytes(ctx.backup_name, sealed_len);
            for item in &items {
                let extent = ChunkExtent {
                    chunk_name: name.clone(),
                    offset: item.offset,
                    len: item.len,
                };
                db.complete_task(item.task_id, Some(CloudRelPath::new(&item.rel_path, vec![extent])));
                db.set_last_backup(item.dir_entry_id, ctx.backup_time);
            }
            db.is_drained(ctx.backup_name)
        });
        debug!(chunk = %name, entries = items.len(), bytes = sealed_len, "chunk sealed");
        Ok(drained)
    }

    /// `complete` with nothing to overlap
    pub async fn flush(&mut self, ctx: &PackContext<'_>) -> CofferResult<bool> {
        self.complete(ctx, None::<std::future::Ready<CofferResult<()>>>)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointPolicy;
    use coffer_core::types::ChangeKind;
    use coffer_crypto::KEY_SIZE;
    use coffer_storage::{memory_operator, RetryPolicy};

    #[test]
    fn test_bound_is_respected() {
        let mut p = ChunkPacker::new(10);
        assert!(p.add_dir_entry("a", &[1; 6], 1, 1));
        assert!(!p.add_dir_entry("b", &[2; 5], 2, 2), "would exceed bound");
        assert_eq!(p.len(), 1);
        assert_eq!(p.size(), 6);
        assert!(p.add_dir_entry("c", &[3; 4], 3, 3), "exactly fills bound");
        assert_eq!(p.size(), 10);
        assert_eq!(p.items()[1].offset, 6);
    }

    #[test]
    fn test_oversized_entry_rejected_when_empty() {
        let mut p = ChunkPacker::new(4);
        assert!(!p.add_dir_entry("big", &[0; 5], 1, 1));
        assert!(p.is_empty());
    }

    #[tokio::test]
    async fn test_complete_finishes_tasks_with_extents() {
        let store = ObjectStore::new(memory_operator().unwrap(), RetryPolicy::none());
        let keys = KeyRing::from_keys([1; KEY_SIZE], [2; KEY_SIZE]);
        let shadow = ShadowState::in_memory(CheckpointPolicy::default());
        let (t1, t2, e1) = shadow.with_mut(|db| {
            let e1 = db.upsert_dir_entry("docs", "a");
            let e2 = db.upsert_dir_entry("docs", "b");
            let t1 = db.enqueue("docs", e1, "a", ChangeKind::Updated);
            let t2 = db.enqueue("docs", e2, "b", ChangeKind::Updated);
            db.claim_task("docs").unwrap();
            db.claim_task("docs").unwrap();
            (t1, t2, e1)
        });

        let mut p = ChunkPacker::new(1024);
        assert!(p.add_dir_entry("a", b"alpha", t1, e1));
        assert!(p.add_dir_entry("b", b"bravo!", t2, e1 + 1));

        let ctx = PackContext {
            store: &store,
            keys: &keys,
            shadow: &shadow,
            backup_name: "docs",
            backup_time: 1_700_000_000,
        };
        let side_ran = std::sync::atomic::AtomicBool::new(false);
        let drained = p
            .complete(&ctx, Some(async {
                side_ran.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok::<_, coffer_core::CofferError>(())
            }))
            .await
            .unwrap();

        assert!(drained);
        assert!(side_ran.load(std::sync::atomic::Ordering::SeqCst));
        assert!(p.is_empty());

        let results = shadow.with(|db| db.finished_results("docs"));
        let b = results.iter().find(|r| r.rel_path == "b").unwrap();
        assert_eq!(b.chunk_extents[0].offset, 5);
        assert_eq!(b.chunk_extents[0].len, 6);

        let chunk = &b.chunk_extents[0].chunk_name;
        let sealed = store.download(chunk).await.unwrap();
        let plain = coffer_crypto::decrypt_buffer(keys.data_key(), &sealed).unwrap();
        assert_eq!(&plain[5..11], b"bravo!");
        assert_eq!(
            shadow.with(|db| db.dir_entry(e1).unwrap().last_backup_time),
            1_700_000_000
        );
    }

    #[tokio::test]
    async fn test_flush_empty_reports_drain_state() {
        let store = ObjectStore::new(memory_operator().unwrap(), RetryPolicy::none());
        let keys = KeyRing::from_keys([1; KEY_SIZE], [2; KEY_SIZE]);
        let shadow = ShadowState::in_memory(CheckpointPolicy::default());
        shadow.with_mut(|db| {
            let e = db.upsert_dir_entry("docs", "a");
            db.enqueue("docs", e, "a", ChangeKind::Updated);
        });
        let ctx = PackContext {
            store: &store,
            keys: &keys,
            shadow: &shadow,
            backup_name: "docs",
            backup_time: 0,
        };
        assert!(!ChunkPacker::new(8).flush(&ctx).await.unwrap());
        assert!(store.list("chunks/").await.unwrap().is_empty());
    }
}
