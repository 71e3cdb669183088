//! Snapshot index: per-snapshot map of relative paths to chunk extents
//!
//! Stored as JSON → zstd → AES-GCM under `<encBackup>/@<encSnapshot>`.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDateTime, Utc};
use coffer_core::types::CloudRelPath;
use coffer_core::{CofferError, CofferResult};
use coffer_crypto::{decrypt_buffer, decrypt_name, encrypt_buffer, encrypt_name, KeyRing};
use coffer_storage::ObjectStore;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::layout;

const SNAPSHOT_NAME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Snapshot {
    pub encrypted_name: String,
    pub decrypted_name: String,
    pub datetime: DateTime<Utc>,
    pub rel_paths: BTreeMap<String, CloudRelPath>,
}

impl Snapshot {
    pub fn new(encrypted_name: String, decrypted_name: String, datetime: DateTime<Utc>) -> Self {
        Self {
            encrypted_name,
            decrypted_name,
            datetime,
            rel_paths: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, entry: CloudRelPath) {
        self.rel_paths.insert(entry.rel_path.clone(), entry);
    }

    /// Entries that are not tombstones
    pub fn live_entries(&self) -> impl Iterator<Item = &CloudRelPath> {
        self.rel_paths.values().filter(|e| !e.is_deleted)
    }

    /// Every object any extent of this snapshot points at
    pub fn referenced_objects(&self) -> BTreeSet<String> {
        self.rel_paths
            .values()
            .flat_map(|e| e.chunk_extents.iter().map(|x| x.chunk_name.clone()))
            .collect()
    }

    pub fn references(&self, object: &str) -> bool {
        self.rel_paths
            .values()
            .any(|e| e.chunk_extents.iter().any(|x| x.chunk_name == object))
    }
}

pub fn snapshot_name(at: DateTime<Utc>) -> String {
    at.format(SNAPSHOT_NAME_FORMAT).to_string()
}

pub fn parse_snapshot_name(name: &str) -> CofferResult<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(name, SNAPSHOT_NAME_FORMAT)
        .map(|n| n.and_utc())
        .map_err(|e| CofferError::Storage(format!("bad snapshot name {name:?}: {e}")))
}

/// All snapshots of one backup root, oldest first
#[derive(Debug, Clone, Default)]
pub struct BackupDir {
    pub name: String,
    pub encrypted_name: String,
    pub snapshots: Vec<Snapshot>,
}

impl BackupDir {
    pub fn latest(&self) -> Option<&Snapshot> {
        self.snapshots.last()
    }

    pub fn find(&self, snapshot_name: &str) -> Option<&Snapshot> {
        self.snapshots
            .iter()
            .find(|s| s.decrypted_name == snapshot_name)
    }

    pub fn position(&self, snapshot_name: &str) -> Option<usize> {
        self.snapshots
            .iter()
            .position(|s| s.decrypted_name == snapshot_name)
    }

    /// The newest snapshot strictly older than `at`
    pub fn predecessor(&self, at: DateTime<Utc>) -> Option<&Snapshot> {
        self.snapshots.iter().rev().find(|s| s.datetime < at)
    }

    pub fn successor(&self, snapshot_name: &str) -> Option<&Snapshot> {
        self.position(snapshot_name)
            .and_then(|i| self.snapshots.get(i + 1))
    }

    fn sort(&mut self) {
        self.snapshots.sort_by_key(|s| s.datetime);
    }
}

pub async fn write_index(
    store: &ObjectStore,
    keys: &KeyRing,
    enc_backup: &str,
    snapshot: &Snapshot,
) -> CofferResult<String> {
    let json = serde_json::to_vec(snapshot)
        .map_err(|e| CofferError::Other(anyhow::anyhow!("serializing snapshot index: {e}")))?;
    let compressed = zstd::encode_all(json.as_slice(), 0)?;
    let sealed = encrypt_buffer(keys.data_key(), &compressed)?;
    let object = layout::index_object(enc_backup, &snapshot.encrypted_name);
    store.upload(&object, sealed).await?;
    debug!(
        snapshot = %snapshot.decrypted_name,
        entries = snapshot.rel_paths.len(),
        "snapshot index written"
    );
    Ok(object)
}

pub async fn read_index(store: &ObjectStore, keys: &KeyRing, object: &str) -> CofferResult<Snapshot> {
    let sealed = store.download(object).await?;
    let compressed = decrypt_buffer(keys.data_key(), &sealed)?;
    let json = zstd::decode_all(compressed.as_slice())?;
    serde_json::from_slice(&json)
        .map_err(|e| CofferError::Storage(format!("parsing snapshot index {object}: {e}")))
}

/// Load every snapshot of one backup root.
pub async fn load_backup_dir(
    store: &ObjectStore,
    keys: &KeyRing,
    backup_name: &str,
) -> CofferResult<BackupDir> {
    let enc_backup = encrypt_name(keys.name_key(), backup_name)?;
    load_encrypted_backup_dir(store, keys, backup_name.to_string(), enc_backup).await
}

async fn load_encrypted_backup_dir(
    store: &ObjectStore,
    keys: &KeyRing,
    name: String,
    encrypted_name: String,
) -> CofferResult<BackupDir> {
    let prefix = layout::index_prefix(&encrypted_name);
    let mut dir = BackupDir {
        name,
        encrypted_name,
        snapshots: Vec::new(),
    };
    for object in store.list(&prefix).await?.into_keys() {
        let enc_snapshot = &object[prefix.len()..];
        let decrypted = decrypt_name(keys.name_key(), enc_snapshot)?;
        let snapshot = read_index(store, keys, &object).await?;
        if snapshot.decrypted_name != decrypted {
            return Err(CofferError::Storage(format!(
                "index {object} names snapshot {:?}, expected {decrypted:?}",
                snapshot.decrypted_name
            )));
        }
        dir.snapshots.push(snapshot);
    }
    dir.sort();
    Ok(dir)
}

/// Decrypt the top-level names of the repository and assemble every
/// backup root with its snapshots.
pub async fn group_snapshots(
    store: &ObjectStore,
    keys: &KeyRing,
) -> CofferResult<BTreeMap<String, BackupDir>> {
    let mut tops = BTreeSet::new();
    for object in store.list("").await?.into_keys() {
        if object.starts_with(layout::CHUNK_PREFIX) || object.starts_with(layout::SALT_PREFIX) {
            continue;
        }
        tops.insert(layout::top_level(&object).to_string());
    }

    let mut out = BTreeMap::new();
    for enc in tops {
        let name = decrypt_name(keys.name_key(), &enc)?;
        let dir = load_encrypted_backup_dir(store, keys, name.clone(), enc).await?;
        out.insert(name, dir);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use coffer_core::types::ChunkExtent;
    use coffer_crypto::KEY_SIZE;
    use coffer_storage::{memory_operator, RetryPolicy};

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, 0, 0).unwrap()
    }

    fn snap(keys: &KeyRing, t: DateTime<Utc>) -> Snapshot {
        let name = snapshot_name(t);
        let mut s = Snapshot::new(encrypt_name(keys.name_key(), &name).unwrap(), name, t);
        s.insert(CloudRelPath::new(
            "a.txt",
            vec![ChunkExtent {
                chunk_name: "chunks/1".into(),
                offset: 0,
                len: 3,
            }],
        ));
        s.insert(CloudRelPath::tombstone("gone.txt"));
        s
    }

    #[test]
    fn test_snapshot_name_roundtrip() {
        let t = Utc.with_ymd_and_hms(2026, 5, 4, 3, 2, 1).unwrap()
            + chrono::Duration::microseconds(123_456);
        let name = snapshot_name(t);
        assert_eq!(name, "2026-05-04T03:02:01.123456Z");
        assert_eq!(parse_snapshot_name(&name).unwrap(), t);
    }

    #[test]
    fn test_index_json_shape() {
        let keys = KeyRing::from_keys([1; KEY_SIZE], [2; KEY_SIZE]);
        let json = serde_json::to_value(snap(&keys, at(1))).unwrap();
        assert!(json.get("EncryptedName").is_some());
        assert!(json.get("DecryptedName").is_some());
        assert!(json.get("Datetime").is_some());
        assert_eq!(
            json["RelPaths"]["a.txt"]["ChunkExtents"][0]["ChunkName"],
            "chunks/1"
        );
        assert_eq!(json["RelPaths"]["gone.txt"]["IsDeleted"], true);
    }

    #[test]
    fn test_live_entries_skip_tombstones() {
        let keys = KeyRing::from_keys([1; KEY_SIZE], [2; KEY_SIZE]);
        let s = snap(&keys, at(1));
        assert_eq!(s.live_entries().count(), 1);
        assert!(s.references("chunks/1"));
        assert_eq!(s.referenced_objects().len(), 1);
    }

    #[tokio::test]
    async fn test_write_read_group() {
        let store = ObjectStore::new(memory_operator().unwrap(), RetryPolicy::none());
        let keys = KeyRing::from_keys([1; KEY_SIZE], [2; KEY_SIZE]);
        let enc_backup = encrypt_name(keys.name_key(), "docs").unwrap();

        // written out of order on purpose
        for h in [5, 1, 3] {
            write_index(&store, &keys, &enc_backup, &snap(&keys, at(h)))
                .await
                .unwrap();
        }
        store.upload("chunks/1", vec![0; 4]).await.unwrap();
        store.upload("SALT-00ff", vec![0; 4]).await.unwrap();

        let all = group_snapshots(&store, &keys).await.unwrap();
        assert_eq!(all.len(), 1);
        let dir = &all["docs"];
        let times: Vec<_> = dir.snapshots.iter().map(|s| s.datetime).collect();
        assert_eq!(times, vec![at(1), at(3), at(5)]);

        assert_eq!(dir.predecessor(at(5)).unwrap().datetime, at(3));
        assert!(dir.predecessor(at(1)).is_none());
        let mid = snapshot_name(at(3));
        assert_eq!(dir.successor(&mid).unwrap().datetime, at(5));
        assert_eq!(dir.latest().unwrap().datetime, at(5));
    }

    #[tokio::test]
    async fn test_foreign_key_cannot_read_index() {
        let store = ObjectStore::new(memory_operator().unwrap(), RetryPolicy::none());
        let keys = KeyRing::from_keys([1; KEY_SIZE], [2; KEY_SIZE]);
        let enc_backup = encrypt_name(keys.name_key(), "docs").unwrap();
        write_index(&store, &keys, &enc_backup, &snap(&keys, at(1)))
            .await
            .unwrap();

        let other = KeyRing::from_keys([9; KEY_SIZE], [9; KEY_SIZE]);
        assert!(matches!(
            group_snapshots(&store, &other).await,
            Err(CofferError::DecryptFailed)
        ));
    }
}
