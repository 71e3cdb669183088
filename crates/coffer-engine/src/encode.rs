//! Entry encoding
//!
//! Every entry starts with a header:
//! ```text
//! [8 bytes: metadata length, little-endian][metadata JSON]
//! ```
//! Small entries carry their content right after the header and are sealed
//! (or packed) as one buffer. Large files are cut into windows; window 0
//! carries the header, and each window is sealed under one random nonce
//! stepped by one per window.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::UNIX_EPOCH;

use coffer_core::types::{ChunkExtent, EntryMetadata};
use coffer_core::{CofferError, CofferResult};
use coffer_crypto::{encrypt_buffer_with_nonce, KeyRing, Nonce96};
use coffer_storage::ObjectStore;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::checkpoint::ShadowState;
use crate::layout;

const LEN_PREFIX: usize = 8;

pub fn metadata_for(path: &Path) -> CofferResult<EntryMetadata> {
    let meta = std::fs::symlink_metadata(path)?;
    let mod_time = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    Ok(EntryMetadata {
        is_dir: meta.is_dir(),
        mod_time,
        size: if meta.is_dir() { 0 } else { meta.len() },
        xattrs: read_xattrs(path),
    })
}

/// Extended attributes of `path`. Unreadable attributes are logged and
/// left out rather than failing the entry.
#[cfg(unix)]
pub fn read_xattrs(path: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut attrs = BTreeMap::new();
    let names = match xattr::list(path) {
        Ok(names) => names,
        Err(e) => {
            debug!(path = %path.display(), "extended attributes unavailable: {e}");
            return attrs;
        }
    };
    for name in names {
        let Some(key) = name.to_str().map(str::to_string) else {
            tracing::warn!(path = %path.display(), attr = ?name, "skipping non-UTF-8 attribute name");
            continue;
        };
        match xattr::get(path, &name) {
            Ok(Some(value)) => {
                attrs.insert(key, value);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(path = %path.display(), attr = %key, "reading attribute: {e}"),
        }
    }
    attrs
}

#[cfg(not(unix))]
pub fn read_xattrs(_path: &Path) -> BTreeMap<String, Vec<u8>> {
    BTreeMap::new()
}

pub fn encode_header(meta: &EntryMetadata) -> CofferResult<Vec<u8>> {
    let json = serde_json::to_vec(meta)
        .map_err(|e| CofferError::Other(anyhow::anyhow!("encoding entry metadata: {e}")))?;
    let mut out = Vec::with_capacity(LEN_PREFIX + json.len());
    out.extend_from_slice(&(json.len() as u64).to_le_bytes());
    out.extend_from_slice(&json);
    Ok(out)
}

/// Parse a header, returning the metadata and the offset where content starts.
pub fn decode_header(buf: &[u8]) -> CofferResult<(EntryMetadata, usize)> {
    let corrupt = |what: &str| CofferError::Storage(format!("corrupt entry header: {what}"));
    let prefix: [u8; LEN_PREFIX] = buf
        .get(..LEN_PREFIX)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| corrupt("truncated length"))?;
    let len = usize::try_from(u64::from_le_bytes(prefix)).map_err(|_| corrupt("length"))?;
    let end = LEN_PREFIX
        .checked_add(len)
        .filter(|end| *end <= buf.len())
        .ok_or_else(|| corrupt("truncated metadata"))?;
    let meta = serde_json::from_slice(&buf[LEN_PREFIX..end]).map_err(|e| corrupt(&e.to_string()))?;
    Ok((meta, end))
}

/// Header followed by the full content of a directory or small file.
pub async fn encode_small(path: &Path, meta: &EntryMetadata) -> CofferResult<Vec<u8>> {
    let mut buf = encode_header(meta)?;
    if !meta.is_dir {
        let mut f = tokio::fs::File::open(path).await?;
        f.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

/// Where per-file objects of an entry go, and who to tell about them
pub struct UploadTarget<'a> {
    pub store: &'a ObjectStore,
    pub keys: &'a KeyRing,
    pub shadow: &'a ShadowState,
    pub backup_name: &'a str,
    /// `<encBackup>/<encSnapshot>/<encRelPath>`
    pub object: String,
}

impl UploadTarget<'_> {
    async fn put(&self, name: &str, plaintext_len: usize, sealed: Vec<u8>) -> CofferResult<ChunkExtent> {
        ObjectStore::check_name(name)?;
        let size = sealed.len() as u64;
        self.shadow
            .with_mut(|db| db.note_uploaded_object(self.backup_name, name));
        self.store.upload(name, sealed).await?;
        self.shadow
            .with_mut(|db| db.add_uploaded_bytes(self.backup_name, size));
        Ok(ChunkExtent {
            chunk_name: name.to_string(),
            offset: 0,
            len: plaintext_len as u64,
        })
    }

    /// Seal a small entry that does not fit in a packed chunk.
    pub async fn upload_standalone(&self, buf: &[u8]) -> CofferResult<ChunkExtent> {
        let sealed = coffer_crypto::encrypt_buffer(self.keys.data_key(), buf)?;
        self.put(&self.object, buf.len(), sealed).await
    }

    /// Stream a large file window by window.
    pub async fn upload_large(
        &self,
        path: &Path,
        meta: &EntryMetadata,
        window_size: u64,
    ) -> CofferResult<Vec<ChunkExtent>> {
        let window_size = usize::try_from(window_size.max(1))
            .map_err(|_| CofferError::Config("window_size too large".into()))?;
        // the longest name decides up front, before anything is uploaded
        let windows = meta.size.div_ceil(window_size as u64).max(1);
        ObjectStore::check_name(&layout::window_object(&self.object, windows as u32))?;

        let mut file = tokio::fs::File::open(path).await?;
        let mut nonce = Nonce96::random();
        let mut extents = Vec::new();
        let mut index: u32 = 0;

        loop {
            let mut window = if index == 0 {
                encode_header(meta)?
            } else {
                Vec::with_capacity(window_size)
            };
            let header_len = window.len();
            let read = read_window(&mut file, &mut window, window_size).await?;
            if read == 0 && index > 0 {
                break;
            }

            let name = layout::window_object(&self.object, index);
            let sealed = encrypt_buffer_with_nonce(self.keys.data_key(), &window, &nonce)?;
            extents.push(self.put(&name, window.len(), sealed).await?);
            debug!(object = %name, bytes = window.len() - header_len, "window uploaded");

            if read < window_size {
                break;
            }
            nonce = nonce.increment()?;
            index += 1;
        }
        Ok(extents)
    }
}

/// Append up to `limit` bytes from `file` to `buf`. Returns the count read.
async fn read_window(
    file: &mut tokio::fs::File,
    buf: &mut Vec<u8>,
    limit: usize,
) -> CofferResult<usize> {
    let n = (&mut *file).take(limit as u64).read_to_end(buf).await?;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip_with_content() {
        let meta = EntryMetadata {
            is_dir: false,
            mod_time: 1_700_000_000,
            size: 5,
            xattrs: Default::default(),
        };
        let mut buf = encode_header(&meta).unwrap();
        buf.extend_from_slice(b"hello");

        let (decoded, offset) = decode_header(&buf).unwrap();
        assert_eq!(decoded, meta);
        assert_eq!(&buf[offset..], b"hello");
    }

    #[cfg(unix)]
    #[test]
    fn test_metadata_carries_user_xattrs() {
        let file = tempfile::NamedTempFile::new().unwrap();
        if xattr::set(file.path(), "user.coffer.label", b"blue").is_err() {
            // filesystem without user attributes
            return;
        }
        let meta = metadata_for(file.path()).unwrap();
        assert_eq!(meta.xattrs.get("user.coffer.label").map(Vec::as_slice), Some(&b"blue"[..]));

        let (decoded, _) = decode_header(&encode_header(&meta).unwrap()).unwrap();
        assert_eq!(decoded.xattrs, meta.xattrs);
    }

    #[test]
    fn test_length_prefix_is_little_endian() {
        let buf = encode_header(&EntryMetadata::default()).unwrap();
        let json_len = buf.len() - LEN_PREFIX;
        assert_eq!(buf[0] as usize, json_len & 0xFF);
        assert_eq!(&buf[4..8], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_truncated_header_rejected() {
        let buf = encode_header(&EntryMetadata::default()).unwrap();
        assert!(decode_header(&buf[..4]).is_err());
        assert!(decode_header(&buf[..buf.len() - 1]).is_err());
    }

    #[tokio::test]
    async fn test_encode_small_file_and_dir() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f.txt");
        std::fs::write(&file, b"content").unwrap();

        let meta = metadata_for(&file).unwrap();
        assert!(!meta.is_dir);
        assert_eq!(meta.size, 7);
        let buf = encode_small(&file, &meta).await.unwrap();
        let (_, off) = decode_header(&buf).unwrap();
        assert_eq!(&buf[off..], b"content");

        let dmeta = metadata_for(dir.path()).unwrap();
        assert!(dmeta.is_dir);
        let dbuf = encode_small(dir.path(), &dmeta).await.unwrap();
        let (_, doff) = decode_header(&dbuf).unwrap();
        assert_eq!(doff, dbuf.len());
    }
}
