//! Name-checked, retrying facade over an OpenDAL operator
//!
//! Every stored object is the payload followed by its 32-byte blake3 digest.
//! `download` checks and strips the trailer, so a truncated or altered object
//! fails before any decryption is attempted.

use std::collections::BTreeMap;
use std::future::IntoFuture;
use std::time::Duration;

use coffer_core::{CofferError, CofferResult, MAX_OBJECT_NAME_LEN};
use opendal::{Buffer, Operator};
use tracing::debug;

use crate::retry::{retry_storage, RetryPolicy};

#[derive(Clone)]
pub struct ObjectStore {
    op: Operator,
    policy: RetryPolicy,
}

impl std::fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore")
            .field("scheme", &self.op.info().scheme())
            .field("policy", &self.policy)
            .finish()
    }
}

fn map_err(name: &str, e: opendal::Error) -> CofferError {
    if e.kind() == opendal::ErrorKind::NotFound {
        CofferError::NotFound(name.to_string())
    } else {
        CofferError::Storage(format!("{name}: {e}"))
    }
}

const TAG_LEN: usize = blake3::OUT_LEN;

/// Hex form of the integrity tag stored with `data`
pub fn integrity_tag(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Split a stored object into its payload, checking the trailing tag.
fn verify_trailer(name: &str, mut stored: Vec<u8>) -> CofferResult<Vec<u8>> {
    let Some(split) = stored.len().checked_sub(TAG_LEN) else {
        return Err(CofferError::Storage(format!(
            "{name}: {} bytes is shorter than its integrity tag",
            stored.len()
        )));
    };
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&stored[split..]);
    if blake3::hash(&stored[..split]) != blake3::Hash::from(tag) {
        return Err(CofferError::Storage(format!("{name}: integrity check failed")));
    }
    stored.truncate(split);
    Ok(stored)
}

impl ObjectStore {
    pub fn new(op: Operator, policy: RetryPolicy) -> Self {
        Self { op, policy }
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }

    /// Reject names the backend would refuse.
    pub fn check_name(name: &str) -> CofferResult<()> {
        if name.len() > MAX_OBJECT_NAME_LEN {
            return Err(CofferError::ObjectTooLong {
                len: name.len(),
                limit: MAX_OBJECT_NAME_LEN,
            });
        }
        Ok(())
    }

    /// Every object whose name starts with `prefix`, with its size.
    pub async fn list(&self, prefix: &str) -> CofferResult<BTreeMap<String, u64>> {
        // list the enclosing "directory" and filter, since prefixes such as
        // "<backup>/@" are not directories
        let dir = match prefix.rfind('/') {
            Some(i) => &prefix[..=i],
            None => "/",
        };

        let entries = match retry_storage(
            &self.policy,
            "list",
            move || self.op.list_with(dir).recursive(true).into_future(),
            |e| map_err(dir, e),
        )
        .await
        {
            Ok(entries) => entries,
            Err(CofferError::NotFound(_)) => return Ok(BTreeMap::new()),
            Err(e) => return Err(e),
        };

        let mut out = BTreeMap::new();
        for entry in entries {
            let meta = entry.metadata();
            if !meta.mode().is_file() {
                continue;
            }
            let path = entry.path().trim_start_matches('/');
            if path.starts_with(prefix) {
                out.insert(path.to_string(), meta.content_length());
            }
        }
        Ok(out)
    }

    /// Upload an object with its integrity tag appended, returning the tag.
    pub async fn upload(&self, name: &str, mut data: Vec<u8>) -> CofferResult<String> {
        Self::check_name(name)?;
        let hash = blake3::hash(&data);
        let size = data.len();
        data.extend_from_slice(hash.as_bytes());
        let buf = Buffer::from(data);
        retry_storage(
            &self.policy,
            "upload",
            move || self.op.write(name, buf.clone()),
            |e| map_err(name, e),
        )
        .await?;
        let tag = hash.to_hex().to_string();
        debug!(object = name, size, blake3 = %tag, "uploaded");
        Ok(tag)
    }

    /// Download an object, verifying and stripping its integrity tag.
    pub async fn download(&self, name: &str) -> CofferResult<Vec<u8>> {
        let buf = retry_storage(
            &self.policy,
            "download",
            move || self.op.read(name),
            |e| map_err(name, e),
        )
        .await?;
        verify_trailer(name, buf.to_vec())
    }

    /// Delete an object. Deleting a missing object is not an error.
    pub async fn delete(&self, name: &str) -> CofferResult<()> {
        match retry_storage(
            &self.policy,
            "delete",
            move || self.op.delete(name),
            |e| map_err(name, e),
        )
        .await
        {
            Ok(()) | Err(CofferError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn exists(&self, name: &str) -> CofferResult<bool> {
        match retry_storage(
            &self.policy,
            "stat",
            move || self.op.stat(name),
            |e| map_err(name, e),
        )
        .await
        {
            Ok(_) => Ok(true),
            Err(CofferError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Copy through the client: download then upload.
    pub async fn copy(&self, from: &str, to: &str) -> CofferResult<()> {
        let data = self.download(from).await?;
        self.upload(to, data).await?;
        Ok(())
    }

    pub async fn rename(&self, from: &str, to: &str) -> CofferResult<()> {
        self.copy(from, to).await?;
        self.delete(from).await
    }

    /// Ping the backend with exponential backoff until it answers or the
    /// ceiling is reached.
    pub async fn wait_reachable(&self) -> CofferResult<()> {
        let mut delay_ms = self.policy.retry_delay_ms;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match crate::health::check_health(&self.op).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt > self.policy.max_retries => {
                    return Err(CofferError::Unreachable {
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    tracing::warn!(attempt, "storage not reachable yet: {e}");
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    delay_ms = delay_ms
                        .saturating_mul(2)
                        .min(self.policy.retry_max_delay_ms);
                }
            }
        }
    }
}
