//! Key hierarchy: master key → name key + data key

use coffer_core::{CofferError, CofferResult};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::kdf::MasterKey;
use crate::KEY_SIZE;

/// Per-repository working keys. Zeroized on drop.
#[derive(Clone)]
pub struct KeyRing {
    name_key: [u8; KEY_SIZE],
    data_key: [u8; KEY_SIZE],
}

impl KeyRing {
    pub fn from_master(master: &MasterKey) -> CofferResult<Self> {
        Ok(Self {
            name_key: hkdf_derive(master.as_bytes(), b"coffer-names")?,
            data_key: hkdf_derive(master.as_bytes(), b"coffer-data")?,
        })
    }

    /// Build a ring from raw keys. Mostly useful in tests.
    pub fn from_keys(name_key: [u8; KEY_SIZE], data_key: [u8; KEY_SIZE]) -> Self {
        Self { name_key, data_key }
    }

    /// Key for AES-SIV object names
    pub fn name_key(&self) -> &[u8; KEY_SIZE] {
        &self.name_key
    }

    /// Key for AES-GCM payloads
    pub fn data_key(&self) -> &[u8; KEY_SIZE] {
        &self.data_key
    }
}

impl Drop for KeyRing {
    fn drop(&mut self) {
        self.name_key.zeroize();
        self.data_key.zeroize();
    }
}

impl std::fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRing")
            .field("name_key", &"[REDACTED]")
            .field("data_key", &"[REDACTED]")
            .finish()
    }
}

/// HKDF-SHA256 key derivation with a domain-specific info string.
fn hkdf_derive(ikm: &[u8; KEY_SIZE], info: &[u8]) -> CofferResult<[u8; KEY_SIZE]> {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(info, &mut okm)
        .map_err(|e| CofferError::Other(anyhow::anyhow!("HKDF expand failed: {e}")))?;
    Ok(okm)
}
