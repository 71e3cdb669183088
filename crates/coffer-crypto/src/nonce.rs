//! 96-bit AES-GCM nonces treated as big-endian counters
//!
//! Large files draw one random nonce and then step it by one per window, so
//! the windows of a file can be checked for order and completeness on restore.

use coffer_core::{CofferError, CofferResult};
use rand::RngCore;

use crate::NONCE_SIZE;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Nonce96([u8; NONCE_SIZE]);

impl Nonce96 {
    pub fn random() -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    /// The next nonce in sequence. Refuses to wrap past 2^96 - 1.
    pub fn increment(&self) -> CofferResult<Self> {
        let mut next = self.0;
        for byte in next.iter_mut().rev() {
            let (v, carry) = byte.overflowing_add(1);
            *byte = v;
            if !carry {
                return Ok(Self(next));
            }
        }
        Err(CofferError::NonceExhausted)
    }

    pub fn is_successor_of(&self, prev: &Nonce96) -> bool {
        prev.increment().map(|n| n == *self).unwrap_or(false)
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl std::fmt::Debug for Nonce96 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Nonce96({})", self.to_hex())
    }
}

impl std::fmt::Display for Nonce96 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}
