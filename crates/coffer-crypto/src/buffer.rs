//! AES-256-GCM buffer sealing
//!
//! Sealed buffer format (binary):
//! ```text
//! [12 bytes: nonce][N bytes: ciphertext][16 bytes: GCM tag]
//! ```

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use coffer_core::{CofferError, CofferResult};

use crate::nonce::Nonce96;
use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// Seal `plaintext` under a fresh random nonce.
pub fn encrypt_buffer(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> CofferResult<Vec<u8>> {
    encrypt_buffer_with_nonce(key, plaintext, &Nonce96::random())
}

/// Seal `plaintext` under a caller-chosen nonce.
///
/// Only for the windows of a large file, where the caller steps one random
/// nonce per window. The nonce is still prepended to the output.
pub fn encrypt_buffer_with_nonce(
    key: &[u8; KEY_SIZE],
    plaintext: &[u8],
    nonce: &Nonce96,
) -> CofferResult<Vec<u8>> {
    let cipher = Aes256Gcm::new(key.into());
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(nonce.as_bytes()), plaintext)
        .map_err(|e| CofferError::Other(anyhow::anyhow!("buffer encryption failed: {e}")))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(nonce.as_bytes());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn decrypt_buffer(key: &[u8; KEY_SIZE], sealed: &[u8]) -> CofferResult<Vec<u8>> {
    decrypt_buffer_returning_nonce(key, sealed).map(|(pt, _)| pt)
}

/// Open a sealed buffer and hand back the nonce it was sealed under.
pub fn decrypt_buffer_returning_nonce(
    key: &[u8; KEY_SIZE],
    sealed: &[u8],
) -> CofferResult<(Vec<u8>, Nonce96)> {
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CofferError::DecryptFailed);
    }

    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(nonce_bytes);

    let cipher = Aes256Gcm::new(key.into());
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CofferError::DecryptFailed)?;

    Ok((plaintext, Nonce96::from_bytes(nonce)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const KEY: [u8; KEY_SIZE] = [0x42; KEY_SIZE];

    #[test]
    fn test_encrypt_decrypt_empty() {
        let sealed = encrypt_buffer(&KEY, b"").unwrap();
        assert_eq!(sealed.len(), NONCE_SIZE + TAG_SIZE);
        assert_eq!(decrypt_buffer(&KEY, &sealed).unwrap(), b"");
    }

    #[test]
    fn test_random_nonce_per_call() {
        let a = encrypt_buffer(&KEY, b"same input").unwrap();
        let b = encrypt_buffer(&KEY, b"same input").unwrap();
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_with_nonce_is_prepended_and_returned() {
        let nonce = Nonce96::from_bytes([7u8; NONCE_SIZE]);
        let sealed = encrypt_buffer_with_nonce(&KEY, b"window", &nonce).unwrap();
        assert_eq!(&sealed[..NONCE_SIZE], nonce.as_bytes());

        let (pt, got) = decrypt_buffer_returning_nonce(&KEY, &sealed).unwrap();
        assert_eq!(pt, b"window");
        assert_eq!(got, nonce);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = encrypt_buffer(&KEY, b"secret").unwrap();
        let other = [0x24u8; KEY_SIZE];
        assert!(matches!(
            decrypt_buffer(&other, &sealed),
            Err(CofferError::DecryptFailed)
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let mut sealed = encrypt_buffer(&KEY, b"secret data").unwrap();
        sealed[NONCE_SIZE + 1] ^= 0xFF;
        assert!(matches!(
            decrypt_buffer(&KEY, &sealed),
            Err(CofferError::DecryptFailed)
        ));
    }

    #[test]
    fn test_truncated_input_fails() {
        assert!(matches!(
            decrypt_buffer(&KEY, &[0u8; 10]),
            Err(CofferError::DecryptFailed)
        ));
    }

    proptest! {
        #[test]
        fn buffer_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..=4096)) {
            let sealed = encrypt_buffer(&KEY, &data).unwrap();
            prop_assert_eq!(sealed.len(), NONCE_SIZE + data.len() + TAG_SIZE);
            prop_assert_eq!(decrypt_buffer(&KEY, &sealed).unwrap(), data);
        }
    }
}
