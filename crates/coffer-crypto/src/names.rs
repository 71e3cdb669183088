//! AES-SIV name encryption
//!
//! Object names must be predictable so that a path maps to the same remote
//! key on every run. AES-SIV with a fixed nonce gives deterministic,
//! authenticated ciphertext. Names are zstd-compressed first and the
//! ciphertext is rendered as URL-safe base64 without padding.

use aes_siv::{
    aead::{Aead, KeyInit},
    Aes256SivAead, Nonce,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use coffer_core::{CofferError, CofferResult};

use crate::KEY_SIZE;

/// AES-256-SIV wants a 64-byte key; expand the 32-byte name key with HKDF.
fn siv_cipher(name_key: &[u8; KEY_SIZE]) -> CofferResult<Aes256SivAead> {
    let mut double_key = [0u8; 64];
    let hkdf = hkdf::Hkdf::<sha2::Sha256>::new(None, name_key);
    hkdf.expand(b"coffer-name-aes-siv", &mut double_key)
        .map_err(|e| CofferError::Other(anyhow::anyhow!("HKDF expand for AES-SIV: {e}")))?;
    let cipher = Aes256SivAead::new((&double_key).into());
    zeroize::Zeroize::zeroize(&mut double_key);
    Ok(cipher)
}

/// Encrypt a name. The same key and name always yield the same token.
pub fn encrypt_name(name_key: &[u8; KEY_SIZE], plaintext_name: &str) -> CofferResult<String> {
    let compressed = zstd::encode_all(plaintext_name.as_bytes(), 0)?;
    let ciphertext = siv_cipher(name_key)?
        .encrypt(&Nonce::default(), compressed.as_ref())
        .map_err(|e| CofferError::Other(anyhow::anyhow!("name encryption failed: {e}")))?;
    Ok(URL_SAFE_NO_PAD.encode(ciphertext))
}

/// Exact inverse of [`encrypt_name`]. Any malformed or forged token is
/// reported as `DecryptFailed`.
pub fn decrypt_name(name_key: &[u8; KEY_SIZE], token: &str) -> CofferResult<String> {
    let ciphertext = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|_| CofferError::DecryptFailed)?;
    let compressed = siv_cipher(name_key)?
        .decrypt(&Nonce::default(), ciphertext.as_ref())
        .map_err(|_| CofferError::DecryptFailed)?;
    let plaintext = zstd::decode_all(compressed.as_slice()).map_err(|_| CofferError::DecryptFailed)?;
    String::from_utf8(plaintext).map_err(|_| CofferError::DecryptFailed)
}
