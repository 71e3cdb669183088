//! coffer-crypto: client-side encryption for coffer
//!
//! Nothing leaves the machine in plaintext: object names are sealed with
//! deterministic AES-256-SIV so they stay addressable, and every payload is
//! sealed with AES-256-GCM.
//!
//! Key hierarchy:
//! ```text
//! Master Key (256-bit, Argon2id from password + repository salt)
//!   ├── Name Key (HKDF, domain="coffer-names")  → AES-256-SIV, zero nonce
//!   └── Data Key (HKDF, domain="coffer-data")   → AES-256-GCM, 96-bit nonce
//! ```
//!
//! Buffer format: `[12-byte nonce][ciphertext][16-byte tag]`

pub mod buffer;
pub mod kdf;
pub mod keys;
pub mod names;
pub mod nonce;

pub use buffer::{decrypt_buffer, decrypt_buffer_returning_nonce, encrypt_buffer, encrypt_buffer_with_nonce};
pub use kdf::{derive_key, generate_salt, KdfParams, MasterKey};
pub use keys::KeyRing;
pub use names::{decrypt_name, encrypt_name};
pub use nonce::Nonce96;

/// Size of a symmetric key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an AES-GCM nonce (96-bit)
pub const NONCE_SIZE: usize = 12;

/// Size of a GCM authentication tag
pub const TAG_SIZE: usize = 16;

/// Argon2 refuses shorter salts
pub const MIN_SALT_LEN: usize = 8;
