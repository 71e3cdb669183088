//! Repository bootstrap: the salt marker and password check
//!
//! A repository carries exactly one `SALT-<hex>` object. Its body is a fixed
//! placeholder sealed under the data key, so opening with the wrong password
//! fails with `DecryptFailed` before anything else is touched.

use coffer_core::{CofferError, CofferResult};
use coffer_crypto::{decrypt_buffer, derive_key, encrypt_buffer, generate_salt, KdfParams, KeyRing};
use coffer_storage::ObjectStore;
use secrecy::SecretString;
use tracing::info;

use crate::layout::SALT_PREFIX;

const PLACEHOLDER: &[u8] = b"coffer-salt-v1";

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn from_hex(s: &str) -> CofferResult<Vec<u8>> {
    let bad = || CofferError::Config(format!("malformed salt marker {SALT_PREFIX}{s}"));
    if s.len() % 2 != 0 {
        return Err(bad());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| bad()))
        .collect()
}

/// Open the repository behind `store`, creating its salt marker on first use.
pub async fn open_or_init(
    store: &ObjectStore,
    password: &SecretString,
    params: &KdfParams,
) -> CofferResult<KeyRing> {
    let markers: Vec<String> = store.list(SALT_PREFIX).await?.into_keys().collect();
    match markers.as_slice() {
        [] => init(store, password, params).await,
        [marker] => {
            let salt = from_hex(&marker[SALT_PREFIX.len()..])?;
            let keys = KeyRing::from_master(&derive_key(&salt, password, params)?)?;
            let sealed = store.download(marker).await?;
            if decrypt_buffer(keys.data_key(), &sealed)? != PLACEHOLDER {
                return Err(CofferError::DecryptFailed);
            }
            Ok(keys)
        }
        many => Err(CofferError::Config(format!(
            "repository has {} salt markers",
            many.len()
        ))),
    }
}

async fn init(store: &ObjectStore, password: &SecretString, params: &KdfParams) -> CofferResult<KeyRing> {
    let salt = generate_salt();
    let keys = KeyRing::from_master(&derive_key(&salt, password, params)?)?;
    let marker = format!("{SALT_PREFIX}{}", to_hex(&salt));
    store
        .upload(&marker, encrypt_buffer(keys.data_key(), PLACEHOLDER)?)
        .await?;
    info!(marker = %marker, "repository initialised");
    Ok(keys)
}
