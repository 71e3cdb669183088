//! OpenDAL Operator factory for coffer storage backends

use anyhow::{Context, Result};
use coffer_core::config::StorageConfig;
use opendal::Operator;

/// S3 credentials, loaded from the environment by the caller
#[derive(Clone)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl Credentials {
    /// `AWS_*` first, then the `COFFER_*` variants
    pub fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .or_else(|_| std::env::var("COFFER_ACCESS_KEY_ID"))
            .context(
                "S3 credentials not set\n\
                 Set AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY environment variables.",
            )?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .or_else(|_| std::env::var("COFFER_SECRET_ACCESS_KEY"))
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        Ok(Self {
            access_key_id,
            secret_access_key,
        })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .finish()
    }
}

/// Build an OpenDAL Operator for any S3-compatible endpoint.
///
/// Path-style addressing (the opendal 0.55 default) is what MinIO and
/// SeaweedFS expect, so virtual-host style is never enabled.
pub fn build_operator(storage: &StorageConfig, creds: &Credentials) -> Result<Operator> {
    let builder = opendal::services::S3::default()
        .endpoint(&storage.endpoint)
        .region(&storage.region)
        .bucket(&storage.bucket)
        .root(&storage.root)
        .access_key_id(&creds.access_key_id)
        .secret_access_key(&creds.secret_access_key);

    let op = Operator::new(builder)
        .context("creating OpenDAL S3 operator")?
        .layer(opendal::layers::LoggingLayer::default())
        .layer(request_retry_layer())
        .finish();
    Ok(op)
}

fn build_fs_operator(root: &str) -> Result<Operator> {
    let builder = opendal::services::Fs::default().root(root);
    let op = Operator::new(builder)
        .context("creating OpenDAL fs operator")?
        .layer(opendal::layers::LoggingLayer::default())
        .finish();
    Ok(op)
}

/// In-process backend for tests and dry runs
pub fn memory_operator() -> Result<Operator> {
    let op = Operator::new(opendal::services::Memory::default())
        .context("creating OpenDAL memory operator")?
        .finish();
    Ok(op)
}

/// Request-level retries inside OpenDAL. Reachability retries with the
/// configured ceiling live in [`crate::retry`].
fn request_retry_layer() -> opendal::layers::RetryLayer {
    opendal::layers::RetryLayer::new()
        .with_max_times(2)
        .with_jitter()
}

/// Build an operator from the `[storage]` section.
///
/// If `enforce_tls` is true and an S3 endpoint uses HTTP, this returns an
/// error. Otherwise a warning is logged for non-HTTPS endpoints.
pub fn build_from_core_config(
    storage: &StorageConfig,
    creds: Option<&Credentials>,
) -> Result<Operator> {
    match storage.backend.as_str() {
        "s3" => {
            if storage.endpoint.starts_with("http://") {
                if storage.enforce_tls {
                    anyhow::bail!(
                        "S3 endpoint uses plaintext HTTP ({}), but enforce_tls is enabled. \
                         Use an HTTPS endpoint or set storage.enforce_tls = false for local development.",
                        storage.endpoint
                    );
                }
                tracing::warn!(
                    endpoint = %storage.endpoint,
                    "S3 endpoint uses plaintext HTTP: credentials are transmitted unencrypted"
                );
            }
            let creds = creds.context("S3 backend requires credentials")?;
            build_operator(storage, creds)
        }
        "fs" => build_fs_operator(&storage.root),
        "memory" => memory_operator(),
        other => anyhow::bail!("unknown storage backend: {other} (expected s3, fs or memory)"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials {
            access_key_id: "test-key".into(),
            secret_access_key: "test-secret".into(),
        }
    }

    #[test]
    fn test_build_operator_valid() {
        let storage = StorageConfig::default();
        assert!(build_operator(&storage, &creds()).is_ok());
    }

    #[test]
    fn test_http_enforce_tls_rejected() {
        let storage = StorageConfig {
            endpoint: "http://insecure:9000".into(),
            enforce_tls: true,
            ..Default::default()
        };
        let err = build_from_core_config(&storage, Some(&creds())).unwrap_err();
        assert!(err.to_string().contains("enforce_tls"));
    }

    #[test]
    fn test_https_enforce_tls_ok() {
        let storage = StorageConfig {
            endpoint: "https://s3.example.com".into(),
            enforce_tls: true,
            ..Default::default()
        };
        assert!(build_from_core_config(&storage, Some(&creds())).is_ok());
    }

    #[test]
    fn test_s3_without_credentials_rejected() {
        let storage = StorageConfig::default();
        assert!(build_from_core_config(&storage, None).is_err());
    }

    #[test]
    fn test_fs_backend() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageConfig {
            backend: "fs".into(),
            root: dir.path().to_string_lossy().into_owned(),
            ..Default::default()
        };
        assert!(build_from_core_config(&storage, None).is_ok());
    }

    #[test]
    fn test_unknown_backend() {
        let storage = StorageConfig {
            backend: "ftp".into(),
            ..Default::default()
        };
        let err = build_from_core_config(&storage, None).unwrap_err();
        assert!(err.to_string().contains("unknown storage backend"));
    }

    #[test]
    fn test_credentials_debug_redacted() {
        let dbg = format!("{:?}", creds());
        assert!(dbg.contains("REDACTED"));
        assert!(!dbg.contains("test-secret"));
    }
}
