use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CofferError, CofferResult};

const MIB: u64 = 1024 * 1024;

/// Top-level configuration (loaded from coffer.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CofferConfig {
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
    pub crypto: CryptoConfig,
    pub engine: EngineConfig,
    pub cache: CacheConfig,
    pub restore: RestoreConfig,
}

impl CofferConfig {
    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> CofferResult<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents)
            .map_err(|e| CofferError::Config(format!("{}: {e}", path.display())))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend kind: "s3", "fs" or "memory"
    pub backend: String,
    /// S3 endpoint
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    /// Bucket name
    pub bucket: String,
    /// Root prefix inside the bucket, or the directory for the fs backend
    pub root: String,
    /// Refuse plain-HTTP endpoints
    pub enforce_tls: bool,
    /// Retry ceiling for unreachable storage
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "s3".into(),
            endpoint: "http://localhost:9000".into(),
            region: "us-east-1".into(),
            bucket: "coffer".into(),
            root: "/".into(),
            enforce_tls: false,
            max_retries: 5,
            retry_delay_ms: 500,
            retry_max_delay_ms: 30_000,
        }
    }
}

/// Argon2id parameters for the repository password
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Iterations (default: 10)
    pub time_cost: u32,
    /// Memory cost in KiB (default: 262144 = 256 MiB)
    pub mem_cost_kib: u32,
    /// Lanes (default: 4)
    pub parallelism: u32,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            time_cost: 10,
            mem_cost_kib: 262_144,
            parallelism: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Durable journal/state file
    pub state_path: PathBuf,
    /// Upper bound of a packed chunk, in bytes
    pub chunk_size: u64,
    /// Files at or above this size are uploaded as windowed objects
    pub large_file_threshold: u64,
    /// Window size for large files
    pub window_size: u64,
    /// Sleep between journal loop iterations
    pub loop_yield_ms: u64,
    /// Opportunistic checkpoint interval during uploads
    pub checkpoint_min_secs: u64,
    /// Forced checkpoint interval
    pub checkpoint_max_secs: u64,
    /// Glob patterns to exclude from backups
    pub exclude_patterns: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("~/.local/share/coffer/state.json"),
            chunk_size: 128 * MIB,
            large_file_threshold: 128 * MIB,
            window_size: 128 * MIB,
            loop_yield_ms: 1,
            checkpoint_min_secs: 30,
            checkpoint_max_secs: 300,
            exclude_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Chunk cache directory
    pub dir: PathBuf,
    /// Maximum cache size in MB
    pub max_mb: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("~/.cache/coffer/chunks"),
            max_mb: 768,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    /// Fail a large file whose window nonces are not consecutive
    pub strict_nonce_order: bool,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            strict_nonce_order: true,
        }
    }
}

/// Expand a leading `~/` to `$HOME`.
pub fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}
