use thiserror::Error;

pub type CofferResult<T> = Result<T, CofferError>;

#[derive(Debug, Error)]
pub enum CofferError {
    /// AEAD authentication failed: wrong key or tampered ciphertext.
    #[error("decryption failed: wrong key or corrupted data")]
    DecryptFailed,

    #[error("bad salt: {0} bytes (minimum 8)")]
    BadSalt(usize),

    /// The journal has no unstarted task left. A drain signal, not a failure.
    #[error("no journal work available")]
    NoWorkAvailable,

    #[error("object name too long: {len} bytes (limit {limit})")]
    ObjectTooLong { len: usize, limit: usize },

    #[error("storage unreachable after {attempts} attempts: {reason}")]
    Unreachable { attempts: u32, reason: String },

    #[error("journal invariant violated: {0}")]
    JournalInvariantViolation(String),

    #[error("nonce sequence violation in {object}: expected {expected}, found {found}")]
    NonceSequence {
        object: String,
        expected: String,
        found: String,
    },

    #[error("nonce space exhausted")]
    NonceExhausted,

    #[error("busy: {0} already running")]
    Busy(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CofferError {
    /// Whether the error should abort a whole run rather than a single task.
    pub fn is_fatal_for_run(&self) -> bool {
        matches!(
            self,
            CofferError::Unreachable { .. }
                | CofferError::JournalInvariantViolation(_)
                | CofferError::Cancelled
                | CofferError::Config(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_object_too_long() {
        let err = CofferError::ObjectTooLong {
            len: 400,
            limit: 320,
        };
        assert_eq!(err.to_string(), "object name too long: 400 bytes (limit 320)");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(CofferError::Unreachable {
            attempts: 3,
            reason: "timeout".into()
        }
        .is_fatal_for_run());
        assert!(!CofferError::DecryptFailed.is_fatal_for_run());
        assert!(!CofferError::ObjectTooLong { len: 1, limit: 0 }.is_fatal_for_run());
    }

    #[test]
    fn test_anyhow_passthrough() {
        let err: CofferError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, CofferError::Other(_)));
        assert_eq!(err.to_string(), "boom");
    }
}
