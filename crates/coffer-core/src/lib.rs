pub mod config;
pub mod error;
pub mod types;

pub use error::{CofferError, CofferResult};

/// Hard ceiling on object names accepted by the storage backend, in bytes.
pub const MAX_OBJECT_NAME_LEN: usize = 320;
