//! coffer-storage: OpenDAL object storage facade
//!
//! Everything above this crate talks to [`ObjectStore`], never to an
//! `opendal::Operator` directly: it enforces the object-name ceiling, maps
//! backend errors into the coffer taxonomy and retries transient failures.

pub mod health;
pub mod operator;
pub mod retry;
pub mod store;

pub use health::{check_health, is_healthy};
pub use operator::{build_from_core_config, build_operator, memory_operator, Credentials};
pub use retry::RetryPolicy;
pub use store::ObjectStore;
