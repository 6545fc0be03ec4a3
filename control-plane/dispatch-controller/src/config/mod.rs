mod types;

pub use types::{ConfigError, DispatchConfig, RBAC_API_GROUP, RetryConfig};
