use std::time::Duration;

use envconfig::Envconfig;
use k8s_openapi::api::rbac::v1::RoleRef;

pub const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error(
        "retry base delay ({base_ms}ms) exceeds the max delay ({max_ms}ms)"
    )]
    BackoffRange { base_ms: u64, max_ms: u64 },
    #[error("{0} must not be empty")]
    Empty(&'static str),
}

#[derive(Envconfig, Clone, Debug)]
pub struct DispatchConfig {
    /// Namespace holding DispatchUser, OwnedNamespace and the tenant
    /// ServiceAccounts.
    /// Env: DISPATCH_NAMESPACE
    #[envconfig(from = "DISPATCH_NAMESPACE", default = "dispatch")]
    pub namespace: String,

    /// Kind of the role granted to a tenant in each claimed namespace.
    /// Env: DISPATCH_ROLE_KIND (ClusterRole | Role)
    #[envconfig(from = "DISPATCH_ROLE_KIND", default = "ClusterRole")]
    pub role_kind: String,

    /// Env: DISPATCH_ROLE_NAME
    #[envconfig(from = "DISPATCH_ROLE_NAME", default = "edit")]
    pub role_name: String,

    #[envconfig(from = "DISPATCH_USER_WORKERS", default = "1")]
    pub user_workers: usize,

    #[envconfig(from = "DISPATCH_CLAIM_WORKERS", default = "1")]
    pub claim_workers: usize,

    /// Bound on pending work items per controller. A full queue blocks the
    /// watch stream instead of dropping notifications.
    /// Env: DISPATCH_QUEUE_CAPACITY
    #[envconfig(from = "DISPATCH_QUEUE_CAPACITY", default = "100")]
    pub queue_capacity: usize,

    #[envconfig(nested)]
    pub retry: RetryConfig,
}

#[derive(Envconfig, Clone, Debug)]
pub struct RetryConfig {
    /// Retries after the first failed attempt; the item is dropped once
    /// exhausted.
    /// Env: DISPATCH_RETRY_MAX
    #[envconfig(from = "DISPATCH_RETRY_MAX", default = "5")]
    pub max_retries: u32,

    #[envconfig(from = "DISPATCH_RETRY_BASE_MS", default = "500")]
    pub base_delay_ms: u64,

    #[envconfig(from = "DISPATCH_RETRY_MAX_MS", default = "30000")]
    pub max_delay_ms: u64,
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl DispatchConfig {
    pub fn role_ref(&self) -> RoleRef {
        RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: self.role_kind.clone(),
            name: self.role_name.clone(),
        }
    }

    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.namespace.is_empty() {
            return Err(ConfigError::Empty("DISPATCH_NAMESPACE"));
        }
        if self.role_name.is_empty() {
            return Err(ConfigError::Empty("DISPATCH_ROLE_NAME"));
        }
        if self.user_workers == 0 {
            return Err(ConfigError::Zero("DISPATCH_USER_WORKERS"));
        }
        if self.claim_workers == 0 {
            return Err(ConfigError::Zero("DISPATCH_CLAIM_WORKERS"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Zero("DISPATCH_QUEUE_CAPACITY"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::BackoffRange {
                base_ms: self.retry.base_delay_ms,
                max_ms: self.retry.max_delay_ms,
            });
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> DispatchConfig {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        DispatchConfig::init_from_hashmap(&env).expect("parse config")
    }

    #[test]
    fn defaults_match_the_dispatch_namespace_and_edit_role() {
        let cfg = from_pairs(&[]).validate().unwrap();
        assert_eq!(cfg.namespace, "dispatch");
        assert_eq!(cfg.user_workers, 1);
        assert_eq!(cfg.claim_workers, 1);
        assert_eq!(cfg.queue_capacity, 100);
        assert_eq!(cfg.retry.max_retries, 5);
        assert_eq!(cfg.retry.base_delay(), Duration::from_millis(500));
        assert_eq!(cfg.retry.max_delay(), Duration::from_secs(30));

        let role = cfg.role_ref();
        assert_eq!(role.api_group, RBAC_API_GROUP);
        assert_eq!(role.kind, "ClusterRole");
        assert_eq!(role.name, "edit");
    }

    #[test]
    fn env_overrides_apply() {
        let cfg = from_pairs(&[
            ("DISPATCH_NAMESPACE", "tenants"),
            ("DISPATCH_ROLE_KIND", "Role"),
            ("DISPATCH_ROLE_NAME", "tenant-admin"),
            ("DISPATCH_USER_WORKERS", "4"),
            ("DISPATCH_RETRY_MAX", "2"),
        ])
        .validate()
        .unwrap();
        assert_eq!(cfg.namespace, "tenants");
        assert_eq!(cfg.user_workers, 4);
        assert_eq!(cfg.retry.max_retries, 2);
        assert_eq!(cfg.role_ref().kind, "Role");
        assert_eq!(cfg.role_ref().name, "tenant-admin");
    }

    #[test]
    fn validate_rejects_zero_workers_and_capacity() {
        let err = from_pairs(&[("DISPATCH_CLAIM_WORKERS", "0")])
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Zero("DISPATCH_CLAIM_WORKERS")));

        let err = from_pairs(&[("DISPATCH_QUEUE_CAPACITY", "0")])
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Zero("DISPATCH_QUEUE_CAPACITY")));
    }

    #[test]
    fn validate_rejects_inverted_backoff_range() {
        let err = from_pairs(&[
            ("DISPATCH_RETRY_BASE_MS", "5000"),
            ("DISPATCH_RETRY_MAX_MS", "100"),
        ])
        .validate()
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::BackoffRange {
                base_ms: 5000,
                max_ms: 100
            }
        ));
    }
}
