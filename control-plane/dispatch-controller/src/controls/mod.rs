//! Idempotent Get/Create/Delete facades over the objects the reconcilers
//! drive. "Already exists" on create and "not found" on delete come back as
//! outcomes, not errors, so a half-applied pass can simply be run again.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, ServiceAccount};
use k8s_openapi::api::rbac::v1::RoleBinding;

use crate::crd::OwnedNamespace;

pub mod access_binding;
pub mod memory;
pub mod owned_namespace;
pub mod service_account;

pub use access_binding::{KubeAccessBindingControl, role_binding_for};
pub use memory::{Fault, MemoryCluster, Op};
pub use owned_namespace::KubeOwnedNamespaceControl;
pub use service_account::{KubeServiceAccountControl, service_account_for};

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGER_NAME: &str = "dispatch-controller";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome<T> {
    Created(T),
    AlreadyExists,
}

impl<T> CreateOutcome<T> {
    pub fn was_created(&self) -> bool {
        matches!(self, CreateOutcome::Created(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("api error {code} ({reason}): {message}")]
    Api {
        code: u16,
        reason: String,
        message: String,
    },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid request: {0}")]
    Invalid(String),
}

pub type ControlResult<T> = Result<T, ControlError>;

impl From<kube::Error> for ControlError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) => ControlError::Api {
                code: ae.code,
                reason: ae.reason,
                message: ae.message,
            },
            other => ControlError::Transport(other.to_string()),
        }
    }
}

impl ControlError {
    /// Whether another attempt could succeed without anything else changing.
    pub fn is_transient(&self) -> bool {
        match self {
            ControlError::Transport(_) => true,
            ControlError::Api { code, .. } => {
                matches!(code, 401 | 403 | 429) || *code >= 500
            }
            ControlError::Invalid(_) => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ControlError::Api { code: 409, .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ControlError::Api { code: 404, .. })
    }
}

/// Map an API create result, folding a 409 into `AlreadyExists`.
pub(crate) fn create_outcome<T>(
    res: Result<T, kube::Error>,
) -> ControlResult<CreateOutcome<T>> {
    match res.map_err(ControlError::from) {
        Ok(obj) => Ok(CreateOutcome::Created(obj)),
        Err(e) if e.is_conflict() => Ok(CreateOutcome::AlreadyExists),
        Err(e) => Err(e),
    }
}

/// Map an API delete result, folding a 404 into `NotFound`.
pub(crate) fn delete_outcome<T>(
    res: Result<T, kube::Error>,
) -> ControlResult<DeleteOutcome> {
    match res.map_err(ControlError::from) {
        Ok(_) => Ok(DeleteOutcome::Deleted),
        Err(e) if e.is_not_found() => Ok(DeleteOutcome::NotFound),
        Err(e) => Err(e),
    }
}

/// Tenant ServiceAccounts, one per user id, in the dispatch namespace.
#[async_trait]
pub trait ServiceAccountControl: Send + Sync {
    async fn get(&self, user_id: &str) -> ControlResult<Option<Arc<ServiceAccount>>>;
    async fn create(&self, user_id: &str) -> ControlResult<CreateOutcome<ServiceAccount>>;
    async fn delete(&self, user_id: &str) -> ControlResult<DeleteOutcome>;
}

/// Namespace claims, keyed by (owner, namespace).
#[async_trait]
pub trait OwnedNamespaceControl: Send + Sync {
    async fn list_for_owner(&self, owner: &str) -> ControlResult<Vec<Arc<OwnedNamespace>>>;
    async fn get(
        &self,
        owner: &str,
        namespace: &str,
    ) -> ControlResult<Option<Arc<OwnedNamespace>>>;
    async fn create(
        &self,
        owner: &str,
        namespace: &str,
    ) -> ControlResult<CreateOutcome<OwnedNamespace>>;
    async fn delete(&self, owner: &str, namespace: &str) -> ControlResult<DeleteOutcome>;
}

/// Isolation boundaries (namespaces) and the RoleBindings granting a tenant
/// access to them. Namespaces are never deleted through this control.
#[async_trait]
pub trait AccessBindingControl: Send + Sync {
    async fn get_namespace(&self, name: &str) -> ControlResult<Option<Namespace>>;
    async fn create_namespace(&self, name: &str) -> ControlResult<CreateOutcome<Namespace>>;
    async fn get_role_binding(
        &self,
        namespace: &str,
        name: &str,
    ) -> ControlResult<Option<RoleBinding>>;
    async fn create_role_binding(
        &self,
        binding: RoleBinding,
    ) -> ControlResult<CreateOutcome<RoleBinding>>;
    async fn delete_role_binding(
        &self,
        namespace: &str,
        name: &str,
    ) -> ControlResult<DeleteOutcome>;
}
