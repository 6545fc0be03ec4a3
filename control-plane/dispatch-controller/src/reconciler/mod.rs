use std::sync::Arc;

use async_trait::async_trait;

use crate::controls::ControlError;
use crate::dispatch::{EventAction, WorkItem};

mod dispatch_user;
mod owned_namespace;

pub use dispatch_user::DispatchUserReconciler;
pub use owned_namespace::OwnedNamespaceReconciler;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error("invalid spec: {0}")]
    InvalidSpec(String),
    #[error("malformed work item: {0}")]
    Malformed(String),
}

impl ReconcileError {
    /// Only transient control-plane failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReconcileError::Control(e) => e.is_transient(),
            ReconcileError::InvalidSpec(_) | ReconcileError::Malformed(_) => false,
        }
    }
}

/// Drives the cluster toward the state one work item describes. Must be safe
/// to call again with the same item after a partial failure.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    type Resource: Send + Sync + 'static;

    async fn reconcile(&self, item: &WorkItem<Self::Resource>) -> Result<(), ReconcileError>;
}

/// The snapshot an action needs: `new` for add/update, `old` for delete.
fn snapshot<K>(item: &WorkItem<K>) -> Result<&Arc<K>, ReconcileError> {
    let snap = match item.action {
        EventAction::Add | EventAction::Update => item.new.as_ref(),
        EventAction::Delete => item.old.as_ref(),
    };
    snap.ok_or_else(|| {
        ReconcileError::Malformed(format!("{} of {} carries no snapshot", item.action, item.key))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ObjectKey;

    #[test]
    fn only_transient_control_errors_are_retryable() {
        let transient = ReconcileError::from(ControlError::Transport("reset".into()));
        let rejected = ReconcileError::from(ControlError::Api {
            code: 422,
            reason: "Invalid".into(),
            message: "bad".into(),
        });
        assert!(transient.is_retryable());
        assert!(!rejected.is_retryable());
        assert!(!ReconcileError::InvalidSpec("x".into()).is_retryable());
        assert!(!ReconcileError::Malformed("x".into()).is_retryable());
    }

    #[test]
    fn delete_without_old_snapshot_is_malformed() {
        let item: WorkItem<()> = WorkItem {
            action: EventAction::Delete,
            key: ObjectKey::namespaced("dispatch", "alice"),
            old: None,
            new: Some(Arc::new(())),
        };
        let err = snapshot(&item).unwrap_err();
        assert!(matches!(err, ReconcileError::Malformed(_)));
        assert!(err.to_string().contains("delete of dispatch/alice"));
    }
}
