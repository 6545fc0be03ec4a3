use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use super::{ReconcileError, Reconciler, snapshot};
use crate::controls::{
    CreateOutcome, DeleteOutcome, OwnedNamespaceControl, ServiceAccountControl,
};
use crate::crd::DispatchUser;
use crate::dispatch::{EventAction, WorkItem};

/// Keeps a tenant's ServiceAccount and namespace claims in line with its
/// DispatchUser.
pub struct DispatchUserReconciler {
    service_accounts: Arc<dyn ServiceAccountControl>,
    claims: Arc<dyn OwnedNamespaceControl>,
}

impl DispatchUserReconciler {
    pub fn new(
        service_accounts: Arc<dyn ServiceAccountControl>,
        claims: Arc<dyn OwnedNamespaceControl>,
    ) -> Self {
        Self {
            service_accounts,
            claims,
        }
    }

    async fn ensure_service_account(&self, user_id: &str) -> Result<(), ReconcileError> {
        match self.service_accounts.create(user_id).await? {
            CreateOutcome::Created(_) => info!(user = %user_id, "created service account"),
            CreateOutcome::AlreadyExists => {
                debug!(user = %user_id, "service account already exists")
            }
        }
        Ok(())
    }

    /// Converge the owner's claims on `desired`, comparing against the claims
    /// that exist now rather than any earlier declared set.
    async fn sync_namespaces(
        &self,
        user_id: &str,
        desired: &BTreeSet<String>,
    ) -> Result<(), ReconcileError> {
        let current: BTreeSet<String> = self
            .claims
            .list_for_owner(user_id)
            .await?
            .iter()
            .map(|c| c.spec.namespace.clone())
            .collect();

        for ns in current.difference(desired) {
            if self.claims.delete(user_id, ns).await? == DeleteOutcome::Deleted {
                info!(user = %user_id, namespace = %ns, "released namespace claim");
            }
        }
        for ns in desired.difference(&current) {
            if self.claims.create(user_id, ns).await?.was_created() {
                info!(user = %user_id, namespace = %ns, "claimed namespace");
            }
        }
        Ok(())
    }

    /// Remove the account and every claim, whether it is already listed or
    /// only declared by the final snapshot.
    async fn teardown(
        &self,
        user_id: &str,
        declared: BTreeSet<String>,
    ) -> Result<(), ReconcileError> {
        if self.service_accounts.delete(user_id).await? == DeleteOutcome::Deleted {
            info!(user = %user_id, "deleted service account");
        }
        let mut doomed = declared;
        doomed.extend(
            self.claims
                .list_for_owner(user_id)
                .await?
                .iter()
                .map(|c| c.spec.namespace.clone()),
        );
        for ns in &doomed {
            if self.claims.delete(user_id, ns).await? == DeleteOutcome::Deleted {
                info!(user = %user_id, namespace = %ns, "released namespace claim");
            }
        }
        Ok(())
    }
}

fn user_id(user: &DispatchUser) -> Result<&str, ReconcileError> {
    let id = user.spec.user_id.trim();
    if id.is_empty() {
        return Err(ReconcileError::InvalidSpec("userID is empty".into()));
    }
    Ok(id)
}

#[async_trait]
impl Reconciler for DispatchUserReconciler {
    type Resource = DispatchUser;

    #[instrument(level = "debug", skip_all, fields(key = %item.key, action = %item.action))]
    async fn reconcile(&self, item: &WorkItem<DispatchUser>) -> Result<(), ReconcileError> {
        let user = snapshot(item)?;
        let id = user_id(user)?;
        match item.action {
            EventAction::Add => {
                self.ensure_service_account(id).await?;
                self.sync_namespaces(id, &user.spec.declared_namespaces())
                    .await
            }
            EventAction::Update => {
                if let Some(old) = item.old.as_deref() {
                    if old.spec.user_id.trim() != id {
                        return Err(ReconcileError::InvalidSpec(format!(
                            "userID is immutable (was {:?}, now {:?})",
                            old.spec.user_id, id
                        )));
                    }
                }
                self.sync_namespaces(id, &user.spec.declared_namespaces())
                    .await
            }
            EventAction::Delete => {
                self.teardown(id, user.spec.declared_namespaces()).await
            }
        }
    }
}
