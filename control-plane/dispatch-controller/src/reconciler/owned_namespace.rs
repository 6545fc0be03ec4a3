use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::rbac::v1::RoleRef;
use tracing::{debug, info, instrument};

use super::{ReconcileError, Reconciler, snapshot};
use crate::controls::{AccessBindingControl, CreateOutcome, DeleteOutcome, role_binding_for};
use crate::crd::{OwnedNamespace, claim_name};
use crate::dispatch::{EventAction, WorkItem};

/// Gives a claim's owner access to the claimed namespace, creating the
/// namespace on first use. Namespaces are never deleted here.
pub struct OwnedNamespaceReconciler {
    access: Arc<dyn AccessBindingControl>,
    account_namespace: String,
    role_ref: RoleRef,
}

impl OwnedNamespaceReconciler {
    pub fn new(
        access: Arc<dyn AccessBindingControl>,
        account_namespace: &str,
        role_ref: RoleRef,
    ) -> Self {
        Self {
            access,
            account_namespace: account_namespace.to_string(),
            role_ref,
        }
    }

    async fn grant(&self, owner: &str, namespace: &str) -> Result<(), ReconcileError> {
        if self.access.get_namespace(namespace).await?.is_none() {
            match self.access.create_namespace(namespace).await? {
                CreateOutcome::Created(_) => info!(%namespace, "created namespace"),
                CreateOutcome::AlreadyExists => debug!(%namespace, "namespace appeared concurrently"),
            }
        }
        let binding = role_binding_for(owner, namespace, &self.account_namespace, &self.role_ref);
        if self.access.create_role_binding(binding).await?.was_created() {
            info!(%owner, %namespace, role = %self.role_ref.name, "bound role");
        }
        Ok(())
    }

    async fn revoke(&self, owner: &str, namespace: &str) -> Result<(), ReconcileError> {
        let name = claim_name(owner, namespace);
        match self.access.delete_role_binding(namespace, &name).await? {
            DeleteOutcome::Deleted => info!(%owner, %namespace, "removed role binding"),
            DeleteOutcome::NotFound => debug!(%owner, %namespace, "role binding already gone"),
        }
        Ok(())
    }
}

fn claim_target(claim: &OwnedNamespace) -> Result<(&str, &str), ReconcileError> {
    let owner = claim.spec.owner_id.trim();
    let namespace = claim.spec.namespace.trim();
    if owner.is_empty() || namespace.is_empty() {
        return Err(ReconcileError::InvalidSpec(format!(
            "claim needs ownerID and namespace (got {:?}, {:?})",
            claim.spec.owner_id, claim.spec.namespace
        )));
    }
    Ok((owner, namespace))
}

#[async_trait]
impl Reconciler for OwnedNamespaceReconciler {
    type Resource = OwnedNamespace;

    #[instrument(level = "debug", skip_all, fields(key = %item.key, action = %item.action))]
    async fn reconcile(&self, item: &WorkItem<OwnedNamespace>) -> Result<(), ReconcileError> {
        let claim = snapshot(item)?;
        match item.action {
            EventAction::Add => {
                let (owner, namespace) = claim_target(claim)?;
                self.grant(owner, namespace).await
            }
            // Claims do not change once written.
            EventAction::Update => Ok(()),
            EventAction::Delete => {
                let (owner, namespace) = claim_target(claim)?;
                self.revoke(owner, namespace).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::controls::{Fault, MemoryCluster, Op};

    fn edit_role() -> RoleRef {
        RoleRef {
            api_group: "rbac.authorization.k8s.io".into(),
            kind: "ClusterRole".into(),
            name: "edit".into(),
        }
    }

    fn claim(owner: &str, namespace: &str) -> Arc<OwnedNamespace> {
        Arc::new(OwnedNamespace::for_owner("dispatch", owner, namespace))
    }

    fn reconciler(cluster: &MemoryCluster) -> OwnedNamespaceReconciler {
        OwnedNamespaceReconciler::new(Arc::new(cluster.clone()), "dispatch", edit_role())
    }

    #[tokio::test]
    async fn add_creates_namespace_then_binding() {
        let cluster = MemoryCluster::new("dispatch");
        let r = reconciler(&cluster);

        r.reconcile(&WorkItem::add(claim("alice", "team-a"))).await.unwrap();

        assert_eq!(cluster.namespaces().await, BTreeSet::from(["team-a".to_string()]));
        assert_eq!(
            cluster.role_bindings().await,
            BTreeSet::from([("team-a".to_string(), "alice.team-a".to_string())])
        );
        let rb = cluster
            .get_role_binding("team-a", "alice.team-a")
            .await
            .unwrap()
            .unwrap();
        let subject = &rb.subjects.unwrap()[0];
        assert_eq!(subject.name, "alice");
        assert_eq!(subject.namespace.as_deref(), Some("dispatch"));
    }

    #[tokio::test]
    async fn existing_namespace_is_reused() {
        let cluster = MemoryCluster::new("dispatch");
        cluster.seed_namespace("shared").await;
        let r = reconciler(&cluster);

        r.reconcile(&WorkItem::add(claim("alice", "shared"))).await.unwrap();
        r.reconcile(&WorkItem::add(claim("bob", "shared"))).await.unwrap();

        assert_eq!(cluster.call_count(Op::CreateNamespace).await, 0);
        assert_eq!(cluster.role_bindings().await.len(), 2);
    }

    #[tokio::test]
    async fn concurrent_namespace_creation_is_tolerated() {
        let cluster = MemoryCluster::new("dispatch");
        cluster.fail_next(Op::CreateNamespace, 1, Fault::Conflict).await;
        let r = reconciler(&cluster);

        r.reconcile(&WorkItem::add(claim("alice", "team-a"))).await.unwrap();
        assert_eq!(cluster.namespaces().await, BTreeSet::from(["team-a".to_string()]));
        assert_eq!(cluster.role_bindings().await.len(), 1);
    }

    #[tokio::test]
    async fn delete_removes_binding_but_keeps_namespace() {
        let cluster = MemoryCluster::new("dispatch");
        let r = reconciler(&cluster);
        r.reconcile(&WorkItem::add(claim("alice", "team-a"))).await.unwrap();

        r.reconcile(&WorkItem::delete(claim("alice", "team-a"))).await.unwrap();

        assert!(cluster.role_bindings().await.is_empty());
        assert_eq!(cluster.namespaces().await, BTreeSet::from(["team-a".to_string()]));
        assert_eq!(
            cluster.calls(Op::DeleteRoleBinding).await,
            vec!["team-a/alice.team-a"]
        );
    }

    #[tokio::test]
    async fn delete_of_missing_binding_succeeds() {
        let cluster = MemoryCluster::new("dispatch");
        let r = reconciler(&cluster);
        r.reconcile(&WorkItem::delete(claim("alice", "team-a"))).await.unwrap();
    }

    #[tokio::test]
    async fn update_is_acknowledged_without_calls() {
        let cluster = MemoryCluster::new("dispatch");
        let r = reconciler(&cluster);
        let item = WorkItem::update(claim("alice", "a"), claim("alice", "a"));
        r.reconcile(&item).await.unwrap();
        assert_eq!(cluster.call_count(Op::GetNamespace).await, 0);
    }

    #[tokio::test]
    async fn claim_without_owner_is_invalid() {
        let cluster = MemoryCluster::new("dispatch");
        let r = reconciler(&cluster);
        let err = r
            .reconcile(&WorkItem::add(claim("", "team-a")))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidSpec(_)));
        assert!(cluster.namespaces().await.is_empty());
    }

    #[tokio::test]
    async fn outage_surfaces_as_retryable() {
        let cluster = MemoryCluster::new("dispatch");
        cluster.fail_next(Op::CreateRoleBinding, 1, Fault::Unavailable).await;
        let r = reconciler(&cluster);

        let err = r
            .reconcile(&WorkItem::add(claim("alice", "team-a")))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        // The namespace stays; the retry only needs the binding.
        r.reconcile(&WorkItem::add(claim("alice", "team-a"))).await.unwrap();
        assert_eq!(cluster.call_count(Op::CreateNamespace).await, 1);
        assert_eq!(cluster.role_bindings().await.len(), 1);
    }
}
