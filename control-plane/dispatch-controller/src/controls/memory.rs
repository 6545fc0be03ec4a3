//! In-memory stand-in for the API server, implementing every control trait.
//!
//! Unlike the Kubernetes-backed controls it has read-your-writes semantics.
//! Every call is journaled and individual operations can be scripted to fail,
//! which is what the reconciler and worker-pool tests rely on.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, ServiceAccount};
use k8s_openapi::api::rbac::v1::RoleBinding;
use tokio::sync::Mutex;

use super::access_binding::namespace_for;
use super::service_account::service_account_for;
use super::{
    AccessBindingControl, ControlError, ControlResult, CreateOutcome,
    DeleteOutcome, OwnedNamespaceControl, ServiceAccountControl,
};
use crate::crd::{OwnedNamespace, claim_name};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    GetServiceAccount,
    CreateServiceAccount,
    DeleteServiceAccount,
    ListClaims,
    GetClaim,
    CreateClaim,
    DeleteClaim,
    GetNamespace,
    CreateNamespace,
    GetRoleBinding,
    CreateRoleBinding,
    DeleteRoleBinding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// 503, retried by the worker pool.
    Unavailable,
    /// 422, dropped without retry.
    Rejected,
    /// 409, as if another writer got there first.
    Conflict,
}

impl Fault {
    fn into_error(self, target: &str) -> ControlError {
        let (code, reason) = match self {
            Fault::Unavailable => (503, "ServiceUnavailable"),
            Fault::Rejected => (422, "Invalid"),
            Fault::Conflict => (409, "AlreadyExists"),
        };
        ControlError::Api {
            code,
            reason: reason.to_string(),
            message: format!("injected fault for {}", target),
        }
    }
}

#[derive(Default)]
struct State {
    service_accounts: BTreeMap<String, ServiceAccount>,
    claims: BTreeMap<String, OwnedNamespace>,
    namespaces: BTreeMap<String, Namespace>,
    role_bindings: BTreeMap<(String, String), RoleBinding>,
    journal: Vec<(Op, String)>,
    faults: HashMap<Op, VecDeque<Fault>>,
}

impl State {
    fn record(&mut self, op: Op, target: &str) -> ControlResult<()> {
        self.journal.push((op, target.to_string()));
        match self.faults.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(fault) => Err(fault.into_error(target)),
            None => Ok(()),
        }
    }

    /// Like `record`, but an injected conflict stands for a concurrent writer:
    /// the object still gets stored and the caller sees `AlreadyExists`.
    fn record_create(&mut self, op: Op, target: &str) -> ControlResult<bool> {
        match self.record(op, target) {
            Ok(()) => Ok(false),
            Err(e) if e.is_conflict() => Ok(true),
            Err(e) => Err(e),
        }
    }
}

fn created<T>(raced: bool, obj: T) -> CreateOutcome<T> {
    if raced {
        CreateOutcome::AlreadyExists
    } else {
        CreateOutcome::Created(obj)
    }
}

#[derive(Clone)]
pub struct MemoryCluster {
    namespace: String,
    state: Arc<Mutex<State>>,
}

impl MemoryCluster {
    /// `namespace` plays the role of the dispatch namespace.
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Make the next `times` calls of `op` fail with `fault`.
    pub async fn fail_next(&self, op: Op, times: usize, fault: Fault) {
        let mut s = self.state.lock().await;
        let q = s.faults.entry(op).or_default();
        q.extend(std::iter::repeat_n(fault, times));
    }

    /// Make every call of `op` fail with `fault` until cleared.
    pub async fn fail_always(&self, op: Op, fault: Fault) {
        self.fail_next(op, usize::from(u16::MAX), fault).await;
    }

    /// Targets of every recorded call of `op`, oldest first.
    pub async fn calls(&self, op: Op) -> Vec<String> {
        self.state
            .lock()
            .await
            .journal
            .iter()
            .filter(|(o, _)| *o == op)
            .map(|(_, target)| target.clone())
            .collect()
    }

    pub async fn call_count(&self, op: Op) -> usize {
        self.calls(op).await.len()
    }

    pub async fn service_accounts(&self) -> BTreeSet<String> {
        self.state.lock().await.service_accounts.keys().cloned().collect()
    }

    /// Namespaces currently claimed by `owner`.
    pub async fn claims_for(&self, owner: &str) -> BTreeSet<String> {
        self.state
            .lock()
            .await
            .claims
            .values()
            .filter(|c| c.spec.owner_id == owner)
            .map(|c| c.spec.namespace.clone())
            .collect()
    }

    pub async fn claim_count(&self) -> usize {
        self.state.lock().await.claims.len()
    }

    pub async fn namespaces(&self) -> BTreeSet<String> {
        self.state.lock().await.namespaces.keys().cloned().collect()
    }

    /// (namespace, name) of every RoleBinding.
    pub async fn role_bindings(&self) -> BTreeSet<(String, String)> {
        self.state.lock().await.role_bindings.keys().cloned().collect()
    }

    pub async fn seed_service_account(&self, user_id: &str) {
        let sa = service_account_for(&self.namespace, user_id);
        self.state
            .lock()
            .await
            .service_accounts
            .insert(user_id.to_string(), sa);
    }

    pub async fn seed_claim(&self, owner: &str, namespace: &str) {
        let claim = OwnedNamespace::for_owner(&self.namespace, owner, namespace);
        self.state
            .lock()
            .await
            .claims
            .insert(claim_name(owner, namespace), claim);
    }

    pub async fn seed_namespace(&self, name: &str) {
        self.state
            .lock()
            .await
            .namespaces
            .insert(name.to_string(), namespace_for(name));
    }
}

#[async_trait]
impl ServiceAccountControl for MemoryCluster {
    async fn get(&self, user_id: &str) -> ControlResult<Option<Arc<ServiceAccount>>> {
        let mut s = self.state.lock().await;
        s.record(Op::GetServiceAccount, user_id)?;
        Ok(s.service_accounts.get(user_id).cloned().map(Arc::new))
    }

    async fn create(&self, user_id: &str) -> ControlResult<CreateOutcome<ServiceAccount>> {
        let mut s = self.state.lock().await;
        let raced = s.record_create(Op::CreateServiceAccount, user_id)?;
        if s.service_accounts.contains_key(user_id) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        let sa = service_account_for(&self.namespace, user_id);
        s.service_accounts.insert(user_id.to_string(), sa.clone());
        Ok(created(raced, sa))
    }

    async fn delete(&self, user_id: &str) -> ControlResult<DeleteOutcome> {
        let mut s = self.state.lock().await;
        s.record(Op::DeleteServiceAccount, user_id)?;
        Ok(match s.service_accounts.remove(user_id) {
            Some(_) => DeleteOutcome::Deleted,
            None => DeleteOutcome::NotFound,
        })
    }
}

#[async_trait]
impl OwnedNamespaceControl for MemoryCluster {
    async fn list_for_owner(&self, owner: &str) -> ControlResult<Vec<Arc<OwnedNamespace>>> {
        let mut s = self.state.lock().await;
        s.record(Op::ListClaims, owner)?;
        Ok(s.claims
            .values()
            .filter(|c| c.spec.owner_id == owner)
            .cloned()
            .map(Arc::new)
            .collect())
    }

    async fn get(
        &self,
        owner: &str,
        namespace: &str,
    ) -> ControlResult<Option<Arc<OwnedNamespace>>> {
        let name = claim_name(owner, namespace);
        let mut s = self.state.lock().await;
        s.record(Op::GetClaim, &name)?;
        Ok(s.claims.get(&name).cloned().map(Arc::new))
    }

    async fn create(
        &self,
        owner: &str,
        namespace: &str,
    ) -> ControlResult<CreateOutcome<OwnedNamespace>> {
        let name = claim_name(owner, namespace);
        let mut s = self.state.lock().await;
        let raced = s.record_create(Op::CreateClaim, &name)?;
        if s.claims.contains_key(&name) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        let claim = OwnedNamespace::for_owner(&self.namespace, owner, namespace);
        s.claims.insert(name, claim.clone());
        Ok(created(raced, claim))
    }

    async fn delete(&self, owner: &str, namespace: &str) -> ControlResult<DeleteOutcome> {
        let name = claim_name(owner, namespace);
        let mut s = self.state.lock().await;
        s.record(Op::DeleteClaim, &name)?;
        Ok(match s.claims.remove(&name) {
            Some(_) => DeleteOutcome::Deleted,
            None => DeleteOutcome::NotFound,
        })
    }
}

#[async_trait]
impl AccessBindingControl for MemoryCluster {
    async fn get_namespace(&self, name: &str) -> ControlResult<Option<Namespace>> {
        let mut s = self.state.lock().await;
        s.record(Op::GetNamespace, name)?;
        Ok(s.namespaces.get(name).cloned())
    }

    async fn create_namespace(&self, name: &str) -> ControlResult<CreateOutcome<Namespace>> {
        let mut s = self.state.lock().await;
        let raced = s.record_create(Op::CreateNamespace, name)?;
        if s.namespaces.contains_key(name) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        let ns = namespace_for(name);
        s.namespaces.insert(name.to_string(), ns.clone());
        Ok(created(raced, ns))
    }

    async fn get_role_binding(
        &self,
        namespace: &str,
        name: &str,
    ) -> ControlResult<Option<RoleBinding>> {
        let mut s = self.state.lock().await;
        s.record(Op::GetRoleBinding, &format!("{}/{}", namespace, name))?;
        Ok(s.role_bindings
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create_role_binding(
        &self,
        binding: RoleBinding,
    ) -> ControlResult<CreateOutcome<RoleBinding>> {
        let (Some(namespace), Some(name)) = (
            binding.metadata.namespace.clone(),
            binding.metadata.name.clone(),
        ) else {
            return Err(ControlError::Invalid(
                "role binding needs a name and namespace".into(),
            ));
        };
        let mut s = self.state.lock().await;
        let raced = s.record_create(Op::CreateRoleBinding, &format!("{}/{}", namespace, name))?;
        if !s.namespaces.contains_key(&namespace) {
            return Err(ControlError::Api {
                code: 404,
                reason: "NotFound".into(),
                message: format!("namespaces \"{}\" not found", namespace),
            });
        }
        let key = (namespace, name);
        if s.role_bindings.contains_key(&key) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        s.role_bindings.insert(key, binding.clone());
        Ok(created(raced, binding))
    }

    async fn delete_role_binding(
        &self,
        namespace: &str,
        name: &str,
    ) -> ControlResult<DeleteOutcome> {
        let mut s = self.state.lock().await;
        s.record(Op::DeleteRoleBinding, &format!("{}/{}", namespace, name))?;
        Ok(
            match s
                .role_bindings
                .remove(&(namespace.to_string(), name.to_string()))
            {
                Some(_) => DeleteOutcome::Deleted,
                None => DeleteOutcome::NotFound,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_twice_reports_already_exists() {
        let cluster = MemoryCluster::new("dispatch");
        let first = ServiceAccountControl::create(&cluster, "alice").await.unwrap();
        let second = ServiceAccountControl::create(&cluster, "alice").await.unwrap();
        assert!(first.was_created());
        assert_eq!(second, CreateOutcome::AlreadyExists);
        assert_eq!(cluster.service_accounts().await.len(), 1);
    }

    #[tokio::test]
    async fn delete_missing_reports_not_found() {
        let cluster = MemoryCluster::new("dispatch");
        let out = OwnedNamespaceControl::delete(&cluster, "alice", "a")
            .await
            .unwrap();
        assert_eq!(out, DeleteOutcome::NotFound);
    }

    #[tokio::test]
    async fn scripted_faults_fire_in_order() {
        let cluster = MemoryCluster::new("dispatch");
        cluster.fail_next(Op::CreateClaim, 1, Fault::Unavailable).await;
        cluster.fail_next(Op::CreateClaim, 1, Fault::Conflict).await;

        let err = OwnedNamespaceControl::create(&cluster, "alice", "a")
            .await
            .unwrap_err();
        assert!(err.is_transient());
        let out = OwnedNamespaceControl::create(&cluster, "alice", "a")
            .await
            .unwrap();
        assert_eq!(out, CreateOutcome::AlreadyExists);
        let out = OwnedNamespaceControl::create(&cluster, "alice", "a")
            .await
            .unwrap();
        assert_eq!(out, CreateOutcome::AlreadyExists);

        assert_eq!(cluster.call_count(Op::CreateClaim).await, 3);
        assert_eq!(
            cluster.claims_for("alice").await,
            BTreeSet::from(["a".to_string()])
        );
    }

    #[tokio::test]
    async fn role_binding_requires_its_namespace() {
        let cluster = MemoryCluster::new("dispatch");
        let role = k8s_openapi::api::rbac::v1::RoleRef {
            api_group: "rbac.authorization.k8s.io".into(),
            kind: "ClusterRole".into(),
            name: "edit".into(),
        };
        let rb = crate::controls::role_binding_for("alice", "a", "dispatch", &role);

        let err = cluster.create_role_binding(rb.clone()).await.unwrap_err();
        assert!(err.is_not_found());

        cluster.seed_namespace("a").await;
        assert!(cluster.create_role_binding(rb).await.unwrap().was_created());
        assert!(
            cluster
                .get_role_binding("a", "alice.a")
                .await
                .unwrap()
                .is_some()
        );
    }
}
