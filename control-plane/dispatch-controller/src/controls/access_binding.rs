use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1::{RoleBinding, RoleRef, Subject};
use kube::Client;
use kube::api::{Api, DeleteParams, PostParams};
use kube::core::ObjectMeta;

use super::{
    AccessBindingControl, ControlError, ControlResult, CreateOutcome,
    DeleteOutcome, MANAGED_BY_LABEL, MANAGER_NAME, create_outcome,
    delete_outcome,
};
use crate::crd::{OWNER_LABEL, claim_name};

fn managed_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(MANAGED_BY_LABEL.to_string(), MANAGER_NAME.to_string())])
}

pub fn namespace_for(name: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// RoleBinding in `namespace` granting the owner's ServiceAccount (living in
/// `account_namespace`) the configured role. Named like the claim it backs.
pub fn role_binding_for(
    owner: &str,
    namespace: &str,
    account_namespace: &str,
    role_ref: &RoleRef,
) -> RoleBinding {
    let mut labels = managed_labels();
    labels.insert(OWNER_LABEL.to_string(), owner.to_string());
    RoleBinding {
        metadata: ObjectMeta {
            name: Some(claim_name(owner, namespace)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        role_ref: role_ref.clone(),
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: owner.to_string(),
            namespace: Some(account_namespace.to_string()),
            api_group: None,
        }]),
    }
}

pub struct KubeAccessBindingControl {
    client: Client,
}

impl KubeAccessBindingControl {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn bindings(&self, namespace: &str) -> Api<RoleBinding> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl AccessBindingControl for KubeAccessBindingControl {
    async fn get_namespace(&self, name: &str) -> ControlResult<Option<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn create_namespace(&self, name: &str) -> ControlResult<CreateOutcome<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        create_outcome(api.create(&PostParams::default(), &namespace_for(name)).await)
    }

    async fn get_role_binding(
        &self,
        namespace: &str,
        name: &str,
    ) -> ControlResult<Option<RoleBinding>> {
        Ok(self.bindings(namespace).get_opt(name).await?)
    }

    async fn create_role_binding(
        &self,
        binding: RoleBinding,
    ) -> ControlResult<CreateOutcome<RoleBinding>> {
        let namespace = binding.metadata.namespace.clone().ok_or_else(|| {
            ControlError::Invalid("role binding has no namespace".into())
        })?;
        create_outcome(
            self.bindings(&namespace)
                .create(&PostParams::default(), &binding)
                .await,
        )
    }

    async fn delete_role_binding(
        &self,
        namespace: &str,
        name: &str,
    ) -> ControlResult<DeleteOutcome> {
        delete_outcome(
            self.bindings(namespace)
                .delete(name, &DeleteParams::default())
                .await,
        )
    }
}
