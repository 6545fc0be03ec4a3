use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::Client;
use kube::api::{Api, DeleteParams, PostParams};
use kube::core::ObjectMeta;

use super::{
    ControlResult, CreateOutcome, DeleteOutcome, MANAGED_BY_LABEL,
    MANAGER_NAME, ServiceAccountControl, create_outcome, delete_outcome,
};
use crate::cache::{ObjectKey, ResourceCache};

pub fn service_account_for(namespace: &str, user_id: &str) -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(user_id.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                MANAGED_BY_LABEL.to_string(),
                MANAGER_NAME.to_string(),
            )])),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Reads from the ServiceAccount cache, writes through the API server. Creates
/// always reach the server: a cached copy may already have been deleted.
pub struct KubeServiceAccountControl {
    api: Api<ServiceAccount>,
    namespace: String,
    cache: ResourceCache<ServiceAccount>,
}

impl KubeServiceAccountControl {
    pub fn new(
        client: Client,
        namespace: &str,
        cache: ResourceCache<ServiceAccount>,
    ) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            cache,
        }
    }
}

#[async_trait]
impl ServiceAccountControl for KubeServiceAccountControl {
    async fn get(&self, user_id: &str) -> ControlResult<Option<Arc<ServiceAccount>>> {
        Ok(self
            .cache
            .get(&ObjectKey::namespaced(&self.namespace, user_id))
            .await)
    }

    async fn create(&self, user_id: &str) -> ControlResult<CreateOutcome<ServiceAccount>> {
        let sa = service_account_for(&self.namespace, user_id);
        create_outcome(self.api.create(&PostParams::default(), &sa).await)
    }

    async fn delete(&self, user_id: &str) -> ControlResult<DeleteOutcome> {
        delete_outcome(self.api.delete(user_id, &DeleteParams::default()).await)
    }
}
