use std::sync::Arc;

use async_trait::async_trait;
use kube::Client;
use kube::api::{Api, DeleteParams, PostParams};

use super::{
    ControlResult, CreateOutcome, DeleteOutcome, OwnedNamespaceControl,
    create_outcome, delete_outcome,
};
use crate::cache::{LabelSelector, ObjectKey, ResourceCache};
use crate::crd::{OWNER_LABEL, OwnedNamespace, claim_name};

/// Lists and gets claims from the OwnedNamespace cache; creates and deletes
/// them through the API server.
pub struct KubeOwnedNamespaceControl {
    api: Api<OwnedNamespace>,
    namespace: String,
    cache: ResourceCache<OwnedNamespace>,
}

impl KubeOwnedNamespaceControl {
    pub fn new(
        client: Client,
        namespace: &str,
        cache: ResourceCache<OwnedNamespace>,
    ) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            cache,
        }
    }
}

#[async_trait]
impl OwnedNamespaceControl for KubeOwnedNamespaceControl {
    async fn list_for_owner(&self, owner: &str) -> ControlResult<Vec<Arc<OwnedNamespace>>> {
        let selector = LabelSelector::everything().with(OWNER_LABEL, owner);
        Ok(self.cache.list(Some(&self.namespace), &selector).await)
    }

    async fn get(
        &self,
        owner: &str,
        namespace: &str,
    ) -> ControlResult<Option<Arc<OwnedNamespace>>> {
        let key = ObjectKey::namespaced(&self.namespace, &claim_name(owner, namespace));
        Ok(self.cache.get(&key).await)
    }

    async fn create(
        &self,
        owner: &str,
        namespace: &str,
    ) -> ControlResult<CreateOutcome<OwnedNamespace>> {
        let claim = OwnedNamespace::for_owner(&self.namespace, owner, namespace);
        create_outcome(self.api.create(&PostParams::default(), &claim).await)
    }

    async fn delete(&self, owner: &str, namespace: &str) -> ControlResult<DeleteOutcome> {
        let name = claim_name(owner, namespace);
        delete_outcome(self.api.delete(&name, &DeleteParams::default()).await)
    }
}
