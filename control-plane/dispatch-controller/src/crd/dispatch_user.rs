use std::collections::BTreeSet;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::OwnedNamespace;

/// A tenant that can own namespaces. Administrators (or a self-service API)
/// write these into the dispatch namespace; the controller only reads them.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "netsys.io",
    version = "v1",
    kind = "DispatchUser",
    plural = "dispatchusers",
    namespaced
)]
pub struct DispatchUserSpec {
    /// Stable external identifier; names the tenant's ServiceAccount.
    /// Must not change after creation.
    #[serde(rename = "userID")]
    pub user_id: String,
    /// Namespaces the tenant should own. Order and duplicates are ignored.
    #[serde(default)]
    pub namespaces: Vec<String>,
}

impl DispatchUserSpec {
    pub fn declared_namespaces(&self) -> BTreeSet<String> {
        self.namespaces
            .iter()
            .filter(|n| !n.is_empty())
            .cloned()
            .collect()
    }
}

impl DispatchUser {
    /// Whether `claim` was made on behalf of this tenant.
    pub fn owns(&self, claim: &OwnedNamespace) -> bool {
        let id = self.spec.user_id.trim();
        !id.is_empty() && id == claim.spec.owner_id.trim()
    }
}
