use std::collections::BTreeMap;

use kube::CustomResource;
use kube::core::ObjectMeta;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label carried by every OwnedNamespace so the claim cache can be listed
/// per owner.
pub const OWNER_LABEL: &str = "ownerID";

/// One tenant's claim to one namespace. Named by [`claim_name`], which keeps
/// at most one claim per (owner, namespace) pair in the store.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "netsys.io",
    version = "v1",
    kind = "OwnedNamespace",
    plural = "ownednamespaces",
    namespaced,
    derive = "PartialEq"
)]
pub struct OwnedNamespaceSpec {
    #[serde(rename = "ownerID")]
    pub owner_id: String,
    pub namespace: String,
}

/// Composite name shared by a claim and its RoleBinding. Namespace names
/// never contain a dot, so the name stays unique per (owner, namespace).
pub fn claim_name(owner: &str, namespace: &str) -> String {
    format!("{}.{}", owner, namespace)
}

impl OwnedNamespace {
    /// Build the claim object stored in `claim_namespace`.
    pub fn for_owner(claim_namespace: &str, owner: &str, namespace: &str) -> Self {
        let mut claim = OwnedNamespace::new(
            &claim_name(owner, namespace),
            OwnedNamespaceSpec {
                owner_id: owner.to_string(),
                namespace: namespace.to_string(),
            },
        );
        claim.metadata = ObjectMeta {
            namespace: Some(claim_namespace.to_string()),
            labels: Some(BTreeMap::from([(
                OWNER_LABEL.to_string(),
                owner.to_string(),
            )])),
            ..claim.metadata
        };
        claim
    }
}
