pub mod dispatch_user;
pub mod owned_namespace;

pub use dispatch_user::{DispatchUser, DispatchUserSpec};
pub use owned_namespace::{
    OWNER_LABEL, OwnedNamespace, OwnedNamespaceSpec, claim_name,
};
