use dispatch_controller::crd::{DispatchUser, OwnedNamespace};
use kube::core::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let docs = [
        serde_yaml::to_string(&DispatchUser::crd())?,
        serde_yaml::to_string(&OwnedNamespace::crd())?,
    ];
    println!("{}", docs.join("---\n"));
    Ok(())
}
