//! Print the CRD manifests as a multi-document YAML stream

use crds::{TridentMirrorRelationship, TridentVolumeReference};
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    let crds = [TridentMirrorRelationship::crd(), TridentVolumeReference::crd()];
    for crd in crds {
        print!("---\n{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
