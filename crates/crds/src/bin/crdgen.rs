//! Prints the InferenceJob CustomResourceDefinition as YAML.
//!
//! `cargo run -p crds --bin crdgen | kubectl apply -f -`

use crds::InferenceJob;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&InferenceJob::crd())?);
    Ok(())
}
