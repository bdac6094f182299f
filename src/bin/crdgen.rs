//! Prints the CustomResourceDefinition manifests for all three resources.
//!
//! Usage: `cargo run --bin crdgen > deploy/crds.yaml`

use anyhow::Result;
use kube::CustomResourceExt;

use ansible_operator::crd::{Playbook, Repository, Schedule};

fn main() -> Result<()> {
    print!("{}", serde_yaml::to_string(&Repository::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&Playbook::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&Schedule::crd())?);
    Ok(())
}
