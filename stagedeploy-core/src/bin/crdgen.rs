//! Print the StageDeploy CRDs as a multi-document YAML stream.
//!
//! Usage: `cargo run --bin crdgen > crds.yaml`

use anyhow::{Context, Result};
use kube::CustomResourceExt;

use stagedeploy_core::crd::{Codebase, DeployRequest, ImageStream, Pipeline, Stage};

fn main() -> Result<()> {
    let crds = [DeployRequest::crd(), Pipeline::crd(), Stage::crd(), ImageStream::crd(), Codebase::crd()];
    for crd in crds.iter() {
        let yaml = serde_yaml::to_string(crd).context("error serializing CRD to YAML")?;
        print!("{}", yaml);
    }
    Ok(())
}
