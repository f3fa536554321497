//! Pipeline CRD.
//!
//! The code here is used to generate the actual CRD used in K8s. See `src/bin/crdgen.rs`.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub type Pipeline = PipelineCRD; // Mostly to resolve a Rust Analyzer issue.

/// CRD spec for the Pipeline resource.
///
/// A Pipeline groups the applications which are promoted together through its stages, along
/// with the image streams which feed those applications.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    struct = "PipelineCRD",
    status = "PipelineStatus",
    group = "stagedeploy.rs",
    version = "v1",
    kind = "Pipeline",
    namespaced,
    derive = "PartialEq",
    shortname = "sdpipeline",
    printcolumn = r#"{"name":"Applications","type":"string","jsonPath":".spec.applications"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSpec {
    /// The display name of this pipeline.
    pub name: String,
    /// The names of the codebases deployed by this pipeline.
    #[serde(default)]
    pub applications: Vec<String>,
    /// The names of the image streams which feed this pipeline's applications.
    #[serde(default)]
    pub input_streams: Vec<String>,
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct PipelineStatus {}
