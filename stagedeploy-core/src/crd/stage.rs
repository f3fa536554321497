//! Stage CRD.
//!
//! The code here is used to generate the actual CRD used in K8s. See `src/bin/crdgen.rs`.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::RequiredMetadata;

pub type Stage = StageCRD; // Mostly to resolve a Rust Analyzer issue.

/// The annotation prefix under which a Stage records the stable tag of each application.
///
/// For example, `app.stagedeploy.rs/my-service: 1.2.3`.
pub const STABLE_TAG_ANNOTATION_PREFIX: &str = "app.stagedeploy.rs/";

/// The cluster name used when a Stage does not name one.
const DEFAULT_CLUSTER: &str = "in-cluster";

/// CRD spec for the Stage resource.
///
/// Stage objects are named by their canonical key `{pipeline}-{stage}`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    struct = "StageCRD",
    status = "StageStatus",
    group = "stagedeploy.rs",
    version = "v1",
    kind = "Stage",
    namespaced,
    derive = "PartialEq",
    shortname = "sdstage",
    printcolumn = r#"{"name":"Pipeline","type":"string","jsonPath":".spec.pipeline"}"#,
    printcolumn = r#"{"name":"Trigger Template","type":"string","jsonPath":".spec.triggerTemplate"}"#,
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.cluster"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct StageSpec {
    /// The name of this stage, unique per pipeline.
    pub name: String,
    /// The name of the pipeline to which this stage belongs.
    pub pipeline: String,
    /// The name of the trigger template used to render deploy jobs for this stage.
    pub trigger_template: String,
    /// The name of the target cluster of this stage.
    #[serde(default = "StageSpec::default_cluster")]
    pub cluster: String,
}

impl StageSpec {
    fn default_cluster() -> String {
        DEFAULT_CLUSTER.into()
    }
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct StageStatus {}

impl StageCRD {
    /// Get the stable tag recorded on this stage for the given application, if any.
    pub fn stable_tag(&self, application: &str) -> Option<&str> {
        self.annotations()
            .get(&format!("{}{}", STABLE_TAG_ANNOTATION_PREFIX, application))
            .map(String::as_str)
            .filter(|tag| !tag.is_empty())
    }

    /// Get the stable tags recorded on this stage for the given applications.
    ///
    /// Applications without a recorded stable tag are omitted.
    pub fn stable_tags<T: AsRef<str>>(&self, applications: &[T]) -> BTreeMap<String, String> {
        applications
            .iter()
            .filter_map(|app| {
                let app = app.as_ref();
                self.stable_tag(app).map(|tag| (app.to_string(), tag.to_string()))
            })
            .collect()
    }
}
