//! Codebase CRD.
//!
//! Only the parts of a codebase which affect deployment are modelled here.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub type Codebase = CodebaseCRD; // Mostly to resolve a Rust Analyzer issue.

/// The git ref prefix under which `edp` versioned codebases publish their builds.
const EDP_REVISION_PREFIX: &str = "build/";

/// CRD spec for the Codebase resource.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    struct = "CodebaseCRD",
    status = "CodebaseStatus",
    group = "stagedeploy.rs",
    version = "v1",
    kind = "Codebase",
    namespaced,
    derive = "PartialEq",
    shortname = "sdcodebase",
    printcolumn = r#"{"name":"Versioning","type":"string","jsonPath":".spec.versioning.type"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CodebaseSpec {
    /// The versioning policy of this codebase.
    #[serde(default)]
    pub versioning: Versioning,
}

/// The versioning policy of a codebase.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Versioning {
    /// The versioning scheme.
    #[serde(rename = "type", default)]
    pub type_: VersioningType,
    /// The version from which build numbering starts.
    #[serde(default)]
    pub start_from: Option<String>,
}

/// The versioning scheme of a codebase.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum VersioningType {
    /// Tags are used as-is.
    Default,
    /// Tags are build numbers published under `build/` git refs.
    Edp,
    /// Tags are semantic versions.
    Semver,
}

impl Default for VersioningType {
    fn default() -> Self {
        Self::Default
    }
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct CodebaseStatus {}

impl CodebaseCRD {
    /// The git revision at which the given image tag of this codebase was built.
    pub fn revision_for(&self, tag: &str) -> String {
        match self.spec.versioning.type_ {
            VersioningType::Edp => format!("{}{}", EDP_REVISION_PREFIX, tag),
            VersioningType::Default | VersioningType::Semver => tag.to_string(),
        }
    }
}
