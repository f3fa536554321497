//! ImageStream CRD.
//!
//! The code here is used to generate the actual CRD used in K8s. See `src/bin/crdgen.rs`.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub type ImageStream = ImageStreamCRD; // Mostly to resolve a Rust Analyzer issue.

/// CRD spec for the ImageStream resource.
///
/// An ImageStream is an append-only record of the images built for a codebase.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    struct = "ImageStreamCRD",
    status = "ImageStreamStatus",
    group = "stagedeploy.rs",
    version = "v1",
    kind = "ImageStream",
    namespaced,
    derive = "PartialEq",
    shortname = "sdimagestream",
    printcolumn = r#"{"name":"Codebase","type":"string","jsonPath":".spec.codebase"}"#,
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.imageName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ImageStreamSpec {
    /// The name of the codebase which owns this stream.
    pub codebase: String,
    /// The name of the image, without tag.
    pub image_name: String,
    /// All tags built into this stream.
    #[serde(default)]
    pub tags: Vec<ImageTag>,
}

/// A single image tag of a stream.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct ImageTag {
    /// The tag name.
    pub name: String,
    /// The time at which this tag was created.
    pub created: DateTime<Utc>,
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct ImageStreamStatus {}

impl ImageStreamCRD {
    /// The most recently created tag of this stream.
    ///
    /// When multiple tags share the greatest creation time, the last one recorded wins.
    pub fn latest_tag(&self) -> Option<&ImageTag> {
        self.spec.tags.iter().max_by_key(|tag| tag.created)
    }
}
