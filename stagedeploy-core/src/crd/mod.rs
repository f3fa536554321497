//! StageDeploy CRDs.
//!
//! References:
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/#additional-printer-columns
//! - https://kubernetes.io/docs/reference/kubectl/jsonpath/

mod codebase;
mod deploy_request;
mod image_stream;
mod pipeline;
mod stage;

use std::collections::BTreeMap;

use kube::Resource;

pub use codebase::{Codebase, CodebaseSpec, Versioning, VersioningType};
pub use deploy_request::{CodebaseTag, DeployRequest, DeployRequestSpec, DeployRequestStatus, DeployStatus, TriggerType};
pub use image_stream::{ImageStream, ImageStreamSpec, ImageTag};
pub use pipeline::{Pipeline, PipelineSpec};
pub use stage::{Stage, StageSpec, STABLE_TAG_ANNOTATION_PREFIX};

/// Shared empty map returned for objects without annotations.
static EMPTY_ANNOTATIONS: BTreeMap<String, String> = BTreeMap::new();

/// A convenience trait built around the fact that all implementors
/// must have the following attributes.
pub trait RequiredMetadata {
    /// The namespace of this object.
    fn namespace(&self) -> &str;

    /// The name of this object.
    fn name(&self) -> &str;

    /// The annotations of this object, empty when unset.
    fn annotations(&self) -> &BTreeMap<String, String>;
}

macro_rules! impl_required_metadata {
    ($($crd:ty),+ $(,)?) => {
        $(
            impl RequiredMetadata for $crd {
                fn namespace(&self) -> &str {
                    self.meta().namespace.as_deref().unwrap_or_default()
                }

                fn name(&self) -> &str {
                    self.meta().name.as_deref().unwrap_or_default()
                }

                fn annotations(&self) -> &BTreeMap<String, String> {
                    self.meta().annotations.as_ref().unwrap_or(&EMPTY_ANNOTATIONS)
                }
            }
        )+
    };
}

impl_required_metadata!(Codebase, DeployRequest, ImageStream, Pipeline, Stage);
