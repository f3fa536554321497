//! GitOps tag sync.
//!
//! Once a request's job has succeeded, the GitOps application deploying the promoted codebase
//! on the request's stage is patched to point at the tag that job deployed for it. This is the
//! promoted tag for `AutoStable` requests, and the stream's latest tag for `Auto` requests.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use kube::api::DynamicObject;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::deploy::payload::Payload;
use crate::deploy::{
    request_job_labels, Catalog, DeployHandler, GitOpsApps, Job, JobListLimits, JobStore, Labels, LABEL_APP_NAME, LABEL_PIPELINE,
    LABEL_STAGE,
};
use stagedeploy_core::crd::{DeployRequest, DeployStatus, RequiredMetadata};
use stagedeploy_core::AppError;

/// The helm parameter carrying the image tag of an application.
const HELM_IMAGE_TAG_PARAM: &str = "image.tag";

/// The `spec.source` block of a GitOps application.
///
/// Only the fields which are patched are modelled, everything else is carried through as-is.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct AppSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target_revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    helm: Option<HelmSource>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
struct HelmSource {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    parameters: Vec<HelmParameter>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
struct HelmParameter {
    name: String,
    #[serde(default)]
    value: String,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

/// Build the merge patch pointing the given application at the given revision & tag.
///
/// `targetRevision` is set to `revision`, and an existing `image.tag` helm parameter is
/// overwritten with `tag`. No parameter is added when the application does not declare one.
pub fn build_tag_patch(app: &DynamicObject, revision: &str, tag: &str) -> Result<Value> {
    let source = app.data.pointer("/spec/source").cloned().unwrap_or_else(|| json!({}));
    let mut source: AppSource = serde_json::from_value(source).context("error decoding spec.source of gitops application")?;
    source.target_revision = Some(revision.into());
    if let Some(helm) = source.helm.as_mut() {
        helm.parameters
            .iter_mut()
            .filter(|param| param.name == HELM_IMAGE_TAG_PARAM)
            .for_each(|param| param.value = tag.into());
    }
    let source = serde_json::to_value(&source).context("error encoding spec.source of gitops application")?;
    Ok(json!({"spec": {"source": source}}))
}

/// The tag the given job deployed for the given codebase, read from its submitted payload.
///
/// `None` when the job carries no payload or the payload has no entry for the codebase.
fn deployed_tag(job: &Job, codebase: &str) -> Result<Option<String>> {
    let raw = match job.payload.as_deref() {
        Some(raw) => raw,
        None => return Ok(None),
    };
    let payload = Payload::from_json(raw).with_context(|| format!("error reading payload of deploy job {}", job.name))?;
    Ok(payload.tag(codebase).map(String::from))
}

/// Patches the GitOps application of a completed request with the promoted tag.
pub struct GitOpsTagSync {
    catalog: Arc<dyn Catalog>,
    jobs: Arc<dyn JobStore>,
    apps: Arc<dyn GitOpsApps>,
    limits: JobListLimits,
}

impl GitOpsTagSync {
    /// Create a new instance.
    pub fn new(catalog: Arc<dyn Catalog>, jobs: Arc<dyn JobStore>, apps: Arc<dyn GitOpsApps>, limits: JobListLimits) -> Self {
        Self {
            catalog,
            jobs,
            apps,
            limits,
        }
    }

    /// The request's own job, if it exists and finished successfully.
    async fn succeeded_job(&self, request: &DeployRequest) -> Result<Option<Job>> {
        let jobs = self
            .jobs
            .list_jobs(&request_job_labels(request), self.limits.limit)
            .await
            .context("error listing deploy job of request")?;
        Ok(jobs
            .into_iter()
            .find(|job| job.belongs_to(request.name()) && job.done && job.succeeded))
    }

    /// Find the single GitOps application deploying the given codebase on the request's stage.
    async fn find_app(&self, request: &DeployRequest, stage: &str) -> Result<DynamicObject> {
        let codebase = &request.spec.tag.codebase;
        let selector: Labels = maplit::btreemap! {
            LABEL_APP_NAME.into() => codebase.clone(),
            LABEL_PIPELINE.into() => request.spec.pipeline.clone(),
            LABEL_STAGE.into() => stage.into(),
        };
        let mut apps = self.apps.list_apps(&selector).await.context("error listing gitops applications")?;
        match apps.len() {
            0 => Err(AppError::AppNotFound(codebase.clone()).into()),
            1 => Ok(apps.remove(0)),
            _ => Err(AppError::MultipleAppsFound(codebase.clone()).into()),
        }
    }
}

#[async_trait]
impl DeployHandler for GitOpsTagSync {
    fn name(&self) -> &'static str {
        "gitops-tag-sync"
    }

    #[tracing::instrument(level = "debug", skip(self, request), fields(request = request.name()))]
    async fn handle(&self, request: &mut DeployRequest) -> Result<()> {
        if request.status_value() != DeployStatus::Completed {
            return Ok(());
        }
        let job = match self.succeeded_job(request).await? {
            Some(job) => job,
            None => {
                tracing::debug!("request has no successful deploy job, skipping gitops sync");
                return Ok(());
            }
        };

        let stage_key = request.stage_key();
        let stage = self
            .catalog
            .stage(&stage_key)
            .await
            .with_context(|| format!("error fetching stage {}", stage_key))?;
        let app = self.find_app(request, &stage.spec.name).await?;
        let app_name = app.metadata.name.clone().unwrap_or_default();

        let codebase = &request.spec.tag.codebase;
        let tag = deployed_tag(&job, codebase)?.unwrap_or_else(|| request.spec.tag.tag.clone());
        let revision = match self
            .catalog
            .codebase(codebase)
            .await
            .with_context(|| format!("error fetching codebase {}", codebase))?
        {
            Some(codebase) => codebase.revision_for(&tag),
            None => tag.clone(),
        };
        let patch = build_tag_patch(&app, &revision, &tag)?;
        self.apps
            .patch_app(&app_name, &patch)
            .await
            .with_context(|| format!("error patching gitops application {}", app_name))?;
        tracing::info!(app = %app_name, %revision, %tag, "gitops application synced");
        Ok(())
    }
}
