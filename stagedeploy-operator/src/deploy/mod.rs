//! Deploy request orchestration.
//!
//! Everything in this module operates on an in-memory `DeployRequest` and reaches the cluster
//! only through the collaborator traits declared here. The Kubernetes backed implementations
//! live in `crate::k8s`; tests use the in-memory cluster of `fixtures`.
//!
//! Handlers mutate the request's status but never persist it. Persisting the status with
//! optimistic concurrency is the job of the caller (see `crate::k8s::scheduler`).

mod chain;
mod delete;
#[cfg(test)]
pub mod fixtures;
mod gitops;
mod initiate;
mod job;
mod payload;
mod queue;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use kube::api::DynamicObject;
use maplit::btreemap;

pub use chain::{chain_for, record_chain_error, ChainSettings, DeployHandler};
pub use job::{Job, PIPELINE_RUN_PENDING};
pub use queue::{CompletionDetection, JobListLimits};
use stagedeploy_core::crd::{Codebase, DeployRequest, ImageStream, Pipeline, RequiredMetadata, Stage};

/// The label identifying the pipeline of a job or GitOps application.
pub const LABEL_PIPELINE: &str = "stagedeploy.rs/pipeline";
/// The label identifying the stage key (`{pipeline}-{stage}`) of a job.
pub const LABEL_STAGE_KEY: &str = "stagedeploy.rs/stage-key";
/// The label identifying the deploy request which submitted a job.
pub const LABEL_DEPLOY_REQUEST: &str = "stagedeploy.rs/deploy-request";
/// The label identifying the stage name of a GitOps application.
pub const LABEL_STAGE: &str = "stagedeploy.rs/stage";
/// The label identifying the codebase deployed by a GitOps application.
pub const LABEL_APP_NAME: &str = "stagedeploy.rs/app-name";

/// The annotation carrying the deploy payload a job was submitted with.
pub const ANNOTATION_PAYLOAD: &str = "stagedeploy.rs/applications-payload";

/// An exact-match label set, used both for labelling and for selecting objects.
pub type Labels = BTreeMap<String, String>;

/// Read access to the definitions a deploy request depends upon.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Get a Pipeline by name.
    async fn pipeline(&self, name: &str) -> Result<Pipeline>;
    /// Get a Stage by name, which is its `{pipeline}-{stage}` key.
    async fn stage(&self, name: &str) -> Result<Stage>;
    /// Get an ImageStream by name.
    async fn image_stream(&self, name: &str) -> Result<ImageStream>;
    /// Get a Codebase by name, `None` if it does not exist.
    async fn codebase(&self, name: &str) -> Result<Option<Codebase>>;
}

/// One page of a job listing.
#[derive(Clone, Debug, Default)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    /// The token of the next page, `None` on the last page.
    pub continue_token: Option<String>,
}

/// Access to the jobs of the pipeline engine.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// List one page of at most `limit` jobs matching all of the given labels, starting at the
    /// given continue token.
    async fn list_jobs_page(&self, selector: &Labels, limit: u32, continue_token: Option<String>) -> Result<JobPage>;

    /// List every job matching all of the given labels, fetched in pages of `limit` jobs.
    async fn list_jobs(&self, selector: &Labels, limit: u32) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        let mut continue_token = None;
        loop {
            let page = self.list_jobs_page(selector, limit, continue_token.take()).await?;
            jobs.extend(page.jobs);
            match page.continue_token {
                Some(token) if !token.is_empty() => continue_token = Some(token),
                _ => break,
            }
        }
        Ok(jobs)
    }

    /// Release the named held job so that the engine starts it.
    ///
    /// Releasing a job which is not held is a no-op.
    async fn release_job(&self, name: &str) -> Result<()>;
}

/// A raw job resource rendered from a trigger template, as JSON text.
#[derive(Clone, Debug, PartialEq)]
pub struct RawResource(pub String);

/// Everything needed to submit a deploy job.
#[derive(Clone, Debug)]
pub struct JobSubmission<'a> {
    /// The name of the deploy request submitting the job.
    pub request: &'a str,
    /// The rendered job resource.
    pub resource: &'a RawResource,
    /// The serialized deploy payload.
    pub payload: &'a str,
    /// The pipeline name.
    pub pipeline: &'a str,
    /// The stage name.
    pub stage: &'a str,
    /// The labels the submitted job must carry.
    pub labels: Labels,
    /// The name of the target cluster.
    pub cluster: &'a str,
    /// Submit the job held, waiting to be released.
    pub held: bool,
}

/// The trigger template gateway of the pipeline engine.
#[async_trait]
pub trait TriggerTemplates: Send + Sync {
    /// Render the named template into a raw job resource.
    ///
    /// Fails with `AppError::EmptyTemplate` when the template defines no resources.
    async fn render(&self, template: &str) -> Result<RawResource>;
    /// Submit a rendered job.
    async fn submit(&self, submission: JobSubmission<'_>) -> Result<()>;
}

/// Access to GitOps application objects.
#[async_trait]
pub trait GitOpsApps: Send + Sync {
    /// List the applications matching all of the given labels.
    async fn list_apps(&self, selector: &Labels) -> Result<Vec<DynamicObject>>;
    /// Apply a JSON merge patch to the named application.
    async fn patch_app(&self, name: &str, patch: &serde_json::Value) -> Result<()>;
}

/// Write access to deploy requests.
#[async_trait]
pub trait DeployRequests: Send + Sync {
    /// Delete the named request; a request which is already gone is not an error.
    async fn delete_request(&self, name: &str) -> Result<()>;
}

/// The set of collaborators handlers are built from.
#[derive(Clone)]
pub struct Backends {
    pub catalog: Arc<dyn Catalog>,
    pub jobs: Arc<dyn JobStore>,
    pub templates: Arc<dyn TriggerTemplates>,
    pub apps: Arc<dyn GitOpsApps>,
    pub requests: Arc<dyn DeployRequests>,
}

/// The labels selecting all jobs of the given request's pipeline stage.
pub fn stage_job_selector(request: &DeployRequest) -> Labels {
    btreemap! {
        LABEL_PIPELINE.into() => request.spec.pipeline.clone(),
        LABEL_STAGE_KEY.into() => request.stage_key(),
    }
}

/// The labels carried by the job submitted for the given request.
pub fn request_job_labels(request: &DeployRequest) -> Labels {
    let mut labels = stage_job_selector(request);
    labels.insert(LABEL_DEPLOY_REQUEST.into(), request.name().into());
    labels
}

/// Render a label set as a K8s label selector string.
pub fn selector_string(labels: &Labels) -> String {
    labels.iter().map(|(key, val)| format!("{}={}", key, val)).collect::<Vec<_>>().join(",")
}
