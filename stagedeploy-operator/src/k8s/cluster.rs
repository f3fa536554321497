//! The K8s API backed collaborators of the deploy module.

use anyhow::{Context, Result};
use async_trait::async_trait;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams};
use kube::client::Client;
use serde_json::{json, Value};
use tokio::time::timeout;

use crate::deploy::{selector_string, Catalog, DeployRequests, GitOpsApps, Job, JobPage, JobStore, Labels};
use crate::k8s::API_TIMEOUT;
use stagedeploy_core::crd::{Codebase, DeployRequest, ImageStream, Pipeline, Stage};

/// Access to the StageDeploy objects, deploy jobs and GitOps applications of a namespace.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    namespace: String,
    pipeline_runs: ApiResource,
    trigger_templates: ApiResource,
    applications: ApiResource,
}

impl KubeCluster {
    /// Create a new instance.
    pub fn new(client: Client, namespace: String) -> Self {
        Self {
            client,
            namespace,
            pipeline_runs: ApiResource::from_gvk(&GroupVersionKind::gvk("tekton.dev", "v1", "PipelineRun")),
            trigger_templates: ApiResource::from_gvk(&GroupVersionKind::gvk("triggers.tekton.dev", "v1beta1", "TriggerTemplate")),
            applications: ApiResource::from_gvk(&GroupVersionKind::gvk("argoproj.io", "v1alpha1", "Application")),
        }
    }

    /// The namespace of this cluster.
    pub(super) fn namespace(&self) -> &str {
        &self.namespace
    }

    pub(super) fn pipeline_runs_api(&self) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), &self.namespace, &self.pipeline_runs)
    }

    pub(super) fn trigger_templates_api(&self) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), &self.namespace, &self.trigger_templates)
    }

    fn applications_api(&self) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), &self.namespace, &self.applications)
    }

    /// Get the named object, `None` if it does not exist.
    async fn get_opt<K>(&self, api: Api<K>, name: &str, kind: &str) -> Result<Option<K>>
    where
        K: Clone + serde::de::DeserializeOwned + std::fmt::Debug,
    {
        let res = timeout(API_TIMEOUT, api.get(name))
            .await
            .with_context(|| format!("timeout while fetching {} {}", kind, name))?;
        match res {
            Ok(obj) => Ok(Some(obj)),
            Err(err) => match err {
                kube::Error::Api(api_err) if api_err.code == http::StatusCode::NOT_FOUND => Ok(None),
                _ => Err(err).with_context(|| format!("error fetching {} {}", kind, name)),
            },
        }
    }

    /// Get the named object, failing if it does not exist.
    async fn get<K>(&self, api: Api<K>, name: &str, kind: &str) -> Result<K>
    where
        K: Clone + serde::de::DeserializeOwned + std::fmt::Debug,
    {
        self.get_opt(api, name, kind)
            .await?
            .with_context(|| format!("{} {} not found", kind, name))
    }
}

#[async_trait]
impl Catalog for KubeCluster {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn pipeline(&self, name: &str) -> Result<Pipeline> {
        self.get(Api::namespaced(self.client.clone(), &self.namespace), name, "Pipeline").await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn stage(&self, name: &str) -> Result<Stage> {
        self.get(Api::namespaced(self.client.clone(), &self.namespace), name, "Stage").await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn image_stream(&self, name: &str) -> Result<ImageStream> {
        self.get(Api::namespaced(self.client.clone(), &self.namespace), name, "ImageStream").await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn codebase(&self, name: &str) -> Result<Option<Codebase>> {
        self.get_opt(Api::namespaced(self.client.clone(), &self.namespace), name, "Codebase").await
    }
}

#[async_trait]
impl JobStore for KubeCluster {
    #[tracing::instrument(level = "debug", skip(self, selector, continue_token))]
    async fn list_jobs_page(&self, selector: &Labels, limit: u32, continue_token: Option<String>) -> Result<JobPage> {
        let params = ListParams {
            label_selector: Some(selector_string(selector)),
            limit: Some(limit),
            continue_token,
            ..Default::default()
        };
        let runs = timeout(API_TIMEOUT, self.pipeline_runs_api().list(&params))
            .await
            .context("timeout while listing PipelineRuns")?
            .context("error listing PipelineRuns")?;
        Ok(JobPage {
            jobs: runs.items.iter().map(Job::from_pipeline_run).collect(),
            continue_token: runs.metadata.continue_,
        })
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn release_job(&self, name: &str) -> Result<()> {
        tracing::info!(name, "releasing PipelineRun");
        let patch = json!({"spec": {"status": Value::Null}});
        timeout(API_TIMEOUT, self.pipeline_runs_api().patch(name, &PatchParams::default(), &Patch::Merge(&patch)))
            .await
            .context("timeout while releasing PipelineRun")?
            .context("error releasing PipelineRun")
            .map(|_| ())
    }
}

#[async_trait]
impl GitOpsApps for KubeCluster {
    #[tracing::instrument(level = "debug", skip(self, selector))]
    async fn list_apps(&self, selector: &Labels) -> Result<Vec<DynamicObject>> {
        let params = ListParams {
            label_selector: Some(selector_string(selector)),
            ..Default::default()
        };
        let apps = timeout(API_TIMEOUT, self.applications_api().list(&params))
            .await
            .context("timeout while listing Applications")?
            .context("error listing Applications")?;
        Ok(apps.items)
    }

    #[tracing::instrument(level = "debug", skip(self, patch))]
    async fn patch_app(&self, name: &str, patch: &Value) -> Result<()> {
        tracing::info!(name, "patching Application");
        timeout(API_TIMEOUT, self.applications_api().patch(name, &PatchParams::default(), &Patch::Merge(patch)))
            .await
            .context("timeout while patching Application")?
            .context("error patching Application")
            .map(|_| ())
    }
}

#[async_trait]
impl DeployRequests for KubeCluster {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn delete_request(&self, name: &str) -> Result<()> {
        tracing::info!(name, "deleting DeployRequest");
        let api: Api<DeployRequest> = Api::namespaced(self.client.clone(), &self.namespace);
        let res = timeout(API_TIMEOUT, api.delete(name, &Default::default()))
            .await
            .context("timeout while deleting DeployRequest")?;
        match res {
            Ok(_val) => Ok(()),
            Err(err) => match err {
                kube::Error::Api(api_err) if api_err.code == http::StatusCode::NOT_FOUND => Ok(()),
                _ => Err(err).context("error deleting DeployRequest"),
            },
        }
    }
}
