//! An in-memory cluster implementing every collaborator of the deploy module.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use kube::api::DynamicObject;
use serde_json::{json, Value};

use crate::deploy::{
    Backends, Catalog, DeployRequests, GitOpsApps, Job, JobPage, JobStore, JobSubmission, Labels, RawResource, TriggerTemplates, LABEL_APP_NAME,
    LABEL_DEPLOY_REQUEST, LABEL_PIPELINE, LABEL_STAGE, LABEL_STAGE_KEY,
};
use stagedeploy_core::crd::{
    Codebase, CodebaseSpec, CodebaseTag, DeployRequest, DeployRequestSpec, DeployStatus, ImageStream, ImageStreamSpec, ImageTag, Pipeline,
    PipelineSpec, Stage, StageSpec, TriggerType, Versioning, VersioningType,
};
use stagedeploy_core::AppError;

pub const PIPELINE: &str = "mypipe";
pub const STAGE: &str = "dev";
pub const STAGE_KEY: &str = "mypipe-dev";
pub const TEMPLATE: &str = "deploy";

/// A recorded job submission.
#[derive(Clone, Debug)]
pub struct Submission {
    pub request: String,
    pub job: String,
    pub payload: Value,
    pub stage: String,
    pub cluster: String,
    pub held: bool,
}

#[derive(Default)]
pub struct State {
    pub pipelines: HashMap<String, Pipeline>,
    pub stages: HashMap<String, Stage>,
    pub streams: HashMap<String, ImageStream>,
    pub codebases: HashMap<String, Codebase>,
    /// Trigger templates by name, `None` for a template without resources.
    pub templates: HashMap<String, Option<RawResource>>,
    pub jobs: Vec<Job>,
    pub apps: Vec<DynamicObject>,

    pub submissions: Vec<Submission>,
    pub releases: Vec<String>,
    pub patches: Vec<(String, Value)>,
    pub deletes: Vec<String>,
    /// Fail every job listing and submission, as an unreachable API would.
    pub failing: bool,
    /// Fail job submissions only.
    pub failing_submissions: bool,
    /// The indices of the job listing pages to fail, counted over all page requests.
    pub failing_pages: Vec<usize>,
    /// The number of job listing pages requested.
    pub pages: usize,
    clock: i64,
}

impl State {
    /// The next creation timestamp, strictly increasing.
    pub fn tick(&mut self) -> DateTime<Utc> {
        self.clock += 1;
        Utc.timestamp(1_600_000_000, 0) + Duration::seconds(self.clock)
    }

    /// The total number of writes served by this cluster.
    pub fn writes(&self) -> usize {
        self.submissions.len() + self.releases.len() + self.patches.len() + self.deletes.len()
    }
}

/// An in-memory cluster.
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<State>>,
}

impl FakeCluster {
    /// A cluster holding the `mypipe` pipeline with the given applications, each with an input
    /// stream named `{app}-main`, and its `dev` stage rendering a non-empty trigger template.
    pub fn with_pipeline(applications: &[&str]) -> Self {
        let cluster = Self::default();
        {
            let mut state = cluster.state();
            state.pipelines.insert(PIPELINE.into(), pipeline(applications));
            state.stages.insert(STAGE_KEY.into(), stage(&[]));
            state
                .templates
                .insert(TEMPLATE.into(), Some(RawResource(r#"{"apiVersion":"tekton.dev/v1","kind":"PipelineRun"}"#.into())));
            for app in applications {
                state.streams.insert(format!("{}-main", app), image_stream(app, &[]));
            }
        }
        cluster
    }

    /// Lock the state of this cluster.
    pub fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// The backends of this cluster.
    pub fn backends(&self) -> Backends {
        let this = Arc::new(self.clone());
        Backends {
            catalog: this.clone(),
            jobs: this.clone(),
            templates: this.clone(),
            apps: this.clone(),
            requests: this,
        }
    }

    /// Add a job to this cluster, created after every job added so far.
    pub fn add_job(&self, name: &str, request: &str, held: bool, done: bool) {
        let mut state = self.state();
        let created = state.tick();
        state.jobs.push(Job {
            name: name.into(),
            labels: job_labels(request),
            held,
            created: Some(created),
            done,
            succeeded: done,
            reason: None,
            payload: None,
        });
    }

    /// Mark the named job as finished.
    pub fn finish_job(&self, name: &str, succeeded: bool) {
        let mut state = self.state();
        if let Some(job) = state.jobs.iter_mut().find(|job| job.name == name) {
            job.held = false;
            job.done = true;
            job.succeeded = succeeded;
            job.reason = Some(if succeeded { "Succeeded".into() } else { "Failed".into() });
        }
    }

    /// The named job.
    pub fn job(&self, name: &str) -> Option<Job> {
        self.state().jobs.iter().find(|job| job.name == name).cloned()
    }

    /// Set the tags of the named stream, created in the given order.
    pub fn set_stream_tags(&self, stream: &str, tags: &[&str]) {
        let mut state = self.state();
        let tags: Vec<_> = tags
            .iter()
            .map(|tag| ImageTag {
                name: tag.to_string(),
                created: state.tick(),
            })
            .collect();
        if let Some(stream) = state.streams.get_mut(stream) {
            stream.spec.tags = tags;
        }
    }

    /// Record the given stable tags on the stage.
    pub fn set_stable_tags(&self, tags: &[(&str, &str)]) {
        self.state().stages.insert(STAGE_KEY.into(), stage(tags));
    }
}

fn job_labels(request: &str) -> Labels {
    maplit::btreemap! {
        LABEL_PIPELINE.into() => PIPELINE.into(),
        LABEL_STAGE_KEY.into() => STAGE_KEY.into(),
        LABEL_DEPLOY_REQUEST.into() => request.into(),
    }
}

fn matches(labels: Option<&Labels>, selector: &Labels) -> bool {
    selector
        .iter()
        .all(|(key, val)| labels.and_then(|labels| labels.get(key)) == Some(val))
}

pub fn request(name: &str, trigger_type: TriggerType, codebase: &str, tag: &str) -> DeployRequest {
    let mut request = DeployRequest::new(
        name,
        DeployRequestSpec {
            pipeline: PIPELINE.into(),
            stage: STAGE.into(),
            tag: CodebaseTag {
                codebase: codebase.into(),
                tag: tag.into(),
            },
            trigger_type,
        },
    );
    request.metadata.namespace = Some("default".into());
    request
}

pub fn request_with_status(name: &str, trigger_type: TriggerType, status: DeployStatus) -> DeployRequest {
    let mut request = request(name, trigger_type, "a", "1.0");
    request.set_status(status, "");
    request
}

pub fn pipeline(applications: &[&str]) -> Pipeline {
    Pipeline::new(
        PIPELINE,
        PipelineSpec {
            name: PIPELINE.into(),
            applications: applications.iter().map(|app| app.to_string()).collect(),
            input_streams: applications.iter().map(|app| format!("{}-main", app)).collect(),
        },
    )
}

pub fn stage(stable_tags: &[(&str, &str)]) -> Stage {
    let mut stage = Stage::new(
        STAGE_KEY,
        StageSpec {
            name: STAGE.into(),
            pipeline: PIPELINE.into(),
            trigger_template: TEMPLATE.into(),
            cluster: "in-cluster".into(),
        },
    );
    stage.metadata.annotations = Some(
        stable_tags
            .iter()
            .map(|(app, tag)| (format!("{}{}", stagedeploy_core::crd::STABLE_TAG_ANNOTATION_PREFIX, app), tag.to_string()))
            .collect(),
    );
    stage
}

pub fn image_stream(codebase: &str, tags: &[&str]) -> ImageStream {
    ImageStream::new(
        &format!("{}-main", codebase),
        ImageStreamSpec {
            codebase: codebase.into(),
            image_name: format!("registry.local/{}", codebase),
            tags: tags
                .iter()
                .enumerate()
                .map(|(idx, tag)| ImageTag {
                    name: tag.to_string(),
                    created: Utc.timestamp(1_500_000_000 + idx as i64, 0),
                })
                .collect(),
        },
    )
}

pub fn codebase(name: &str, type_: VersioningType) -> Codebase {
    Codebase::new(
        name,
        CodebaseSpec {
            versioning: Versioning { type_, start_from: None },
        },
    )
}

/// An Argo CD application deploying the given codebase on the `dev` stage.
pub fn gitops_app(name: &str, codebase: &str) -> Result<DynamicObject> {
    let labels: Labels = maplit::btreemap! {
        LABEL_APP_NAME.into() => codebase.into(),
        LABEL_PIPELINE.into() => PIPELINE.into(),
        LABEL_STAGE.into() => STAGE.into(),
    };
    Ok(serde_json::from_value(json!({
        "apiVersion": "argoproj.io/v1alpha1",
        "kind": "Application",
        "metadata": {
            "name": name,
            "namespace": "default",
            "labels": labels,
        },
        "spec": {
            "project": "default",
            "destination": {"namespace": "dev", "server": "https://kubernetes.default.svc"},
            "source": {
                "repoURL": "https://git.local/deploy.git",
                "path": "deploy-templates",
                "targetRevision": "0.9",
                "helm": {
                    "releaseName": codebase,
                    "parameters": [
                        {"name": "image.repository", "value": format!("registry.local/{}", codebase)},
                        {"name": "image.tag", "value": "0.9"},
                    ],
                },
            },
        },
    }))?)
}

#[async_trait]
impl Catalog for FakeCluster {
    async fn pipeline(&self, name: &str) -> Result<Pipeline> {
        match self.state().pipelines.get(name) {
            Some(pipeline) => Ok(pipeline.clone()),
            None => bail!("pipeline {} not found", name),
        }
    }

    async fn stage(&self, name: &str) -> Result<Stage> {
        match self.state().stages.get(name) {
            Some(stage) => Ok(stage.clone()),
            None => bail!("stage {} not found", name),
        }
    }

    async fn image_stream(&self, name: &str) -> Result<ImageStream> {
        match self.state().streams.get(name) {
            Some(stream) => Ok(stream.clone()),
            None => bail!("image stream {} not found", name),
        }
    }

    async fn codebase(&self, name: &str) -> Result<Option<Codebase>> {
        Ok(self.state().codebases.get(name).cloned())
    }
}

#[async_trait]
impl JobStore for FakeCluster {
    async fn list_jobs_page(&self, selector: &Labels, limit: u32, continue_token: Option<String>) -> Result<JobPage> {
        let mut state = self.state();
        if state.failing {
            bail!("connection refused");
        }
        let page = state.pages;
        state.pages += 1;
        if state.failing_pages.contains(&page) {
            bail!("connection reset");
        }
        let offset = match continue_token {
            Some(token) => token.parse::<usize>()?,
            None => 0,
        };
        let matching: Vec<Job> = state.jobs.iter().filter(|job| matches(Some(&job.labels), selector)).cloned().collect();
        let end = matching.len().min(offset + limit as usize);
        let jobs = matching.get(offset..end).map(<[Job]>::to_vec).unwrap_or_default();
        let continue_token = if end < matching.len() { Some(end.to_string()) } else { None };
        Ok(JobPage { jobs, continue_token })
    }

    async fn release_job(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        state.releases.push(name.into());
        if let Some(job) = state.jobs.iter_mut().find(|job| job.name == name) {
            job.held = false;
        }
        Ok(())
    }
}

#[async_trait]
impl TriggerTemplates for FakeCluster {
    async fn render(&self, template: &str) -> Result<RawResource> {
        match self.state().templates.get(template) {
            Some(Some(resource)) => Ok(resource.clone()),
            Some(None) => Err(AppError::EmptyTemplate(template.into()).into()),
            None => bail!("trigger template {} not found", template),
        }
    }

    async fn submit(&self, submission: JobSubmission<'_>) -> Result<()> {
        let mut state = self.state();
        if state.failing || state.failing_submissions {
            bail!("connection refused");
        }
        let name = format!("{}-run-{}", submission.request, state.submissions.len());
        let created = state.tick();
        state.jobs.push(Job {
            name: name.clone(),
            labels: submission.labels.clone(),
            held: submission.held,
            created: Some(created),
            done: false,
            succeeded: false,
            reason: None,
            payload: Some(submission.payload.into()),
        });
        state.submissions.push(Submission {
            request: submission.request.into(),
            job: name,
            payload: serde_json::from_str(submission.payload)?,
            stage: submission.stage.into(),
            cluster: submission.cluster.into(),
            held: submission.held,
        });
        Ok(())
    }
}

#[async_trait]
impl GitOpsApps for FakeCluster {
    async fn list_apps(&self, selector: &Labels) -> Result<Vec<DynamicObject>> {
        Ok(self
            .state()
            .apps
            .iter()
            .filter(|app| matches(app.metadata.labels.as_ref(), selector))
            .cloned()
            .collect())
    }

    async fn patch_app(&self, name: &str, patch: &Value) -> Result<()> {
        let mut state = self.state();
        state.patches.push((name.into(), patch.clone()));
        if let Some(app) = state.apps.iter_mut().find(|app| app.metadata.name.as_deref() == Some(name)) {
            json_patch::merge(&mut app.data, patch);
        }
        Ok(())
    }
}

#[async_trait]
impl DeployRequests for FakeCluster {
    async fn delete_request(&self, name: &str) -> Result<()> {
        self.state().deletes.push(name.into());
        Ok(())
    }
}
