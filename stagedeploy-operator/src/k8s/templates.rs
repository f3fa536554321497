//! Tekton Triggers backed job rendering and submission.

use anyhow::{Context, Result};
use async_trait::async_trait;
use kube::api::{DynamicObject, PostParams};
use serde_json::Value;
use tokio::time::timeout;

use crate::deploy::{JobSubmission, RawResource, TriggerTemplates, ANNOTATION_PAYLOAD, PIPELINE_RUN_PENDING};
use crate::k8s::{set_canonical_labels, KubeCluster, API_TIMEOUT};
use stagedeploy_core::error::AppError;

const PARAM_PIPELINE: &str = "$(tt.params.CDPIPELINE)";
const PARAM_STAGE: &str = "$(tt.params.CDSTAGE)";
const PARAM_KUBECONFIG: &str = "$(tt.params.KUBECONFIG_SECRET_NAME)";
const PARAM_PAYLOAD: &str = "$(tt.params.APPLICATIONS_PAYLOAD)";

#[async_trait]
impl TriggerTemplates for KubeCluster {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn render(&self, template: &str) -> Result<RawResource> {
        let obj = timeout(API_TIMEOUT, self.trigger_templates_api().get(template))
            .await
            .context("timeout while fetching TriggerTemplate")?
            .with_context(|| format!("error fetching TriggerTemplate {}", template))?;
        first_resource_template(template, &obj)
    }

    #[tracing::instrument(level = "debug", skip(self, submission), fields(request = submission.request))]
    async fn submit(&self, submission: JobSubmission<'_>) -> Result<()> {
        let job = prepare_job(&submission, self.namespace())?;
        let created = timeout(API_TIMEOUT, self.pipeline_runs_api().create(&PostParams::default(), &job))
            .await
            .context("timeout while creating PipelineRun")?
            .context("error creating PipelineRun")?;
        tracing::info!(name = ?created.metadata.name, held = submission.held, "PipelineRun created");
        Ok(())
    }
}

/// Extract the first entry of the template's `spec.resourcetemplates`.
pub(super) fn first_resource_template(template: &str, obj: &DynamicObject) -> Result<RawResource> {
    let first = obj
        .data
        .pointer("/spec/resourcetemplates")
        .and_then(|templates| templates.as_array())
        .and_then(|templates| templates.first())
        .ok_or_else(|| AppError::EmptyTemplate(template.into()))?;
    let raw = serde_json::to_string(first).context("error serializing resource template")?;
    Ok(RawResource(raw))
}

/// Build the job object to create for the given submission.
///
/// Template parameters are substituted in the raw text, with their values escaped for inclusion
/// in a JSON string.
pub(super) fn prepare_job(submission: &JobSubmission<'_>, namespace: &str) -> Result<DynamicObject> {
    let raw = [
        (PARAM_PIPELINE, submission.pipeline),
        (PARAM_STAGE, submission.stage),
        (PARAM_KUBECONFIG, submission.cluster),
        (PARAM_PAYLOAD, submission.payload),
    ]
    .iter()
    .try_fold(submission.resource.0.clone(), |raw, (param, value)| {
        json_escape(value).map(|escaped| raw.replace(param, &escaped))
    })?;

    let mut data: Value = serde_json::from_str(&raw).context("rendered job is not valid JSON")?;
    match data.as_object_mut() {
        Some(obj) => {
            obj.entry("metadata").or_insert_with(|| serde_json::json!({}));
        }
        None => return Err(AppError::InvalidInput("rendered job is not a JSON object".into()).into()),
    }
    let mut job: DynamicObject = serde_json::from_value(data).context("rendered job is not a valid K8s object")?;

    job.metadata.namespace = Some(namespace.into());
    if job.metadata.name.as_deref().map(str::is_empty).unwrap_or(true) {
        job.metadata.name = None;
        job.metadata.generate_name = Some(format!("{}-{}-", submission.pipeline, submission.stage));
    }
    let labels = job.metadata.labels.get_or_insert_with(Default::default);
    labels.extend(submission.labels.clone());
    set_canonical_labels(labels);
    job.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(ANNOTATION_PAYLOAD.into(), submission.payload.into());

    if submission.held {
        match job.data.get_mut("spec").and_then(|spec| spec.as_object_mut()) {
            Some(spec) => {
                spec.insert("status".into(), PIPELINE_RUN_PENDING.into());
            }
            None => {
                job.data["spec"] = serde_json::json!({ "status": PIPELINE_RUN_PENDING });
            }
        }
    }
    Ok(job)
}

/// Escape a value for inclusion inside of a JSON string literal.
fn json_escape(value: &str) -> Result<String> {
    let quoted = serde_json::to_string(value).context("error escaping template parameter")?;
    Ok(quoted[1..quoted.len() - 1].to_string())
}
