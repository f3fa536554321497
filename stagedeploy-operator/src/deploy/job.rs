//! The pipeline engine's view of a deploy job.

use chrono::{DateTime, Utc};
use kube::api::DynamicObject;

use crate::deploy::{Labels, ANNOTATION_PAYLOAD, LABEL_DEPLOY_REQUEST};

/// The execution status under which the engine holds a submitted job.
pub const PIPELINE_RUN_PENDING: &str = "PipelineRunPending";
/// The condition type reporting the outcome of a job.
const CONDITION_SUCCEEDED: &str = "Succeeded";
/// The condition status of a job which has not finished.
const CONDITION_STATUS_UNKNOWN: &str = "Unknown";

/// A deploy job, as observed on the pipeline engine.
#[derive(Clone, Debug, PartialEq)]
pub struct Job {
    /// The name of the job object.
    pub name: String,
    /// The labels of the job object.
    pub labels: Labels,
    /// The job exists but will not run until released.
    pub held: bool,
    /// The creation time of the job, used for FIFO ordering.
    pub created: Option<DateTime<Utc>>,
    /// The job has finished, successfully or not.
    pub done: bool,
    /// The job finished successfully.
    pub succeeded: bool,
    /// The engine's reason for the job's current condition.
    pub reason: Option<String>,
    /// The serialized deploy payload the job was submitted with.
    pub payload: Option<String>,
}

impl Job {
    /// Build from a `PipelineRun` object.
    pub fn from_pipeline_run(run: &DynamicObject) -> Self {
        let held = run.data.pointer("/spec/status").and_then(|status| status.as_str()) == Some(PIPELINE_RUN_PENDING);
        let condition = run
            .data
            .pointer("/status/conditions")
            .and_then(|conds| conds.as_array())
            .and_then(|conds| conds.iter().find(|cond| cond.get("type").and_then(|t| t.as_str()) == Some(CONDITION_SUCCEEDED)));
        let status = condition.and_then(|cond| cond.get("status")).and_then(|status| status.as_str());
        let reason = condition
            .and_then(|cond| cond.get("reason"))
            .and_then(|reason| reason.as_str())
            .map(String::from);
        Self {
            name: run.metadata.name.clone().unwrap_or_default(),
            labels: run.metadata.labels.clone().unwrap_or_default(),
            held,
            created: run.metadata.creation_timestamp.as_ref().map(|ts| ts.0),
            done: matches!(status, Some(status) if status != CONDITION_STATUS_UNKNOWN),
            succeeded: status == Some("True"),
            reason,
            payload: run
                .metadata
                .annotations
                .as_ref()
                .and_then(|annotations| annotations.get(ANNOTATION_PAYLOAD))
                .cloned(),
        }
    }

    /// The key ordering held jobs in the admission queue.
    ///
    /// Jobs created at the same instant are ordered by name.
    pub fn queue_key(&self) -> (Option<DateTime<Utc>>, &str) {
        (self.created, self.name.as_str())
    }

    /// Check if this job was submitted by the named deploy request.
    pub fn belongs_to(&self, request: &str) -> bool {
        self.labels.get(LABEL_DEPLOY_REQUEST).map(String::as_str) == Some(request)
    }
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use serde_json::json;

    use super::*;

    fn pipeline_run(value: serde_json::Value) -> Result<DynamicObject> {
        Ok(serde_json::from_value(value)?)
    }

    #[test]
    fn held_pipeline_run_without_conditions() -> Result<()> {
        let run = pipeline_run(json!({
            "apiVersion": "tekton.dev/v1",
            "kind": "PipelineRun",
            "metadata": {
                "name": "deploy-abc",
                "creationTimestamp": "2023-01-01T00:00:00Z",
                "labels": {"stagedeploy.rs/deploy-request": "req-0"},
            },
            "spec": {"status": "PipelineRunPending"},
        }))?;
        let job = Job::from_pipeline_run(&run);
        assert!(job.held, "expected job to be held");
        assert!(!job.done, "expected job without conditions to not be done");
        assert!(job.created.is_some(), "expected creation timestamp to be parsed");
        assert!(job.belongs_to("req-0"), "expected job to belong to req-0");
        assert_eq!(job.payload, None, "expected no payload without annotation");
        assert!(!job.belongs_to("req-1"), "expected job to not belong to req-1");
        Ok(())
    }

    #[test]
    fn finished_pipeline_runs_are_done() -> Result<()> {
        for (status, succeeded) in [("True", true), ("False", false)] {
            let run = pipeline_run(json!({
                "apiVersion": "tekton.dev/v1",
                "kind": "PipelineRun",
                "metadata": {"name": "deploy-abc"},
                "status": {"conditions": [{"type": "Succeeded", "status": status, "reason": "Done"}]},
            }))?;
            let job = Job::from_pipeline_run(&run);
            assert!(job.done, "expected job with condition status {} to be done", status);
            assert_eq!(job.succeeded, succeeded, "unexpected succeeded for condition status {}", status);
            assert_eq!(job.reason.as_deref(), Some("Done"));
            assert!(!job.held);
        }
        Ok(())
    }

    #[test]
    fn submitted_payload_is_read_from_annotation() -> Result<()> {
        let run = pipeline_run(json!({
            "apiVersion": "tekton.dev/v1",
            "kind": "PipelineRun",
            "metadata": {
                "name": "deploy-abc",
                "annotations": {"stagedeploy.rs/applications-payload": r#"{"a":{"imageTag":"1.1"}}"#},
            },
        }))?;
        let job = Job::from_pipeline_run(&run);
        assert_eq!(job.payload.as_deref(), Some(r#"{"a":{"imageTag":"1.1"}}"#));
        Ok(())
    }

    #[test]
    fn running_pipeline_run_is_not_done() -> Result<()> {
        let run = pipeline_run(json!({
            "apiVersion": "tekton.dev/v1",
            "kind": "PipelineRun",
            "metadata": {"name": "deploy-abc"},
            "status": {"conditions": [{"type": "Succeeded", "status": "Unknown", "reason": "Running"}]},
        }))?;
        let job = Job::from_pipeline_run(&run);
        assert!(!job.done && !job.succeeded, "expected running job to be neither done nor succeeded");
        Ok(())
    }
}
