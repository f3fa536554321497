//! DeployRequest CRD.
//!
//! A DeployRequest asks the operator to roll a single codebase image tag into a pipeline
//! stage. The operator drives it through the following states:
//!
//! ```text
//! pending ──> in-queue ──> running ──> completed
//!    │                        ▲
//!    └────────────────────────┘
//! failed ──> (re-enters as pending)
//! ```
//!
//! Initiation handlers only act on `pending` & `failed` requests, while queue and poll handlers
//! only act on `in-queue` & `running` requests. This partition is what makes re-running the
//! full handler chain on any request safe.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::RequiredMetadata;

pub type DeployRequest = DeployRequestCRD; // Mostly to resolve a Rust Analyzer issue.

/// CRD spec for the DeployRequest resource.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    struct = "DeployRequestCRD",
    status = "DeployRequestStatus",
    group = "stagedeploy.rs",
    version = "v1",
    kind = "DeployRequest",
    namespaced,
    derive = "PartialEq",
    shortname = "deployreq",
    printcolumn = r#"{"name":"Pipeline","type":"string","jsonPath":".spec.pipeline"}"#,
    printcolumn = r#"{"name":"Stage","type":"string","jsonPath":".spec.stage"}"#,
    printcolumn = r#"{"name":"Codebase","type":"string","jsonPath":".spec.tag.codebase"}"#,
    printcolumn = r#"{"name":"Tag","type":"string","jsonPath":".spec.tag.tag"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.value"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequestSpec {
    /// The name of the target pipeline.
    pub pipeline: String,
    /// The name of the target stage within the pipeline.
    pub stage: String,
    /// The codebase image tag being promoted.
    pub tag: CodebaseTag,
    /// The payload resolution strategy to use.
    #[serde(default)]
    pub trigger_type: TriggerType,
}

/// A single codebase image tag.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub struct CodebaseTag {
    /// The name of the codebase.
    pub codebase: String,
    /// The image tag of the codebase.
    pub tag: String,
}

/// The payload resolution strategy of a DeployRequest.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum TriggerType {
    /// Deploy the latest tag of every application, releasing the job immediately.
    Auto,
    /// Deploy the promoted tag while keeping the stable tags of all other applications.
    ///
    /// Jobs of this type are submitted held and released in arrival order.
    AutoStable,
}

impl Default for TriggerType {
    fn default() -> Self {
        Self::Auto
    }
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Auto => "Auto",
                Self::AutoStable => "AutoStable",
            }
        )
    }
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct DeployRequestStatus {
    /// The current state of the request.
    #[serde(default)]
    pub value: DeployStatus,
    /// A human readable message describing the last transition or failure.
    #[serde(default)]
    pub message: String,
}

/// The states of a DeployRequest.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum DeployStatus {
    /// Newly created, nothing has been submitted yet.
    Pending,
    /// A held job has been submitted and is waiting for its turn.
    InQueue,
    /// A job is executing.
    Running,
    /// The request has been served.
    Completed,
    /// The last initiation attempt failed; retried from scratch.
    Failed,
}

impl Default for DeployStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl DeployStatus {
    /// Whether initiation handlers may act on a request in this state.
    pub fn can_initiate(self) -> bool {
        matches!(self, Self::Pending | Self::Failed)
    }

    /// Whether a job exists for a request in this state which still needs to be tracked.
    pub fn awaits_job(self) -> bool {
        matches!(self, Self::InQueue | Self::Running)
    }
}

impl std::fmt::Display for DeployStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Pending => "pending",
                Self::InQueue => "in-queue",
                Self::Running => "running",
                Self::Completed => "completed",
                Self::Failed => "failed",
            }
        )
    }
}

impl DeployRequestCRD {
    /// The canonical key of the target stage, `{pipeline}-{stage}`.
    ///
    /// This is the name of the Stage object and the value of the stage label on jobs.
    pub fn stage_key(&self) -> String {
        format!("{}-{}", self.spec.pipeline, self.spec.stage)
    }

    /// The current status value, where a missing status reads as `pending`.
    pub fn status_value(&self) -> DeployStatus {
        self.status.as_ref().map(|status| status.value).unwrap_or_default()
    }

    /// Transition this request to the given state.
    pub fn set_status(&mut self, value: DeployStatus, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(request = self.name(), from = %self.status_value(), to = %value, %message, "deploy request transition");
        self.status = Some(DeployRequestStatus { value, message });
    }

    /// Update the status message, keeping the current state.
    pub fn set_message(&mut self, message: impl Into<String>) {
        let value = self.status_value();
        self.status = Some(DeployRequestStatus {
            value,
            message: message.into(),
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn request(pipeline: &str, stage: &str) -> DeployRequest {
        DeployRequest::new(
            "req-0",
            DeployRequestSpec {
                pipeline: pipeline.into(),
                stage: stage.into(),
                tag: CodebaseTag {
                    codebase: "app".into(),
                    tag: "1.0".into(),
                },
                trigger_type: TriggerType::Auto,
            },
        )
    }

    #[test]
    fn stage_key_joins_pipeline_and_stage() {
        let req = request("mypipe", "dev");
        assert_eq!(req.stage_key(), "mypipe-dev", "unexpected stage key");
    }

    #[test]
    fn missing_status_reads_as_pending() {
        let req = request("mypipe", "dev");
        assert_eq!(req.status_value(), DeployStatus::Pending, "expected missing status to read as pending");
        assert!(req.status_value().can_initiate(), "expected pending request to be initiable");
    }

    #[test]
    fn set_message_keeps_value() {
        let mut req = request("mypipe", "dev");
        req.set_status(DeployStatus::Running, "");
        req.set_message("lost connection");
        let status = req.status.as_ref().cloned().unwrap_or_default();
        assert_eq!(status.value, DeployStatus::Running, "expected value to be kept");
        assert_eq!(status.message, "lost connection", "expected message to be updated");
    }

    #[test]
    fn guard_partition_is_disjoint() {
        let all = [
            DeployStatus::Pending,
            DeployStatus::InQueue,
            DeployStatus::Running,
            DeployStatus::Completed,
            DeployStatus::Failed,
        ];
        for status in all {
            assert!(
                !(status.can_initiate() && status.awaits_job()),
                "status {} is claimed by both handler categories",
                status
            );
        }
        assert!(!DeployStatus::Completed.can_initiate() && !DeployStatus::Completed.awaits_job());
    }

    #[test]
    fn status_serializes_kebab_case() -> anyhow::Result<()> {
        let status = DeployRequestStatus {
            value: DeployStatus::InQueue,
            message: String::new(),
        };
        let json = serde_json::to_value(&status)?;
        assert_eq!(json["value"], "in-queue", "unexpected wire format {}", json);
        let parsed: DeployRequestStatus = serde_json::from_value(serde_json::json!({"value": "completed"}))?;
        assert_eq!(parsed.value, DeployStatus::Completed);
        assert!(parsed.message.is_empty());
        Ok(())
    }
}
