use anyhow::Result;
use kube::api::DynamicObject;
use maplit::btreemap;
use serde_json::{json, Value};

use super::templates::{first_resource_template, prepare_job};
use crate::deploy::{JobSubmission, RawResource, ANNOTATION_PAYLOAD, LABEL_DEPLOY_REQUEST, LABEL_PIPELINE, LABEL_STAGE_KEY};
use stagedeploy_core::error::AppError;

const PAYLOAD: &str = r#"{"a":{"imageTag":"1.1"}}"#;

fn raw_run() -> RawResource {
    let run = json!({
        "apiVersion": "tekton.dev/v1",
        "kind": "PipelineRun",
        "metadata": {"labels": {"team": "platform"}},
        "spec": {
            "pipelineRef": {"name": "deploy-$(tt.params.CDPIPELINE)"},
            "params": [
                {"name": "CDPIPELINE", "value": "$(tt.params.CDPIPELINE)"},
                {"name": "CDSTAGE", "value": "$(tt.params.CDSTAGE)"},
                {"name": "KUBECONFIG_SECRET_NAME", "value": "$(tt.params.KUBECONFIG_SECRET_NAME)"},
                {"name": "APPLICATIONS_PAYLOAD", "value": "$(tt.params.APPLICATIONS_PAYLOAD)"},
            ],
        },
    });
    RawResource(run.to_string())
}

fn submission<'a>(resource: &'a RawResource, held: bool) -> JobSubmission<'a> {
    JobSubmission {
        request: "req-0",
        resource,
        payload: PAYLOAD,
        pipeline: "mypipe",
        stage: "dev",
        labels: btreemap! {
            LABEL_PIPELINE.into() => "mypipe".into(),
            LABEL_STAGE_KEY.into() => "mypipe-dev".into(),
            LABEL_DEPLOY_REQUEST.into() => "req-0".into(),
        },
        cluster: "in-cluster",
        held,
    }
}

fn param<'a>(job: &'a DynamicObject, name: &str) -> Option<&'a Value> {
    job.data
        .pointer("/spec/params")
        .and_then(|params| params.as_array())
        .and_then(|params| params.iter().find(|param| param["name"] == name))
        .map(|param| &param["value"])
}

#[test]
fn prepare_job_substitutes_params() -> Result<()> {
    let resource = raw_run();
    let job = prepare_job(&submission(&resource, false), "ns")?;

    assert_eq!(param(&job, "CDPIPELINE"), Some(&json!("mypipe")));
    assert_eq!(param(&job, "CDSTAGE"), Some(&json!("dev")));
    assert_eq!(param(&job, "KUBECONFIG_SECRET_NAME"), Some(&json!("in-cluster")));
    assert_eq!(
        job.data.pointer("/spec/pipelineRef/name"),
        Some(&json!("deploy-mypipe")),
        "expected params embedded in larger strings to be substituted"
    );
    let payload = param(&job, "APPLICATIONS_PAYLOAD").and_then(|val| val.as_str()).unwrap_or_default();
    let payload: Value = serde_json::from_str(payload)?;
    assert!(
        payload == json!({"a": {"imageTag": "1.1"}}),
        "unexpected value parsed for payload, got {}, expected {}",
        payload,
        PAYLOAD
    );
    Ok(())
}

#[test]
fn prepare_job_sets_metadata() -> Result<()> {
    let resource = raw_run();
    let job = prepare_job(&submission(&resource, false), "ns")?;

    assert_eq!(job.metadata.namespace.as_deref(), Some("ns"));
    assert_eq!(job.metadata.name, None);
    assert_eq!(job.metadata.generate_name.as_deref(), Some("mypipe-dev-"));
    let labels = job.metadata.labels.clone().unwrap_or_default();
    assert_eq!(labels.get(LABEL_PIPELINE).map(String::as_str), Some("mypipe"));
    assert_eq!(labels.get(LABEL_STAGE_KEY).map(String::as_str), Some("mypipe-dev"));
    assert_eq!(labels.get(LABEL_DEPLOY_REQUEST).map(String::as_str), Some("req-0"));
    assert_eq!(labels.get("team").map(String::as_str), Some("platform"), "expected template labels to be kept");
    assert_eq!(labels.get("app").map(String::as_str), Some("stagedeploy"));
    assert!(job.data.pointer("/spec/status").is_none(), "expected runnable job to carry no spec.status");
    let annotations = job.metadata.annotations.clone().unwrap_or_default();
    assert_eq!(
        annotations.get(ANNOTATION_PAYLOAD).map(String::as_str),
        Some(PAYLOAD),
        "expected the submitted payload to be recorded on the job"
    );
    Ok(())
}

#[test]
fn prepare_job_keeps_template_name() -> Result<()> {
    let resource = RawResource(
        json!({"apiVersion": "tekton.dev/v1", "kind": "PipelineRun", "metadata": {"name": "fixed"}, "spec": {}}).to_string(),
    );
    let job = prepare_job(&submission(&resource, false), "ns")?;

    assert_eq!(job.metadata.name.as_deref(), Some("fixed"));
    assert_eq!(job.metadata.generate_name, None);
    Ok(())
}

#[test]
fn prepare_job_holds_job() -> Result<()> {
    let resource = raw_run();
    let job = prepare_job(&submission(&resource, true), "ns")?;
    assert_eq!(job.data.pointer("/spec/status"), Some(&json!("PipelineRunPending")));

    let resource = RawResource(json!({"apiVersion": "tekton.dev/v1", "kind": "PipelineRun"}).to_string());
    let job = prepare_job(&submission(&resource, true), "ns")?;
    assert_eq!(
        job.data.pointer("/spec/status"),
        Some(&json!("PipelineRunPending")),
        "expected spec to be created for a held job without one"
    );
    Ok(())
}

#[test]
fn prepare_job_rejects_invalid_resources() {
    let resource = RawResource("[1, 2]".into());
    assert!(prepare_job(&submission(&resource, false), "ns").is_err(), "expected a non-object resource to be rejected");

    let resource = RawResource("{not json".into());
    assert!(prepare_job(&submission(&resource, false), "ns").is_err(), "expected invalid JSON to be rejected");
}

#[test]
fn first_resource_template_is_selected() -> Result<()> {
    let template: DynamicObject = serde_json::from_value(json!({
        "apiVersion": "triggers.tekton.dev/v1beta1",
        "kind": "TriggerTemplate",
        "metadata": {"name": "deploy"},
        "spec": {"resourcetemplates": [{"kind": "PipelineRun"}, {"kind": "TaskRun"}]},
    }))?;
    let raw = first_resource_template("deploy", &template)?;
    let parsed: Value = serde_json::from_str(&raw.0)?;
    assert_eq!(parsed, json!({"kind": "PipelineRun"}));
    Ok(())
}

#[test]
fn empty_template_is_nothing_to_deploy() -> Result<()> {
    for spec in [json!({"resourcetemplates": []}), json!({})] {
        let template: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "triggers.tekton.dev/v1beta1",
            "kind": "TriggerTemplate",
            "metadata": {"name": "deploy"},
            "spec": spec,
        }))?;
        let err = match first_resource_template("deploy", &template) {
            Ok(raw) => panic!("expected empty template error, got {:?}", raw),
            Err(err) => err,
        };
        assert!(AppError::is_nothing_to_deploy(&err), "expected EmptyTemplate, got {:#}", err);
    }
    Ok(())
}
