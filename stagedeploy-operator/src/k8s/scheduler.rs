//! Scheduler logic for driving DeployRequests through their handler chains.
//!
//! ## Overview
//! Every pass over a request follows the same steps:
//!
//! - Fetch the latest version of the request from the K8s API. The cached copy is only used to
//!   decide which requests to visit, never as the input of a pass.
//! - Run the handler chain of the request's trigger type against it. Handlers mutate only the
//!   in-memory status of the request.
//! - Commit the status, if it changed, using the `resourceVersion` observed in the first step.
//!   K8s rejects the write if the request was modified in the meantime, in which case the pass
//!   is simply run again against the fresh object.
//!
//! ## Failures
//! When the chain fails, the status committed depends on where the request was. A request
//! which has not yet submitted a job becomes `failed`, and is retried from scratch by the next
//! pass. A request which already has a job keeps its status value, so that no second job is
//! ever submitted for it, and only its message records the error.

use std::sync::Arc;

use anyhow::{Context, Result};
use kube::api::{Api, PostParams};
use tokio::time::timeout;

use crate::deploy::{chain_for, record_chain_error};
use crate::k8s::{Controller, API_TIMEOUT};
use stagedeploy_core::crd::{DeployRequest, DeployStatus, RequiredMetadata};
use stagedeploy_core::prom::{METRIC_CHAIN_ERRORS, METRIC_CHAIN_PASSES, METRIC_REQUESTS_COMPLETED, METRIC_STATUS_CONFLICTS};

/// A scheduling task to be performed.
#[derive(Debug)]
#[allow(clippy::large_enum_variant)] // Arcs vs DeployRequest.
pub enum SchedulerTask {
    RequestUpdated(Arc<String>),
    RequestDeleted(Arc<String>, DeployRequest),
}

/// The outcome of a status write.
enum StatusWrite {
    /// The status was committed.
    Written(DeployRequest),
    /// The request was modified since it was read.
    Conflict,
    /// The request no longer exists.
    Gone,
}

impl Controller {
    /// Handle scheduler tasks.
    pub(super) async fn handle_scheduler_task(&mut self, task: SchedulerTask) {
        match task {
            SchedulerTask::RequestUpdated(name) => self.scheduler_request_updated(name).await,
            SchedulerTask::RequestDeleted(name, request) => self.scheduler_request_deleted(name, request).await,
        }
    }
}

//////////////////////////////////////////////////////////////////////////////
// DeployRequest Reconciliation //////////////////////////////////////////////
impl Controller {
    #[tracing::instrument(level = "debug", skip(self, name), fields(request = %name))]
    async fn scheduler_request_updated(&mut self, name: Arc<String>) {
        tracing::debug!("handling scheduler request updated");
        let mut request = match self.fetch_request(name.as_str()).await {
            Ok(Some(request)) => request,
            Ok(None) => {
                tracing::debug!("request no longer exists");
                self.requests.remove(&name);
                return;
            }
            Err(err) => {
                tracing::error!(error = ?err, "error fetching deploy request");
                self.spawn_scheduler_task(SchedulerTask::RequestUpdated(name), true);
                return;
            }
        };

        let initial = request.status.clone();
        let initial_value = request.status_value();
        let chain = chain_for(request.spec.trigger_type, &self.backends, &self.settings);
        metrics::increment_counter!(METRIC_CHAIN_PASSES);
        let res = chain.serve(&mut request).await;
        let is_err = res.is_err();
        if let Err(err) = res {
            metrics::increment_counter!(METRIC_CHAIN_ERRORS);
            tracing::error!(error = ?err, initial = %initial_value, status = %request.status_value(), "error serving deploy request");
            record_chain_error(&mut request, &err);
        }

        let value = request.status_value();
        let completed_now = initial_value != DeployStatus::Completed && value == DeployStatus::Completed;
        if completed_now {
            metrics::increment_counter!(METRIC_REQUESTS_COMPLETED);
            tracing::info!(stage = %request.stage_key(), "deploy request completed");
            self.nudge_stage(&request);
        }

        // A completed request which passed its chain cleanly has been deleted by it.
        let deleted = !is_err && value == DeployStatus::Completed;
        if !deleted && request.status != initial {
            match self.persist_status(&request).await {
                Ok(StatusWrite::Written(request)) => {
                    self.requests.insert(name.clone(), request);
                }
                Ok(StatusWrite::Conflict) => {
                    metrics::increment_counter!(METRIC_STATUS_CONFLICTS);
                    tracing::debug!("conflicting write on deploy request status, running a fresh pass");
                    self.spawn_scheduler_task(SchedulerTask::RequestUpdated(name), false);
                    return;
                }
                Ok(StatusWrite::Gone) => {
                    self.requests.remove(&name);
                    return;
                }
                Err(err) => {
                    tracing::error!(error = ?err, "error writing deploy request status");
                    self.spawn_scheduler_task(SchedulerTask::RequestUpdated(name), true);
                    return;
                }
            }
        }

        if is_err {
            self.spawn_scheduler_task(SchedulerTask::RequestUpdated(name), true);
        }
    }

    #[tracing::instrument(level = "debug", skip(self, name, request), fields(request = %name))]
    async fn scheduler_request_deleted(&mut self, name: Arc<String>, request: DeployRequest) {
        tracing::debug!("handling scheduler request deleted");
        if request.status_value() == DeployStatus::InQueue {
            tracing::warn!(
                stage = %request.stage_key(),
                "deploy request deleted while its job was queued, the held job must be removed for the stage queue to progress"
            );
        }
        // Freeing a stage may unblock the next request in its queue.
        self.nudge_stage(&request);
    }

    /// Schedule a pass for every other known request of the given request's stage.
    fn nudge_stage(&self, request: &DeployRequest) {
        let stage_key = request.stage_key();
        self.requests
            .iter()
            .filter(|(name, other)| name.as_str() != request.name() && other.stage_key() == stage_key)
            .for_each(|(name, _)| self.spawn_scheduler_task(SchedulerTask::RequestUpdated(name.clone()), false));
    }
}

//////////////////////////////////////////////////////////////////////////////
// K8s API Methods ///////////////////////////////////////////////////////////
impl Controller {
    /// Fetch the latest version of the named request, `None` if it does not exist.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn fetch_request(&self, name: &str) -> Result<Option<DeployRequest>> {
        let api: Api<DeployRequest> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let res = timeout(API_TIMEOUT, api.get(name))
            .await
            .context("timeout while fetching deploy request")?;
        match res {
            Ok(request) => Ok(Some(request)),
            Err(err) => match err {
                kube::Error::Api(api_err) if api_err.code == http::StatusCode::NOT_FOUND => Ok(None),
                _ => Err(err).context("error fetching deploy request"),
            },
        }
    }

    /// Replace the status of the given request, guarded by its `resourceVersion`.
    #[tracing::instrument(level = "debug", skip(self, request), fields(request = request.name()))]
    async fn persist_status(&self, request: &DeployRequest) -> Result<StatusWrite> {
        tracing::info!(status = %request.status_value(), "updating deploy request status");
        let api: Api<DeployRequest> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let data = serde_json::to_vec(request).context("error serializing deploy request")?;
        let res = timeout(API_TIMEOUT, api.replace_status(request.name(), &PostParams::default(), data))
            .await
            .context("timeout while updating deploy request status")?;
        match res {
            Ok(request) => Ok(StatusWrite::Written(request)),
            Err(err) => match err {
                kube::Error::Api(api_err) if api_err.code == http::StatusCode::CONFLICT => Ok(StatusWrite::Conflict),
                kube::Error::Api(api_err) if api_err.code == http::StatusCode::NOT_FOUND => Ok(StatusWrite::Gone),
                _ => Err(err).context("error updating deploy request status"),
            },
        }
    }
}
