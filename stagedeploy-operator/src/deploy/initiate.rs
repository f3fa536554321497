//! Initiation handlers, which submit the deploy job of a request.
//!
//! Both handlers only act on `pending` and `failed` requests. "Nothing to deploy" outcomes, an
//! empty trigger template or an image stream without tags, complete the request rather than
//! failing it.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::deploy::payload::{Payload, PayloadResolver};
use crate::deploy::queue::own_job;
use crate::deploy::{request_job_labels, Catalog, DeployHandler, JobListLimits, JobStore, JobSubmission, RawResource, TriggerTemplates};
use stagedeploy_core::crd::{DeployRequest, DeployStatus, Pipeline, RequiredMetadata, Stage};
use stagedeploy_core::prom::METRIC_JOBS_SUBMITTED;
use stagedeploy_core::AppError;

/// The payload strategy and release mode of an initiation handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    /// Resolve all latest tags and submit the job runnable.
    ReleaseImmediate,
    /// Resolve the promoted tag over stable tags and submit the job held.
    EnqueueHeld,
}

/// Submits the job of `Auto` requests, released immediately.
pub struct ReleaseImmediate(Initiator);

impl ReleaseImmediate {
    /// Create a new instance.
    pub fn new(
        catalog: Arc<dyn Catalog>, templates: Arc<dyn TriggerTemplates>, jobs: Arc<dyn JobStore>, limits: JobListLimits,
        resolver: PayloadResolver,
    ) -> Self {
        Self(Initiator {
            catalog,
            templates,
            jobs,
            limits,
            resolver,
            mode: Mode::ReleaseImmediate,
        })
    }
}

#[async_trait]
impl DeployHandler for ReleaseImmediate {
    fn name(&self) -> &'static str {
        "release-immediate"
    }

    async fn handle(&self, request: &mut DeployRequest) -> Result<()> {
        self.0.initiate(request).await
    }
}

/// Submits the job of `AutoStable` requests, held until the admission queue releases it.
pub struct EnqueueHeld(Initiator);

impl EnqueueHeld {
    /// Create a new instance.
    pub fn new(
        catalog: Arc<dyn Catalog>, templates: Arc<dyn TriggerTemplates>, jobs: Arc<dyn JobStore>, limits: JobListLimits,
        resolver: PayloadResolver,
    ) -> Self {
        Self(Initiator {
            catalog,
            templates,
            jobs,
            limits,
            resolver,
            mode: Mode::EnqueueHeld,
        })
    }
}

#[async_trait]
impl DeployHandler for EnqueueHeld {
    fn name(&self) -> &'static str {
        "enqueue-held"
    }

    async fn handle(&self, request: &mut DeployRequest) -> Result<()> {
        self.0.initiate(request).await
    }
}

struct Initiator {
    catalog: Arc<dyn Catalog>,
    templates: Arc<dyn TriggerTemplates>,
    jobs: Arc<dyn JobStore>,
    limits: JobListLimits,
    resolver: PayloadResolver,
    mode: Mode,
}

impl Initiator {
    #[tracing::instrument(level = "debug", skip(self, request), fields(request = request.name(), mode = ?self.mode))]
    async fn initiate(&self, request: &mut DeployRequest) -> Result<()> {
        let status = request.status_value();
        if !status.can_initiate() {
            tracing::trace!(%status, "request already initiated");
            return Ok(());
        }
        if self.adopt_existing_job(request).await? {
            return Ok(());
        }

        let pipeline = self
            .catalog
            .pipeline(&request.spec.pipeline)
            .await
            .with_context(|| format!("error fetching pipeline {}", request.spec.pipeline))?;
        let stage_key = request.stage_key();
        let stage = self
            .catalog
            .stage(&stage_key)
            .await
            .with_context(|| format!("error fetching stage {}", stage_key))?;

        let payload = match self.resolve(request, &pipeline, &stage).await {
            Ok(payload) => payload,
            Err(err) if AppError::is_nothing_to_deploy(&err) => {
                tracing::info!(error = %err, "nothing to deploy, completing request");
                request.set_status(DeployStatus::Completed, format!("nothing to deploy: {:#}", err));
                return Ok(());
            }
            Err(err) => return Err(err.context("error resolving deploy payload")),
        };
        let resource = match self.render(&stage).await {
            Ok(resource) => resource,
            Err(err) if AppError::is_nothing_to_deploy(&err) => {
                tracing::info!(error = %err, "nothing to deploy, completing request");
                request.set_status(DeployStatus::Completed, format!("nothing to deploy: {:#}", err));
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let held = self.mode == Mode::EnqueueHeld;
        let payload_json = payload.to_json()?;
        self.templates
            .submit(JobSubmission {
                request: request.name(),
                resource: &resource,
                payload: &payload_json,
                pipeline: &request.spec.pipeline,
                stage: &stage.spec.name,
                labels: request_job_labels(request),
                cluster: &stage.spec.cluster,
                held,
            })
            .await
            .context("error submitting deploy job")?;
        metrics::increment_counter!(METRIC_JOBS_SUBMITTED);
        tracing::info!(held, payload = %payload_json, "deploy job submitted");

        if held {
            request.set_status(DeployStatus::InQueue, "deploy job submitted, waiting in queue");
        } else {
            request.set_status(DeployStatus::Running, "deploy job submitted");
        }
        Ok(())
    }

    /// Adopt a job already submitted for the given request, returning `true` if one exists.
    ///
    /// A pass may fail after its submission went through, leaving the request `failed` or
    /// `pending` with a job on the engine. Such a request moves on with that job instead of
    /// submitting another one.
    async fn adopt_existing_job(&self, request: &mut DeployRequest) -> Result<bool> {
        let jobs = self
            .jobs
            .list_jobs(&request_job_labels(request), self.limits.limit)
            .await
            .context("error listing deploy jobs of request")?;
        let job = match own_job(&jobs, request.name()) {
            Some(job) => job,
            None => return Ok(false),
        };
        tracing::info!(job = %job.name, held = job.held, "adopting existing deploy job");
        if job.held {
            request.set_status(DeployStatus::InQueue, format!("deploy job {} submitted, waiting in queue", job.name));
        } else {
            request.set_status(DeployStatus::Running, format!("deploy job {} submitted", job.name));
        }
        Ok(true)
    }

    async fn resolve(&self, request: &DeployRequest, pipeline: &Pipeline, stage: &Stage) -> Result<Payload> {
        match self.mode {
            Mode::ReleaseImmediate => self.resolver.all_latest(pipeline).await,
            Mode::EnqueueHeld => self.resolver.current_with_stable(&request.spec.tag, pipeline, stage).await,
        }
    }

    async fn render(&self, stage: &Stage) -> Result<RawResource> {
        self.templates
            .render(&stage.spec.trigger_template)
            .await
            .with_context(|| format!("error rendering trigger template {}", stage.spec.trigger_template))
    }
}
