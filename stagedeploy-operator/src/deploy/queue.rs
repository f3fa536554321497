//! The admission queue of held deploy jobs.
//!
//! ## Overview
//! Deploy requests promoting into the same pipeline stage must run one at a time, in the order
//! they arrived. Rather than holding a lock, every request submits its job held, and every pass
//! over a queued request re-evaluates a pure predicate over the stage's current job listing:
//!
//! - every job which is not held must be done, meaning nothing is running on the stage; and
//! - the candidate must be the earliest created of all held jobs, ties broken by name.
//!
//! Only one job can satisfy both at any point in time. The predicate is recomputed from
//! observed state on every pass, so it tolerates crashes, restarts and concurrent evaluation by
//! multiple workers: two evaluators concluding that the same job may be released both issue
//! the same idempotent release patch.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::deploy::{stage_job_selector, DeployHandler, Job, JobStore};
use stagedeploy_core::crd::{DeployRequest, DeployStatus, RequiredMetadata};
use stagedeploy_core::prom::METRIC_JOBS_RELEASED;

/// The default page size when listing the jobs of a stage.
const DEFAULT_JOB_LIST_LIMIT: u32 = 500;
/// The default number of jobs per stage above which a warning is logged.
const DEFAULT_JOB_LIST_WARN_THRESHOLD: usize = 50;

/// How completion of a deploy request's job is detected.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CompletionDetection {
    /// Track the job labelled with the request's identity.
    PerRequest,
    /// Legacy: complete once every job of the stage is done, regardless of which request
    /// submitted it. This can complete a request while its own job is still outstanding when
    /// other requests target the same stage.
    StageWide,
}

impl Default for CompletionDetection {
    fn default() -> Self {
        Self::PerRequest
    }
}

/// Bounds on the job listing of a stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JobListLimits {
    /// The maximum number of jobs fetched per listing.
    pub limit: u32,
    /// The number of jobs above which a warning is logged.
    ///
    /// This is an operational signal that finished jobs are not being pruned, not a bound.
    pub warn_threshold: usize,
}

impl Default for JobListLimits {
    fn default() -> Self {
        Self {
            limit: DEFAULT_JOB_LIST_LIMIT,
            warn_threshold: DEFAULT_JOB_LIST_WARN_THRESHOLD,
        }
    }
}

/// Check if the named held job may be released.
///
/// The candidate must be held, every other non-held job must be done, and the candidate must
/// be first among all held jobs by `(creation time, name)`.
pub fn release_eligible(jobs: &[Job], candidate: &str) -> bool {
    let candidate = match jobs.iter().find(|job| job.name == candidate) {
        Some(job) if job.held => job,
        _ => return false,
    };
    let stage_busy = jobs.iter().any(|job| job.name != candidate.name && !job.held && !job.done);
    if stage_busy {
        return false;
    }
    jobs.iter()
        .filter(|job| job.held)
        .min_by(|a, b| a.queue_key().cmp(&b.queue_key()))
        .map(|first| first.name == candidate.name)
        .unwrap_or(false)
}

/// The job of the named request, the earliest created if several carry its label.
pub fn own_job<'a>(jobs: &'a [Job], request: &str) -> Option<&'a Job> {
    jobs.iter()
        .filter(|job| job.belongs_to(request))
        .min_by(|a, b| a.queue_key().cmp(&b.queue_key()))
}

/// List all jobs of the given request's stage.
async fn list_stage_jobs(store: &dyn JobStore, request: &DeployRequest, limits: JobListLimits) -> Result<Vec<Job>> {
    let jobs = store
        .list_jobs(&stage_job_selector(request), limits.limit)
        .await
        .with_context(|| format!("error listing jobs of stage {}", request.stage_key()))?;
    if jobs.len() > limits.warn_threshold {
        tracing::warn!(
            stage = %request.stage_key(),
            count = jobs.len(),
            threshold = limits.warn_threshold,
            "stage has an unusually large number of jobs, consider pruning finished jobs"
        );
    }
    Ok(jobs)
}

/// Tracks the job of a request, releasing it when its turn comes and completing the request
/// once it is done.
pub struct AdmissionQueue {
    jobs: Arc<dyn JobStore>,
    limits: JobListLimits,
}

impl AdmissionQueue {
    /// Create a new instance.
    pub fn new(jobs: Arc<dyn JobStore>, limits: JobListLimits) -> Self {
        Self { jobs, limits }
    }
}

#[async_trait]
impl DeployHandler for AdmissionQueue {
    fn name(&self) -> &'static str {
        "admission-queue"
    }

    #[tracing::instrument(level = "debug", skip(self, request), fields(request = request.name()))]
    async fn handle(&self, request: &mut DeployRequest) -> Result<()> {
        let status = request.status_value();
        if !status.awaits_job() {
            tracing::trace!(%status, "request is not waiting on a job");
            return Ok(());
        }

        let jobs = list_stage_jobs(self.jobs.as_ref(), request, self.limits).await?;
        let job = match own_job(&jobs, request.name()) {
            Some(job) => job,
            None => {
                // The submission may not be visible in listings yet.
                tracing::debug!("job of request not found, waiting for next pass");
                return Ok(());
            }
        };

        if job.done {
            tracing::info!(job = %job.name, succeeded = job.succeeded, "deploy job done, completing request");
            let message = match job.reason.as_deref() {
                Some(reason) => format!("deploy job {} finished: {}", job.name, reason),
                None => format!("deploy job {} finished", job.name),
            };
            request.set_status(DeployStatus::Completed, message);
            return Ok(());
        }
        if !job.held {
            return Ok(());
        }

        if !release_eligible(&jobs, &job.name) {
            tracing::debug!(job = %job.name, "deploy job is not first in queue");
            return Ok(());
        }
        self.jobs
            .release_job(&job.name)
            .await
            .with_context(|| format!("error releasing deploy job {}", job.name))?;
        metrics::increment_counter!(METRIC_JOBS_RELEASED);
        tracing::info!(job = %job.name, "deploy job released");
        request.set_status(DeployStatus::Running, format!("deploy job {} released", job.name));
        Ok(())
    }
}

/// Legacy completion poller which completes a request once every job of its stage is done.
///
/// Unlike `AdmissionQueue` this does not identify the request's own job, and so it never
/// releases held jobs. It is only ever used for requests whose jobs are submitted runnable.
pub struct StageWideCompletion {
    jobs: Arc<dyn JobStore>,
    limits: JobListLimits,
}

impl StageWideCompletion {
    /// Create a new instance.
    pub fn new(jobs: Arc<dyn JobStore>, limits: JobListLimits) -> Self {
        Self { jobs, limits }
    }
}

#[async_trait]
impl DeployHandler for StageWideCompletion {
    fn name(&self) -> &'static str {
        "stage-wide-completion"
    }

    #[tracing::instrument(level = "debug", skip(self, request), fields(request = request.name()))]
    async fn handle(&self, request: &mut DeployRequest) -> Result<()> {
        let status = request.status_value();
        if !status.awaits_job() {
            tracing::trace!(%status, "request is not waiting on a job");
            return Ok(());
        }

        let jobs = list_stage_jobs(self.jobs.as_ref(), request, self.limits).await?;
        // An empty listing most likely means the submission is not visible yet.
        if jobs.is_empty() || jobs.iter().any(|job| !job.done) {
            return Ok(());
        }
        tracing::info!(count = jobs.len(), "all deploy jobs of stage done, completing request");
        request.set_status(DeployStatus::Completed, "all deploy jobs of stage finished");
        Ok(())
    }
}
