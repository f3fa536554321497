//! The handler chain executor.
//!
//! A chain is an ordered list of handlers run against one deploy request. Execution is strictly
//! sequential and fail-fast: the first error aborts the pass. Each handler derives whether it
//! should act from the request's current status, so the same chain may be run any number of
//! times against the same request.

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::config::Config;
use crate::deploy::delete::DeleteCompleted;
use crate::deploy::gitops::GitOpsTagSync;
use crate::deploy::initiate::{EnqueueHeld, ReleaseImmediate};
use crate::deploy::payload::PayloadResolver;
use crate::deploy::queue::{AdmissionQueue, CompletionDetection, JobListLimits, StageWideCompletion};
use crate::deploy::Backends;
use stagedeploy_core::crd::{DeployRequest, DeployStatus, RequiredMetadata, TriggerType};

/// A single step of a handler chain.
#[async_trait]
pub trait DeployHandler: Send + Sync {
    /// The name of this handler, used in logs and errors.
    fn name(&self) -> &'static str;

    /// Handle the given request, mutating its in-memory status as needed.
    async fn handle(&self, request: &mut DeployRequest) -> Result<()>;
}

/// An ordered, fail-fast chain of handlers.
#[derive(Default)]
pub struct HandlerChain {
    handlers: Vec<Box<dyn DeployHandler>>,
}

impl HandlerChain {
    /// Create a new empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the given handler to this chain.
    pub fn with(mut self, handler: impl DeployHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// The names of the handlers of this chain, in order.
    #[cfg(test)]
    pub fn names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|handler| handler.name()).collect()
    }

    /// Run every handler of this chain against the given request.
    #[tracing::instrument(level = "debug", skip(self, request), fields(request = request.name()))]
    pub async fn serve(&self, request: &mut DeployRequest) -> Result<()> {
        for handler in self.handlers.iter() {
            tracing::trace!(handler = handler.name(), "serving handler");
            handler
                .handle(request)
                .await
                .with_context(|| format!("failed to serve handler {}", handler.name()))?;
        }
        Ok(())
    }
}

/// Record a failed chain pass on the given request.
///
/// This is evaluated against the status the chain left behind, not the status it started
/// from. A request which has a job, including one submitted earlier in the failed pass, keeps
/// its status value so that no second job is submitted for it; only its message records the
/// error. A request without a job becomes `failed`, to be initiated again.
pub fn record_chain_error(request: &mut DeployRequest, err: &anyhow::Error) {
    let message = format!("{:#}", err);
    match request.status_value() {
        status if status.can_initiate() => request.set_status(DeployStatus::Failed, message),
        _ => request.set_message(message),
    }
}

/// Settings which shape the handler chains.
#[derive(Clone, Debug, Default)]
pub struct ChainSettings {
    /// The completion detection used by the `Auto` chain.
    pub completion_detection: CompletionDetection,
    /// Patch GitOps applications once a job completes.
    pub gitops_sync: bool,
    /// Bounds on job listings.
    pub job_list: JobListLimits,
}

impl From<&Config> for ChainSettings {
    fn from(config: &Config) -> Self {
        Self {
            completion_detection: config.completion_detection,
            gitops_sync: config.gitops_sync,
            job_list: JobListLimits {
                limit: config.job_list_limit,
                warn_threshold: config.job_list_warn_threshold,
            },
        }
    }
}

/// Build the handler chain for the given trigger type.
pub fn chain_for(trigger_type: TriggerType, backends: &Backends, settings: &ChainSettings) -> HandlerChain {
    match trigger_type {
        TriggerType::Auto => auto_chain(backends, settings),
        TriggerType::AutoStable => auto_stable_chain(backends, settings),
    }
}

/// The chain of `Auto` requests: deploy everything at latest, released immediately.
fn auto_chain(backends: &Backends, settings: &ChainSettings) -> HandlerChain {
    let resolver = PayloadResolver::new(backends.catalog.clone());
    let chain = HandlerChain::new().with(ReleaseImmediate::new(
        backends.catalog.clone(),
        backends.templates.clone(),
        backends.jobs.clone(),
        settings.job_list,
        resolver,
    ));
    let chain = match settings.completion_detection {
        CompletionDetection::PerRequest => chain.with(AdmissionQueue::new(backends.jobs.clone(), settings.job_list)),
        CompletionDetection::StageWide => chain.with(StageWideCompletion::new(backends.jobs.clone(), settings.job_list)),
    };
    finish_chain(chain, backends, settings)
}

/// The chain of `AutoStable` requests: promote one codebase, queued per stage.
fn auto_stable_chain(backends: &Backends, settings: &ChainSettings) -> HandlerChain {
    let resolver = PayloadResolver::new(backends.catalog.clone());
    let chain = HandlerChain::new()
        .with(EnqueueHeld::new(
            backends.catalog.clone(),
            backends.templates.clone(),
            backends.jobs.clone(),
            settings.job_list,
            resolver,
        ))
        .with(AdmissionQueue::new(backends.jobs.clone(), settings.job_list));
    finish_chain(chain, backends, settings)
}

/// Append the handlers shared by all chains which act on completed requests.
fn finish_chain(chain: HandlerChain, backends: &Backends, settings: &ChainSettings) -> HandlerChain {
    let chain = if settings.gitops_sync {
        chain.with(GitOpsTagSync::new(
            backends.catalog.clone(),
            backends.jobs.clone(),
            backends.apps.clone(),
            settings.job_list,
        ))
    } else {
        chain
    };
    chain.with(DeleteCompleted::new(backends.requests.clone()))
}
