//! Runtime configuration.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::deploy::CompletionDetection;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The port used for HTTP healthchecks and metrics.
    pub http_port: u16,

    /// The Kubernetes namespace of this operator.
    ///
    /// DeployRequests, their pipeline definitions, deploy jobs and GitOps applications are all
    /// expected to live in this namespace.
    pub namespace: String,
    /// The name of the pod on which this instance is running.
    pub pod_name: String,

    /// The interval in seconds at which requests waiting on a job are revisited.
    #[serde(default = "Config::default_revisit_seconds")]
    pub revisit_seconds: u64,
    /// How completion of a request's job is detected.
    #[serde(default)]
    pub completion_detection: CompletionDetection,
    /// Patch GitOps applications with the promoted tag once a job completes.
    #[serde(default)]
    pub gitops_sync: bool,
    /// The maximum number of jobs fetched when listing the jobs of a stage.
    #[serde(default = "Config::default_job_list_limit")]
    pub job_list_limit: u32,
    /// The number of jobs per stage above which a warning is logged.
    #[serde(default = "Config::default_job_list_warn_threshold")]
    pub job_list_warn_threshold: usize,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routing just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the semantics of this config.
    fn validate(&self) -> Result<()> {
        if self.revisit_seconds == 0 {
            bail!("REVISIT_SECONDS must be greater than 0");
        }
        if self.job_list_limit == 0 {
            bail!("JOB_LIST_LIMIT must be greater than 0");
        }
        Ok(())
    }

    /// The interval at which requests waiting on a job are revisited.
    pub fn revisit_interval(&self) -> Duration {
        Duration::from_secs(self.revisit_seconds)
    }

    fn default_revisit_seconds() -> u64 {
        10
    }

    fn default_job_list_limit() -> u32 {
        500
    }

    fn default_job_list_warn_threshold() -> usize {
        50
    }
}
