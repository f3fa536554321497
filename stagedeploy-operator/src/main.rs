//! The StageDeploy operator.

mod app;
mod config;
mod deploy;
mod k8s;
mod server;

use std::io::Write;
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusRecorder};
use tracing_subscriber::prelude::*;

use crate::app::App;
use crate::config::Config;
use stagedeploy_core::prom::register_operator_metrics;

static RECORDER: OnceLock<PrometheusRecorder> = OnceLock::new();

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cfg = Arc::new(Config::new()?);
    metrics::set_recorder(get_metrics_recorder(&cfg)).context("error setting prometheus metrics recorder")?;
    register_operator_metrics();

    tracing::info!(
        http_port = %cfg.http_port,
        namespace = %cfg.namespace,
        pod_name = %cfg.pod_name,
        completion_detection = ?cfg.completion_detection,
        gitops_sync = %cfg.gitops_sync,
        job_list_limit = %cfg.job_list_limit,
        "starting StageDeploy Operator",
    );
    let res = App::new(cfg).await?.spawn().await.context("error joining application task");
    if let Err(err) = res.and_then(|res| res) {
        tracing::error!(error = ?err, "StageDeploy Operator exited with an error");
    }

    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
    Ok(())
}

/// Install the global tracing subscriber, filtered by `RUST_LOG` and written to stdout.
fn init_tracing() -> Result<()> {
    let fmt = tracing_subscriber::fmt::layer().with_target(true).with_level(true).with_ansi(true);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt)
        .try_init()
        .context("error initializing logging/tracing system")
}

/// Get a handle to the metrics recorder, building it on first use.
///
/// The global labels are taken from the config of the first call.
pub fn get_metrics_recorder(config: &Config) -> &'static PrometheusRecorder {
    RECORDER.get_or_init(|| {
        PrometheusBuilder::new()
            .add_global_label("namespace", config.namespace.clone())
            .add_global_label("pod", config.pod_name.clone())
            .build()
    })
}
