use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::k8s::Controller;
use crate::server::AppServer;

/// The StageDeploy operator application, owning its long-running tasks.
pub struct App {
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the HTTP server.
    server: JoinHandle<()>,
    /// The join handle of the K8s controller.
    controller: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(10);

        let client = kube::Client::try_default().await.context("error initializing K8s client")?;

        let server = AppServer::new(config.clone(), shutdown_tx.clone()).spawn();
        let controller = Controller::new(client, config, shutdown_tx.clone()).spawn();

        Ok(Self {
            shutdown_rx: BroadcastStream::new(shutdown_rx),
            shutdown_tx,
            server,
            controller,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = shutdown_signals()?;
        tokio::select! {
            Some((name, _)) = signals.next() => {
                tracing::info!(signal = name, "signal received, beginning graceful shutdown");
                let _ = self.shutdown_tx.send(());
            }
            _ = self.shutdown_rx.next() => tracing::debug!("shutdown triggered by a failed task"),
        }

        tracing::debug!("StageDeploy Operator is shutting down");
        self.join_tasks().await;
        tracing::debug!("StageDeploy Operator shutdown complete");
        Ok(())
    }

    /// Wait for the HTTP server and the controller to wind down.
    async fn join_tasks(self) {
        if let Err(err) = self.server.await {
            tracing::error!(error = ?err, "error joining http server task");
        }
        match self.controller.await {
            Ok(Ok(())) => (),
            Ok(Err(err)) => tracing::error!(error = ?err, "error shutting down k8s controller"),
            Err(err) => tracing::error!(error = ?err, "error joining k8s controller task"),
        }
    }
}

/// The termination signals which trigger a graceful shutdown, keyed by name.
fn shutdown_signals() -> Result<StreamMap<&'static str, SignalStream>> {
    let mut signals = StreamMap::new();
    for (name, kind) in [("sigterm", SignalKind::terminate()), ("sigint", SignalKind::interrupt())] {
        let stream = signal(kind).with_context(|| format!("error building {} signal stream", name))?;
        signals.insert(name, SignalStream::new(stream));
    }
    Ok(signals)
}
