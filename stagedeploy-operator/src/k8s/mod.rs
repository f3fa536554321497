//! Kubernetes controller.
//!
//! This controller observes the DeployRequests of its namespace, caches them, and drives each
//! one through its handler chain. Every pass re-reads the request from the API, runs its chain
//! and commits the resulting status with optimistic concurrency (see `scheduler`).
//!
//! Work is level-triggered. Watch events schedule a pass for the affected request, and a
//! revisit interval schedules a pass for every request not yet completed, which is what moves
//! queued requests forward as the jobs of their stage finish.

mod cluster;
mod data;
mod scheduler;
mod templates;
#[cfg(test)]
mod templates_test;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::prelude::*;
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::runtime::watcher::{watcher, Error as WatcherError, Event};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, IntervalStream, ReceiverStream};

use crate::config::Config;
use crate::deploy::{Backends, ChainSettings};
use crate::k8s::scheduler::SchedulerTask;
use stagedeploy_core::crd::{DeployRequest, DeployStatus};

pub use cluster::KubeCluster;

/// The app name used by the operator.
const APP_NAME: &str = "stagedeploy-operator";
/// The timeout duration used before rescheduling a scheduler task.
const RESCHEDULE_TIMEOUT: Duration = Duration::from_secs(5);
/// The default timeout to use for API calls.
const API_TIMEOUT: Duration = Duration::from_secs(5);

type EventResult<T> = std::result::Result<Event<T>, WatcherError>;

/// Kubernetes controller for watching DeployRequest CRs.
pub struct Controller {
    /// K8s client.
    client: Client,
    /// Runtime config.
    config: Arc<Config>,
    /// The settings used to build handler chains.
    settings: ChainSettings,
    /// The collaborators used to build handler chains.
    backends: Backends,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// A channel of scheduler tasks.
    scheduler_tasks_tx: mpsc::Sender<SchedulerTask>,
    /// A channel of scheduler tasks.
    scheduler_tasks_rx: ReceiverStream<SchedulerTask>,

    /// All known DeployRequest objects.
    requests: HashMap<Arc<String>, DeployRequest>,
}

impl Controller {
    /// Create a new instance.
    pub fn new(client: Client, config: Arc<Config>, shutdown_tx: broadcast::Sender<()>) -> Self {
        let cluster = Arc::new(KubeCluster::new(client.clone(), config.namespace.clone()));
        let backends = Backends {
            catalog: cluster.clone(),
            jobs: cluster.clone(),
            templates: cluster.clone(),
            apps: cluster.clone(),
            requests: cluster,
        };
        let (scheduler_tasks_tx, scheduler_tasks_rx) = mpsc::channel(1000);
        Self {
            client,
            settings: ChainSettings::from(config.as_ref()),
            config,
            backends,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            scheduler_tasks_tx,
            scheduler_tasks_rx: ReceiverStream::new(scheduler_tasks_rx),
            requests: Default::default(),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let requests: Api<DeployRequest> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let requests_watcher = watcher(requests, ListParams::default());
        let mut revisits = IntervalStream::new(tokio::time::interval(self.config.revisit_interval()));
        tokio::pin!(requests_watcher);

        tracing::info!("k8s controller initialized");
        loop {
            tokio::select! {
                Some(k8s_event_res) = requests_watcher.next() => self.handle_request_event(k8s_event_res).await,
                Some(scheduler_task) = self.scheduler_tasks_rx.next() => self.handle_scheduler_task(scheduler_task).await,
                Some(_) = revisits.next() => self.revisit_requests(),
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!("k8s controller shutdown");
        Ok(())
    }

    /// Spawn a task which emits a new scheduler tasks.
    ///
    /// This indirection is used to ensure that we don't use an unlimited amount of memory with an
    /// unbounded queue, and also so that we do not block the controller from making progress and
    /// dead-locking when we hit the scheduler task queue cap.
    fn spawn_scheduler_task(&self, task: SchedulerTask, is_retry: bool) {
        let tx = self.scheduler_tasks_tx.clone();
        tokio::spawn(async move {
            if is_retry {
                tokio::time::sleep(RESCHEDULE_TIMEOUT).await;
            }
            let _res = tx.send(task).await;
        });
    }

    /// Schedule a pass for every known request which has not yet been served.
    fn revisit_requests(&self) {
        let pending = self
            .requests
            .iter()
            .filter(|(_, req)| req.status_value() != DeployStatus::Completed)
            .map(|(name, _)| name.clone())
            .collect::<Vec<_>>();
        if pending.is_empty() {
            return;
        }
        tracing::trace!(count = pending.len(), "revisiting deploy requests");
        for name in pending {
            self.spawn_scheduler_task(SchedulerTask::RequestUpdated(name), false);
        }
    }
}

/// Set the canonical labels on an object controlled by the StageDeploy operator.
fn set_canonical_labels(labels: &mut BTreeMap<String, String>) {
    labels.insert("app".into(), "stagedeploy".into());
    labels.insert("stagedeploy.rs/controlled-by".into(), APP_NAME.into());
}
