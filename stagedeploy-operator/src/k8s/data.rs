use std::sync::Arc;
use std::time::Duration;

use kube::runtime::watcher::Event;
use kube::Resource;

use crate::k8s::scheduler::SchedulerTask;
use crate::k8s::{Controller, EventResult};
use stagedeploy_core::crd::DeployRequest;

//////////////////////////////////////////////////////////////////////////////
// DeployRequest Events //////////////////////////////////////////////////////
impl Controller {
    /// Handle `DeployRequest` watcher event.
    #[tracing::instrument(level = "debug", skip(self, res))]
    pub(super) async fn handle_request_event(&mut self, res: EventResult<DeployRequest>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from DeployRequest k8s watcher");
                let _ = tokio::time::sleep(Duration::from_secs(10)).await;
                return;
            }
        };
        match event {
            Event::Applied(obj) => self.request_applied(obj).await,
            Event::Deleted(obj) => self.request_deleted(obj).await,
            Event::Restarted(objs) => self.request_restarted(objs).await,
        }
    }

    #[tracing::instrument(level = "debug", skip(self, request))]
    async fn request_applied(&mut self, request: DeployRequest) {
        let name_str = match request.meta().name.as_ref() {
            Some(name_str) => name_str,
            None => return, // Not actually possible as K8s requires name.
        };
        let name = match self.requests.get_key_value(name_str) {
            Some((key, old)) => {
                if old == &request {
                    return;
                }
                Arc::clone(key) // No additional alloc.
            }
            None => Arc::new(name_str.clone()),
        };
        self.requests.insert(name.clone(), request);
        self.spawn_scheduler_task(SchedulerTask::RequestUpdated(name), false);
    }

    #[tracing::instrument(level = "debug", skip(self, request))]
    async fn request_deleted(&mut self, request: DeployRequest) {
        let name_str = match request.meta().name.as_ref() {
            Some(name_str) => name_str,
            None => return, // Not actually possible as K8s requires name.
        };
        let (name, request) = match self.requests.remove_entry(name_str) {
            Some((name, request)) => (name, request),
            None => return,
        };
        self.spawn_scheduler_task(SchedulerTask::RequestDeleted(name, request), false);
    }

    #[tracing::instrument(level = "debug", skip(self, requests))]
    async fn request_restarted(&mut self, requests: Vec<DeployRequest>) {
        // Forget requests deleted while the watch was down.
        let live: Vec<&String> = requests.iter().filter_map(|req| req.meta().name.as_ref()).collect();
        let stale: Vec<Arc<String>> = self
            .requests
            .keys()
            .filter(|name| !live.iter().any(|live| live.as_str() == name.as_str()))
            .cloned()
            .collect();
        for name in stale {
            if let Some(request) = self.requests.remove(&name) {
                self.spawn_scheduler_task(SchedulerTask::RequestDeleted(name, request), false);
            }
        }
        for request in requests {
            self.request_applied(request).await;
        }
    }
}
