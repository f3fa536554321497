use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::deploy::{DeployHandler, DeployRequests};
use stagedeploy_core::crd::{DeployRequest, DeployStatus, RequiredMetadata};

/// Deletes requests which have been served.
pub struct DeleteCompleted {
    requests: Arc<dyn DeployRequests>,
}

impl DeleteCompleted {
    /// Create a new instance.
    pub fn new(requests: Arc<dyn DeployRequests>) -> Self {
        Self { requests }
    }
}

#[async_trait]
impl DeployHandler for DeleteCompleted {
    fn name(&self) -> &'static str {
        "delete-completed"
    }

    #[tracing::instrument(level = "debug", skip(self, request), fields(request = request.name()))]
    async fn handle(&self, request: &mut DeployRequest) -> Result<()> {
        if request.status_value() != DeployStatus::Completed {
            return Ok(());
        }
        self.requests
            .delete_request(request.name())
            .await
            .context("error deleting completed deploy request")?;
        tracing::info!("completed deploy request deleted");
        Ok(())
    }
}
