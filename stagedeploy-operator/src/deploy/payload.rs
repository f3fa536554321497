//! Deploy payload resolution.
//!
//! A payload maps each codebase of a stage to the image tag it should run. There are two
//! strategies for computing one:
//!
//! - **all latest**: every input stream of the pipeline contributes its newest tag. This is
//!   recomputed from scratch on every request, so concurrent requests cannot interfere.
//! - **current with stable**: the promoted codebase gets its new tag, every other application
//!   keeps the stable tag recorded on the stage. Applications without a stable tag fall back
//!   to their stream's newest tag. Requests using this strategy are serialized per stage by the
//!   admission queue, as two concurrent promotions would otherwise overwrite each other.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::deploy::Catalog;
use stagedeploy_core::crd::{CodebaseTag, ImageStream, Pipeline, RequiredMetadata, Stage};
use stagedeploy_core::AppError;

/// The image to deploy for one application.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationPayload {
    /// The image tag to deploy.
    pub image_tag: String,
}

/// A mapping of codebase names to the image each should run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(BTreeMap<String, ApplicationPayload>);

impl Payload {
    /// Set the image tag of the given codebase, replacing any previous value.
    pub fn insert(&mut self, codebase: impl Into<String>, tag: impl Into<String>) {
        self.0.insert(codebase.into(), ApplicationPayload { image_tag: tag.into() });
    }

    /// Check if the given codebase has an entry.
    pub fn contains(&self, codebase: &str) -> bool {
        self.0.contains_key(codebase)
    }

    /// The image tag of the given codebase.
    pub fn tag(&self, codebase: &str) -> Option<&str> {
        self.0.get(codebase).map(|app| app.image_tag.as_str())
    }

    /// A view of this payload as `codebase -> tag`.
    #[cfg(test)]
    pub fn tags(&self) -> BTreeMap<&str, &str> {
        self.0.iter().map(|(codebase, app)| (codebase.as_str(), app.image_tag.as_str())).collect()
    }

    /// Serialize this payload as the JSON object submitted with deploy jobs.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("error serializing deploy payload")
    }

    /// Parse a payload serialized by `to_json`.
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("error deserializing deploy payload")
    }
}

/// Resolves deploy payloads against the catalog.
#[derive(Clone)]
pub struct PayloadResolver {
    catalog: Arc<dyn Catalog>,
}

impl PayloadResolver {
    /// Create a new instance.
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self { catalog }
    }

    /// Resolve the newest tag of every input stream of the given pipeline.
    ///
    /// Fails with `AppError::NoLatestTag` if any input stream has no tags.
    #[tracing::instrument(level = "debug", skip(self, pipeline), fields(pipeline = pipeline.name()))]
    pub async fn all_latest(&self, pipeline: &Pipeline) -> Result<Payload> {
        let mut payload = Payload::default();
        for stream_name in pipeline.spec.input_streams.iter() {
            let stream = self.fetch_stream(stream_name).await?;
            let tag = latest_tag(&stream, stream_name)?;
            payload.insert(stream.spec.codebase.as_str(), tag);
        }
        Ok(payload)
    }

    /// Resolve the promoted tag on top of the stage's stable tags.
    ///
    /// Fails with `AppError::NoLatestTag` if an application without a stable tag has an empty
    /// stream, and with `AppError::NoImageStream` if it has no input stream at all.
    #[tracing::instrument(level = "debug", skip(self, promoted, pipeline, stage), fields(pipeline = pipeline.name(), stage = stage.name()))]
    pub async fn current_with_stable(&self, promoted: &CodebaseTag, pipeline: &Pipeline, stage: &Stage) -> Result<Payload> {
        let mut payload = Payload::default();
        for (app, tag) in stage.stable_tags(&pipeline.spec.applications) {
            payload.insert(app, tag);
        }
        payload.insert(promoted.codebase.as_str(), promoted.tag.as_str());

        let mut missing: BTreeSet<&str> = pipeline
            .spec
            .applications
            .iter()
            .map(String::as_str)
            .filter(|app| !payload.contains(app))
            .collect();
        for stream_name in pipeline.spec.input_streams.iter() {
            if missing.is_empty() {
                break;
            }
            let stream = self.fetch_stream(stream_name).await?;
            if !missing.remove(stream.spec.codebase.as_str()) {
                continue;
            }
            let tag = latest_tag(&stream, stream_name)?;
            tracing::debug!(codebase = %stream.spec.codebase, tag, "no stable tag recorded, using latest");
            payload.insert(stream.spec.codebase.as_str(), tag);
        }
        if let Some(app) = missing.into_iter().next() {
            return Err(AppError::NoImageStream(app.into()).into());
        }
        Ok(payload)
    }

    async fn fetch_stream(&self, name: &str) -> Result<ImageStream> {
        self.catalog
            .image_stream(name)
            .await
            .with_context(|| format!("error fetching image stream {}", name))
    }
}

/// The newest tag of the given stream, else `AppError::NoLatestTag`.
fn latest_tag<'a>(stream: &'a ImageStream, stream_name: &str) -> Result<&'a str> {
    stream
        .latest_tag()
        .map(|tag| tag.name.as_str())
        .ok_or_else(|| AppError::NoLatestTag(stream_name.into()).into())
}
