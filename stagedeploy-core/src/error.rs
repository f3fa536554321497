//! StageDeploy error abstractions.

use thiserror::Error;

/// Application error variants.
///
/// Most failures in the operator are plain `anyhow` errors carrying context. The variants here
/// are the conditions which callers need to detect by type, typically via
/// `anyhow::Error::downcast_ref::<AppError>()`.
#[derive(Debug, Error)]
pub enum AppError {
    /// The trigger template defines no resource templates, so there is nothing to submit.
    #[error("trigger template {0} has no resource templates")]
    EmptyTemplate(String),
    /// An image stream required for the deploy payload has no tags.
    #[error("image stream {0} has no tags")]
    NoLatestTag(String),
    /// A pipeline application has neither a stable tag nor an input image stream.
    #[error("application {0} has no stable tag and no input image stream")]
    NoImageStream(String),
    /// No GitOps application matches the promoted codebase.
    #[error("gitops application for codebase {0} not found")]
    AppNotFound(String),
    /// More than one GitOps application matches the promoted codebase.
    ///
    /// This is a configuration error which requires operator intervention.
    #[error("multiple gitops applications found for codebase {0}")]
    MultipleAppsFound(String),
    /// The given input was invalid.
    #[error("validation error: {0}")]
    InvalidInput(String),
}

impl AppError {
    /// Check if the given error is one of the "nothing to deploy" conditions.
    ///
    /// These are not failures: a request hitting one of them is simply complete.
    pub fn is_nothing_to_deploy(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<Self>(), Some(Self::EmptyTemplate(_)) | Some(Self::NoLatestTag(_)))
    }
}
