use std::time::Duration;
use thiserror::Error;

/// Failure classes the pipeline distinguishes when deciding whether to
/// retry, skip, record a sentinel or stop a worker.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("{operation} failed after {attempts} attempt(s): {message}")]
    TransientRemote {
        operation: String,
        attempts: u32,
        message: String,
    },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    #[error("skipping unit '{unit}': {reason}")]
    Content { unit: String, reason: String },

    #[error("resource unavailable: {message}")]
    Resource { message: String },

    #[error("assembly problem with '{unit}': {message}")]
    Assembly { unit: String, message: String },
}

impl PipelineError {
    pub fn content(unit: &str, reason: impl Into<String>) -> Self {
        Self::Content {
            unit: unit.to_string(),
            reason: reason.into(),
        }
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::Resource {
            message: message.into(),
        }
    }
}

/// Returns true when the error (or anything in its chain) is a resource
/// failure that must stop the owning worker.
pub fn is_resource_failure(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<PipelineError>(),
            Some(PipelineError::Resource { .. })
        )
    })
}

/// Returns the content-skip reason if the error is a content rejection.
pub fn content_skip_reason(err: &anyhow::Error) -> Option<String> {
    err.chain().find_map(|cause| match cause.downcast_ref::<PipelineError>() {
        Some(PipelineError::Content { reason, .. }) => Some(reason.clone()),
        _ => None,
    })
}
