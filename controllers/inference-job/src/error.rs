//! Controller-specific error types.
//!
//! This module defines error types specific to the InferenceJob Controller
//! that are not covered by upstream library errors.

use thiserror::Error;
use kube::Error as KubeError;

/// Errors that can occur in the InferenceJob Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Work queue key is not of the form `namespace/name`
    #[error("invalid resource key: {0}")]
    InvalidKey(String),

    /// A Deployment with the target name exists but is not controlled by the InferenceJob
    #[error("Resource {0:?} already exists and is not managed by InferenceJob")]
    ResourceExists(String),

    /// A required metadata field is missing on a cached object
    #[error("missing object key: {0}")]
    MissingObjectKey(&'static str),

    /// A deletion tombstone carried no recoverable object
    #[error("error decoding object tombstone, invalid type: {0}")]
    TombstoneDecode(String),

    /// Informer caches never reported synced
    #[error("failed to wait for caches to sync: {0}")]
    CacheSync(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// The sync handler panicked while processing a key
    #[error("sync of {0:?} panicked")]
    SyncPanicked(String),
}

impl ControllerError {
    /// Whether a sync failing with this error should be requeued with backoff.
    ///
    /// Malformed input and decode failures never heal by retrying the same key.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::InvalidKey(_)
                | Self::MissingObjectKey(_)
                | Self::TombstoneDecode(_)
                | Self::InvalidConfig(_)
        )
    }

    /// Whether this error is an ownership conflict on the managed Deployment.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ResourceExists(_))
    }
}
