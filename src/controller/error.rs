//! Error types for the controllers.
//!
//! Defines custom error types with classification for retry behavior.
//! Transient infrastructure errors surface as non-nil reconcile results so
//! the framework retries with backoff; semantic failures are recorded as
//! conditions and do not bubble.

use std::time::Duration;
use thiserror::Error;

use crate::clusters::RegistryError;
use crate::compat::CompatError;
use crate::resources::hook_job::HookBuildError;

/// Error type for controller operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error on the host cluster
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Error from a remote cluster through the compat layer
    #[error(transparent)]
    Compat(#[from] CompatError),

    /// Error building a cluster client
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Error building hook resources
    #[error(transparent)]
    Hook(#[from] HookBuildError),

    /// Error generating transfer certificates
    #[error(transparent)]
    Certificate(#[from] crate::resources::rsync::TransferCertError),

    /// Missing required field in resource
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Validation error in resource spec
    #[error("Validation error: {0}")]
    Validation(String),

    /// Transient error that should be retried
    #[error("Transient error: {0}")]
    Transient(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(e)) => e.code == 404,
            Error::Compat(e) => e.is_not_found(),
            _ => false,
        }
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) => kube_retryable(e),
            Error::Compat(CompatError::Kube(e)) => kube_retryable(e),
            Error::Compat(_) => false,
            Error::Registry(RegistryError::Kube(e)) => kube_retryable(e),
            Error::Registry(_) => false,
            Error::Transient(_) => true,
            Error::Hook(_)
            | Error::Certificate(_)
            | Error::Validation(_)
            | Error::MissingField(_)
            | Error::Serialization(_) => false,
        }
    }

    /// Get the recommended requeue duration for this error
    pub fn requeue_after(&self) -> Duration {
        if self.is_retryable() {
            Duration::from_secs(30)
        } else {
            Duration::from_secs(3600)
        }
    }
}

fn kube_retryable(e: &kube::Error) -> bool {
    // Retry on network errors, rate limiting, conflicts, and server errors
    matches!(
        e,
        kube::Error::Api(api_err) if api_err.code >= 500 || api_err.code == 429 || api_err.code == 409
    ) || matches!(e, kube::Error::Service(_))
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;
