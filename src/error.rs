//! Error taxonomy for reconciliation
//!
//! Every variant is handled by the driver retry policy. Kubernetes "not found"
//! is not an error here: the cluster collaborator returns `Ok(None)` and the
//! caller cleans up instead.

use crate::cloud::CloudError;
use crate::model::ObjectKey;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReadinessError {
    /// Required upstream data is missing (no hostname yet, no correlation yet, ...)
    #[error("not ready: {0}")]
    NotReady(String),

    /// The load balancer reports the pod's target as not healthy
    #[error("target for pod {0} is not healthy yet")]
    Unhealthy(ObjectKey),

    #[error("ambiguous result: {0}")]
    Ambiguous(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("cloud API error: {0}")]
    Cloud(#[from] CloudError),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Optimistic concurrency conflict on a status write
    #[error("conflicting update of {0}")]
    Conflict(ObjectKey),
}

impl ReadinessError {
    pub fn not_ready(reason: impl Into<String>) -> Self {
        ReadinessError::NotReady(reason.into())
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ReadinessError::NotReady(_) => "not_ready",
            ReadinessError::Unhealthy(_) => "unhealthy",
            ReadinessError::Ambiguous(_) => "ambiguous",
            ReadinessError::Kube(_) => "kube",
            ReadinessError::Cloud(CloudError::AmbiguousLoadBalancer { .. })
            | ReadinessError::Cloud(CloudError::AmbiguousTargetHealth { .. }) => "ambiguous",
            ReadinessError::Cloud(_) => "cloud",
            ReadinessError::Timeout { .. } => "timeout",
            ReadinessError::Conflict(_) => "conflict",
        }
    }
}

pub type Result<T, E = ReadinessError> = std::result::Result<T, E>;
