//! Reconciliation drivers
//!
//! One work queue and driver per watched kind. Every driver shares the same
//! [`Context`]: the Endpoint Index, the Correlation Store and the two
//! collaborators.

pub mod cluster;
pub mod engine;
pub mod ingress;
pub mod pod;
pub mod queue;
pub mod service;
pub mod watch;

#[cfg(test)]
pub mod fake;

pub use cluster::{ClusterApi, KubeCluster};
pub use engine::{Engine, Event};
pub use ingress::{reconcile_ingress, IngressOutcome};
pub use pod::reconcile_pod;
pub use queue::{Backoff, WorkQueue};
pub use service::reconcile_service;

use crate::cloud::CloudProvider;
use crate::error::{ReadinessError, Result};
use crate::model::ReadinessGate;
use crate::server::SharedMetrics;
use crate::state::{CorrelationStore, EndpointIndex};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Default deadline for a single Kubernetes or cloud call
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Pod,
    Service,
    Endpoints,
    Ingress,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Pod,
        ResourceKind::Service,
        ResourceKind::Endpoints,
        ResourceKind::Ingress,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Pod => "pod",
            ResourceKind::Service => "service",
            ResourceKind::Endpoints => "endpoints",
            ResourceKind::Ingress => "ingress",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared state handed to every reconciliation
#[derive(Clone)]
pub struct Context {
    pub index: EndpointIndex,
    pub store: CorrelationStore,
    pub cluster: Arc<dyn ClusterApi>,
    pub cloud: Arc<dyn CloudProvider>,
    pub gate: ReadinessGate,
    pub metrics: SharedMetrics,
    pub call_timeout: Duration,
}

impl Context {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        cloud: Arc<dyn CloudProvider>,
        gate: ReadinessGate,
        metrics: SharedMetrics,
    ) -> Self {
        Context {
            index: EndpointIndex::new(),
            store: CorrelationStore::new(),
            cluster,
            cloud,
            gate,
            metrics,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Run one external call under the call deadline
    pub(crate) async fn call<T, E, F>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>>,
        ReadinessError: From<E>,
    {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result.map_err(ReadinessError::from),
            Err(_) => Err(ReadinessError::Timeout {
                operation,
                after: self.call_timeout,
            }),
        }
    }
}
