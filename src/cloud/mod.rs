//! Cloud load balancer collaborator
//!
//! The engine only talks to the provider through [`CloudProvider`]:
//! - resolve a hostname to exactly one load balancer
//! - list the load balancer's target groups
//! - probe target health for a pod IP and its ports
//! - deregister a pod target on deletion

#[cfg(feature = "aws")]
pub mod aws;
pub mod cache;
#[cfg(test)]
pub mod fake;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("no load balancer found for {0}")]
    LoadBalancerNotFound(String),

    #[error("{count} load balancers match {hostname}, cannot determine which one to use")]
    AmbiguousLoadBalancer { hostname: String, count: usize },

    #[error("expected at most one health result for {target} in {group}, got {count}")]
    AmbiguousTargetHealth {
        group: String,
        target: String,
        count: usize,
    },

    #[error("{operation} failed: {message}")]
    Api {
        operation: &'static str,
        message: String,
    },
}

impl CloudError {
    pub fn api(operation: &'static str, err: impl fmt::Display) -> Self {
        CloudError::Api {
            operation,
            message: err.to_string(),
        }
    }
}

/// A load balancer as identified by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancer {
    /// Provider identifier (an ARN on AWS)
    pub id: String,
    pub dns_name: String,
}

/// Opaque provider-side target group reference
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointGroup {
    pub name: String,
}

impl EndpointGroup {
    pub fn new(name: impl Into<String>) -> Self {
        EndpointGroup { name: name.into() }
    }
}

impl fmt::Display for EndpointGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Exactly one load balancer for the hostname, or an error
    async fn resolve_load_balancer(&self, hostname: &str) -> Result<LoadBalancer, CloudError>;

    async fn list_target_groups(
        &self,
        load_balancer: &LoadBalancer,
    ) -> Result<Vec<EndpointGroup>, CloudError>;

    /// Whether the pod's target is reported healthy in any of the groups
    ///
    /// More than one health result for a single probed target is
    /// `AmbiguousTargetHealth`, never averaged.
    async fn is_target_healthy(
        &self,
        groups: &[EndpointGroup],
        ip: &str,
        ports: &[i32],
    ) -> Result<bool, CloudError>;

    /// Remove a target from every group; an already absent target is success
    async fn deregister_target(
        &self,
        groups: &[EndpointGroup],
        ip: &str,
        port: i32,
    ) -> Result<(), CloudError>;

    async fn endpoint_groups_for_hostname(
        &self,
        hostname: &str,
    ) -> Result<Vec<EndpointGroup>, CloudError> {
        let load_balancer = self.resolve_load_balancer(hostname).await?;
        self.list_target_groups(&load_balancer).await
    }
}
