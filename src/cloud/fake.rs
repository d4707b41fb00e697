//! Scripted in-memory cloud provider for tests

use super::{CloudError, CloudProvider, EndpointGroup, LoadBalancer};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Health answer the fake gives for every probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthScript {
    Healthy,
    Unhealthy,
    ApiError,
}

/// Answer the fake gives for every deregistration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeregisterScript {
    Removed,
    /// The target was not registered; reported as success
    AlreadyAbsent,
    ApiError,
}

#[derive(Debug)]
pub struct FakeCloud {
    load_balancers: Mutex<HashMap<String, Vec<LoadBalancer>>>,
    target_groups: Mutex<HashMap<String, Vec<EndpointGroup>>>,
    health: Mutex<HealthScript>,
    deregister: Mutex<DeregisterScript>,
    deregistered: Mutex<Vec<(String, i32)>>,
    deregister_attempts: Mutex<usize>,
    health_probes: Mutex<usize>,
}

impl FakeCloud {
    pub fn new() -> Self {
        FakeCloud {
            load_balancers: Mutex::new(HashMap::new()),
            target_groups: Mutex::new(HashMap::new()),
            health: Mutex::new(HealthScript::Healthy),
            deregister: Mutex::new(DeregisterScript::Removed),
            deregistered: Mutex::new(Vec::new()),
            deregister_attempts: Mutex::new(0),
            health_probes: Mutex::new(0),
        }
    }

    /// Register a load balancer answering for `hostname` with the given groups
    pub fn with_load_balancer(self, hostname: &str, id: &str, groups: &[&str]) -> Self {
        self.load_balancers
            .lock()
            .entry(hostname.to_string())
            .or_default()
            .push(LoadBalancer {
                id: id.to_string(),
                dns_name: hostname.to_string(),
            });
        self.target_groups.lock().insert(
            id.to_string(),
            groups.iter().map(|g| EndpointGroup::new(*g)).collect(),
        );
        self
    }

    pub fn set_health(&self, health: HealthScript) {
        *self.health.lock() = health;
    }

    pub fn set_deregister(&self, outcome: DeregisterScript) {
        *self.deregister.lock() = outcome;
    }

    pub fn deregister_attempts(&self) -> usize {
        *self.deregister_attempts.lock()
    }

    /// Targets actually removed
    pub fn deregistered(&self) -> Vec<(String, i32)> {
        self.deregistered.lock().clone()
    }

    pub fn health_probes(&self) -> usize {
        *self.health_probes.lock()
    }
}

#[async_trait]
impl CloudProvider for FakeCloud {
    async fn resolve_load_balancer(&self, hostname: &str) -> Result<LoadBalancer, CloudError> {
        let load_balancers = self.load_balancers.lock();
        match load_balancers.get(hostname).map(Vec::as_slice) {
            None | Some([]) => Err(CloudError::LoadBalancerNotFound(hostname.to_string())),
            Some([lb]) => Ok(lb.clone()),
            Some(many) => Err(CloudError::AmbiguousLoadBalancer {
                hostname: hostname.to_string(),
                count: many.len(),
            }),
        }
    }

    async fn list_target_groups(
        &self,
        load_balancer: &LoadBalancer,
    ) -> Result<Vec<EndpointGroup>, CloudError> {
        Ok(self
            .target_groups
            .lock()
            .get(&load_balancer.id)
            .cloned()
            .unwrap_or_default())
    }

    async fn is_target_healthy(
        &self,
        _groups: &[EndpointGroup],
        _ip: &str,
        _ports: &[i32],
    ) -> Result<bool, CloudError> {
        *self.health_probes.lock() += 1;
        match *self.health.lock() {
            HealthScript::Healthy => Ok(true),
            HealthScript::Unhealthy => Ok(false),
            HealthScript::ApiError => Err(CloudError::api(
                "DescribeTargetHealth",
                "service unavailable",
            )),
        }
    }

    async fn deregister_target(
        &self,
        _groups: &[EndpointGroup],
        ip: &str,
        port: i32,
    ) -> Result<(), CloudError> {
        *self.deregister_attempts.lock() += 1;
        match *self.deregister.lock() {
            DeregisterScript::Removed => {
                self.deregistered.lock().push((ip.to_string(), port));
                Ok(())
            }
            DeregisterScript::AlreadyAbsent => Ok(()),
            DeregisterScript::ApiError => Err(CloudError::api(
                "DeregisterTargets",
                "service unavailable",
            )),
        }
    }
}
