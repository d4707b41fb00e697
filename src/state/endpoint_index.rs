//! Endpoint Index: (pod IP, container port) -> pod

use crate::model::{Endpoint, PodRef};
use k8s_openapi::api::core::v1::Pod;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct EndpointIndex {
    inner: Arc<RwLock<HashMap<Endpoint, PodRef>>>,
}

impl EndpointIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert one entry per declared container port of a pod with an IP
    ///
    /// Idempotent. Returns the number of entries written, zero when the pod
    /// has no IP or declares no ports.
    pub fn record_pod_endpoints(&self, pod_ref: &PodRef, pod: &Pod) -> usize {
        let Some(ip) = pod_ip(pod) else {
            return 0;
        };
        let ports = container_ports(pod);
        if ports.is_empty() {
            return 0;
        }

        let mut index = self.inner.write();
        for port in &ports {
            index.insert(Endpoint::new(ip, *port), pod_ref.clone());
        }
        ports.len()
    }

    pub fn lookup(&self, endpoint: &Endpoint) -> Option<PodRef> {
        self.inner.read().get(endpoint).cloned()
    }

    /// Drop every entry that points at `pod_ref`
    pub fn remove_pod(&self, pod_ref: &PodRef) -> usize {
        let mut index = self.inner.write();
        let before = index.len();
        index.retain(|_, owner| owner != pod_ref);
        before - index.len()
    }

    /// Distinct pods currently indexed, sorted
    pub fn pods(&self) -> Vec<PodRef> {
        let mut pods: Vec<PodRef> = self.inner.read().values().cloned().collect();
        pods.sort();
        pods.dedup();
        pods
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

pub fn pod_ip(pod: &Pod) -> Option<&str> {
    pod.status
        .as_ref()
        .and_then(|status| status.pod_ip.as_deref())
        .filter(|ip| !ip.is_empty())
}

/// All container ports declared in the pod spec, in declaration order
pub fn container_ports(pod: &Pod) -> Vec<i32> {
    let Some(spec) = pod.spec.as_ref() else {
        return Vec::new();
    };
    let mut ports: Vec<i32> = spec
        .containers
        .iter()
        .flat_map(|c| c.ports.iter().flatten())
        .map(|p| p.container_port)
        .collect();
    ports.dedup();
    ports
}

#[cfg(test)]
#[path = "endpoint_index_test.rs"]
mod tests;
