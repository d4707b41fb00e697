//! Correlation Store: Service -> load balancer targets and member pods
//!
//! Keyed by the service's namespace/name. Every compound update runs under
//! one write lock, so a reader never sees a half-updated `ServiceInfo`.
//! Lookups hand out clones; no lock is held across an await point.

use crate::cloud::EndpointGroup;
use crate::error::{ReadinessError, Result};
use crate::model::{Endpoint, ObjectKey, PodRef};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// What is currently believed to back one Service
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceInfo {
    /// External hostname assigned to the ingress in front of the service
    pub hostname: String,
    /// Target groups of the load balancer behind `hostname`, in provider order
    pub endpoint_groups: Vec<EndpointGroup>,
    /// Pod endpoints (ready and not ready) seen behind the service
    pub endpoints: BTreeSet<Endpoint>,
    pub pods: BTreeSet<PodRef>,
    /// Ingress that published the cloud targets
    pub ingress: Option<ObjectKey>,
}

/// One service's worth of an ingress resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceResolution {
    pub service: ObjectKey,
    pub hostname: String,
    pub endpoint_groups: Vec<EndpointGroup>,
    pub endpoints: BTreeSet<Endpoint>,
    pub pods: BTreeSet<PodRef>,
}

/// Result of a pod lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodMatch {
    pub service: ObjectKey,
    pub info: ServiceInfo,
    /// How many services list the pod; more than one is ambiguous
    pub candidates: usize,
}

impl PodMatch {
    pub fn is_ambiguous(&self) -> bool {
        self.candidates > 1
    }
}

#[derive(Debug, Clone, Default)]
pub struct CorrelationStore {
    inner: Arc<RwLock<BTreeMap<ObjectKey, ServiceInfo>>>,
}

impl CorrelationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing entry, or a freshly inserted empty one
    pub fn ensure(&self, service: &ObjectKey) -> ServiceInfo {
        self.inner
            .write()
            .entry(service.clone())
            .or_default()
            .clone()
    }

    pub fn get(&self, service: &ObjectKey) -> Option<ServiceInfo> {
        self.inner.read().get(service).cloned()
    }

    /// Replace a service's pod membership
    ///
    /// A service nobody has resolved yet is `NotReady`: the caller retries
    /// until an ingress publishes it.
    pub fn set_members<I>(&self, service: &ObjectKey, pods: I) -> Result<()>
    where
        I: IntoIterator<Item = PodRef>,
    {
        let mut store = self.inner.write();
        let info = store.get_mut(service).ok_or_else(|| {
            ReadinessError::not_ready(format!("service {} is not correlated yet", service))
        })?;
        info.pods = pods.into_iter().collect();
        Ok(())
    }

    /// Replace a service's endpoints and pod membership together
    pub fn set_membership(
        &self,
        service: &ObjectKey,
        endpoints: BTreeSet<Endpoint>,
        pods: BTreeSet<PodRef>,
    ) -> Result<()> {
        let mut store = self.inner.write();
        let info = store.get_mut(service).ok_or_else(|| {
            ReadinessError::not_ready(format!("service {} is not correlated yet", service))
        })?;
        info.endpoints = endpoints;
        info.pods = pods;
        Ok(())
    }

    /// Replace the resolved load balancer identity of a service
    pub fn set_cloud_targets(
        &self,
        service: &ObjectKey,
        hostname: &str,
        endpoint_groups: Vec<EndpointGroup>,
    ) {
        let mut store = self.inner.write();
        let info = store.entry(service.clone()).or_default();
        info.hostname = hostname.to_string();
        info.endpoint_groups = endpoint_groups;
    }

    /// Publish everything an ingress resolved, atomically
    ///
    /// Entries previously published by the same ingress for services it no
    /// longer references are removed. Returns the removed keys.
    pub fn publish(&self, ingress: &ObjectKey, resolutions: Vec<ServiceResolution>) -> Vec<ObjectKey> {
        let mut store = self.inner.write();

        let current: BTreeSet<&ObjectKey> = resolutions.iter().map(|r| &r.service).collect();
        let stale: Vec<ObjectKey> = store
            .iter()
            .filter(|(key, info)| info.ingress.as_ref() == Some(ingress) && !current.contains(key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            store.remove(key);
        }

        for resolution in resolutions {
            let info = store.entry(resolution.service).or_default();
            info.hostname = resolution.hostname;
            info.endpoint_groups = resolution.endpoint_groups;
            info.endpoints = resolution.endpoints;
            info.pods = resolution.pods;
            info.ingress = Some(ingress.clone());
        }

        stale
    }

    pub fn remove(&self, service: &ObjectKey) -> Option<ServiceInfo> {
        self.inner.write().remove(service)
    }

    /// Remove every entry published by `ingress`
    pub fn remove_ingress(&self, ingress: &ObjectKey) -> Vec<ObjectKey> {
        let mut store = self.inner.write();
        let owned: Vec<ObjectKey> = store
            .iter()
            .filter(|(_, info)| info.ingress.as_ref() == Some(ingress))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &owned {
            store.remove(key);
        }
        owned
    }

    /// Member pods of every entry published by `ingress`, sorted
    pub fn members_of_ingress(&self, ingress: &ObjectKey) -> Vec<PodRef> {
        let members: BTreeSet<PodRef> = self
            .inner
            .read()
            .values()
            .filter(|info| info.ingress.as_ref() == Some(ingress))
            .flat_map(|info| info.pods.iter().cloned())
            .collect();
        members.into_iter().collect()
    }

    /// Service whose member set contains `pod`
    ///
    /// Linear scan in key order. Entries with target groups are preferred
    /// over ones still waiting for their load balancer; among those the
    /// lowest namespace/name wins and `candidates` reports how many
    /// services list the pod.
    pub fn find_service_for_pod(&self, pod: &PodRef) -> Option<PodMatch> {
        let store = self.inner.read();
        let matches: Vec<(&ObjectKey, &ServiceInfo)> = store
            .iter()
            .filter(|(_, info)| info.pods.contains(pod))
            .collect();

        let (service, info) = matches
            .iter()
            .find(|(_, info)| !info.endpoint_groups.is_empty())
            .or_else(|| matches.first())
            .copied()?;
        let candidates = matches.len();
        Some(PodMatch {
            service: service.clone(),
            info: info.clone(),
            candidates,
        })
    }

    /// Ingresses that currently own at least one entry
    pub fn ingresses(&self) -> Vec<ObjectKey> {
        let owners: BTreeSet<ObjectKey> = self
            .inner
            .read()
            .values()
            .filter_map(|info| info.ingress.clone())
            .collect();
        owners.into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
#[path = "correlation_test.rs"]
mod tests;
