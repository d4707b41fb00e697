//! Service and Endpoints membership
//!
//! Keeps the member pods of an already correlated service in step with its
//! Endpoints object. Endpoints notifications are handled by the same
//! reconciliation, keyed by the service they belong to.

use super::Context;
use crate::error::Result;
use crate::model::{Endpoint, ObjectKey, PodRef};
use crate::state::EndpointIndex;
use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset, Endpoints};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Endpoints and member pods collected from an Endpoints object
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Membership {
    pub endpoints: BTreeSet<Endpoint>,
    pub pods: BTreeSet<PodRef>,
}

impl Membership {
    /// Collect ready and not ready addresses of every subset
    ///
    /// `ports_of` picks the subset ports that count. A pod is resolved
    /// through the Endpoint Index, falling back to the address `targetRef`.
    pub fn collect<F>(
        namespace: &str,
        endpoints: &Endpoints,
        index: &EndpointIndex,
        mut ports_of: F,
    ) -> Self
    where
        F: FnMut(&EndpointSubset) -> Vec<i32>,
    {
        let mut membership = Membership::default();
        for subset in endpoints.subsets.iter().flatten() {
            let ports = ports_of(subset);
            let addresses = subset
                .addresses
                .iter()
                .flatten()
                .chain(subset.not_ready_addresses.iter().flatten());

            for address in addresses {
                for port in &ports {
                    let endpoint = Endpoint::new(address.ip.clone(), *port);
                    let pod = index
                        .lookup(&endpoint)
                        .or_else(|| target_pod(namespace, address));
                    if let Some(pod) = pod {
                        membership.pods.insert(pod);
                    }
                    membership.endpoints.insert(endpoint);
                }
            }
        }
        membership
    }
}

fn target_pod(namespace: &str, address: &EndpointAddress) -> Option<PodRef> {
    let target = address.target_ref.as_ref()?;
    if target.kind.as_deref() != Some("Pod") {
        return None;
    }
    let name = target.name.as_ref()?;
    let namespace = target.namespace.as_deref().unwrap_or(namespace);
    Some(PodRef::new(namespace, name.as_str()))
}

fn subset_ports(subset: &EndpointSubset) -> Vec<i32> {
    subset.ports.iter().flatten().map(|p| p.port).collect()
}

/// Reconcile one service's membership
///
/// Returns the pods whose correlation may have changed: the new members, or
/// the former members when the service is gone.
pub async fn reconcile_service(key: &ObjectKey, ctx: &Context) -> Result<Vec<PodRef>> {
    if ctx
        .call("get service", ctx.cluster.get_service(key))
        .await?
        .is_none()
    {
        let Some(removed) = ctx.store.remove(key) else {
            return Ok(Vec::new());
        };
        info!(service = %key, members = removed.pods.len(), "Service deleted, correlation removed");
        return Ok(removed.pods.into_iter().collect());
    }

    let Some(endpoints) = ctx
        .call("get endpoints", ctx.cluster.get_endpoints(key))
        .await?
    else {
        debug!(service = %key, "Service has no endpoints yet");
        return Ok(Vec::new());
    };

    let membership = Membership::collect(&key.namespace, &endpoints, &ctx.index, subset_ports);
    let pods: Vec<PodRef> = membership.pods.iter().cloned().collect();
    let endpoint_count = membership.endpoints.len();
    ctx.store
        .set_membership(key, membership.endpoints, membership.pods)?;
    debug!(
        service = %key,
        members = pods.len(),
        endpoints = endpoint_count,
        "Service membership updated"
    );
    Ok(pods)
}

#[cfg(test)]
#[path = "service_test.rs"]
mod tests;
