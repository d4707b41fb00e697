//! Ingress resolution
//!
//! Turns one Ingress into a resolved `ServiceInfo` per backend service:
//! hostname from the ingress status, endpoints and member pods from each
//! service's Endpoints, target groups from the cloud provider.

use super::service::Membership;
use super::Context;
use crate::error::{ReadinessError, Result};
use crate::model::{ObjectKey, PodRef};
use crate::state::ServiceResolution;
use k8s_openapi::api::core::v1::{EndpointSubset, Service, ServicePort};
use k8s_openapi::api::networking::v1::{Ingress, IngressServiceBackend, ServiceBackendPort};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::ControlFlow;
use tracing::{debug, info};

/// What a reconciled ingress changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngressOutcome {
    /// Ingress resolved and published
    Resolved {
        services: Vec<ObjectKey>,
        pods: Vec<PodRef>,
    },
    /// Ingress is gone; `pods` lost their correlation
    Removed { pods: Vec<PodRef> },
}

/// First hostname assigned by the load balancer controller
pub fn ingress_hostname(ingress: &Ingress) -> Option<&str> {
    ingress
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .iter()
        .filter_map(|lb| lb.hostname.as_deref())
        .find(|hostname| !hostname.is_empty())
}

/// Visit service backends in definition order: default backend first, then
/// every path of every rule
///
/// Returning `ControlFlow::Break` from `visit` stops the traversal.
pub fn visit_backends<F>(ingress: &Ingress, mut visit: F)
where
    F: FnMut(&IngressServiceBackend) -> ControlFlow<()>,
{
    let Some(spec) = ingress.spec.as_ref() else {
        return;
    };

    let default_backend = spec
        .default_backend
        .as_ref()
        .and_then(|backend| backend.service.as_ref());
    let rule_backends = spec
        .rules
        .iter()
        .flatten()
        .filter_map(|rule| rule.http.as_ref())
        .flat_map(|http| http.paths.iter())
        .filter_map(|path| path.backend.service.as_ref());

    for backend in default_backend.into_iter().chain(rule_backends) {
        if visit(backend).is_break() {
            return;
        }
    }
}

/// Every service backend of the ingress, duplicates removed
pub fn ingress_backends(ingress: &Ingress) -> Vec<IngressServiceBackend> {
    let mut backends: Vec<IngressServiceBackend> = Vec::new();
    visit_backends(ingress, |backend| {
        if !backends.contains(backend) {
            backends.push(backend.clone());
        }
        ControlFlow::Continue(())
    });
    backends
}

/// Service port a backend refers to, by number or by name
fn service_port<'a>(service: &'a Service, port: &ServiceBackendPort) -> Option<&'a ServicePort> {
    let ports = service.spec.as_ref()?.ports.as_ref()?;
    let found = ports.iter().find(|candidate| match (&port.number, &port.name) {
        (Some(number), _) => candidate.port == *number,
        (None, Some(name)) => candidate.name.as_ref() == Some(name),
        (None, None) => false,
    });
    match found {
        Some(found) => Some(found),
        None if port.number.is_none() && port.name.is_none() && ports.len() == 1 => ports.first(),
        None => None,
    }
}

/// Endpoint port matching a service port: same name, or the only port
fn subset_port(subset: &EndpointSubset, service_port: &ServicePort) -> Option<i32> {
    let ports = subset.ports.as_ref()?;
    ports
        .iter()
        .find(|p| p.name == service_port.name)
        .or_else(|| match ports.as_slice() {
            [only] => Some(only),
            _ => None,
        })
        .map(|p| p.port)
}

pub async fn reconcile_ingress(key: &ObjectKey, ctx: &Context) -> Result<IngressOutcome> {
    let Some(ingress) = ctx.call("get ingress", ctx.cluster.get_ingress(key)).await? else {
        let pods = ctx.store.members_of_ingress(key);
        let removed = ctx.store.remove_ingress(key);
        if !removed.is_empty() {
            info!(ingress = %key, services = removed.len(), "Ingress deleted, correlation removed");
        }
        return Ok(IngressOutcome::Removed { pods });
    };

    let hostname = ingress_hostname(&ingress)
        .ok_or_else(|| {
            ReadinessError::not_ready(format!("ingress {} has no load balancer hostname yet", key))
        })?
        .to_string();

    // backend ports grouped per service
    let mut backends: BTreeMap<ObjectKey, Vec<ServiceBackendPort>> = BTreeMap::new();
    for backend in ingress_backends(&ingress) {
        let service = ObjectKey::new(key.namespace.clone(), backend.name);
        backends
            .entry(service)
            .or_default()
            .extend(backend.port);
    }

    let mut memberships = Vec::with_capacity(backends.len());
    for (service_key, ports) in backends {
        let service = ctx
            .call("get service", ctx.cluster.get_service(&service_key))
            .await?
            .ok_or_else(|| {
                ReadinessError::not_ready(format!(
                    "service {} of ingress {} does not exist yet",
                    service_key, key
                ))
            })?;
        let endpoints = ctx
            .call("get endpoints", ctx.cluster.get_endpoints(&service_key))
            .await?
            .ok_or_else(|| {
                ReadinessError::not_ready(format!("service {} has no endpoints yet", service_key))
            })?;

        let service_ports: Vec<&ServicePort> = ports
            .iter()
            .filter_map(|port| service_port(&service, port))
            .collect();
        let membership =
            Membership::collect(&key.namespace, &endpoints, &ctx.index, |subset| {
                service_ports
                    .iter()
                    .filter_map(|service_port| subset_port(subset, service_port))
                    .collect()
            });
        debug!(
            ingress = %key,
            service = %service_key,
            endpoints = membership.endpoints.len(),
            pods = membership.pods.len(),
            "Collected service endpoints"
        );
        memberships.push((service_key, membership));
    }

    let endpoint_groups = ctx
        .call(
            "resolve load balancer",
            ctx.cloud.endpoint_groups_for_hostname(&hostname),
        )
        .await?;

    let mut services = Vec::with_capacity(memberships.len());
    let mut pods = BTreeSet::new();
    let resolutions: Vec<ServiceResolution> = memberships
        .into_iter()
        .map(|(service, membership)| {
            services.push(service.clone());
            pods.extend(membership.pods.iter().cloned());
            ServiceResolution {
                service,
                hostname: hostname.clone(),
                endpoint_groups: endpoint_groups.clone(),
                endpoints: membership.endpoints,
                pods: membership.pods,
            }
        })
        .collect();

    let stale = ctx.store.publish(key, resolutions);
    info!(
        ingress = %key,
        hostname = %hostname,
        target_groups = endpoint_groups.len(),
        services = services.len(),
        pods = pods.len(),
        stale = stale.len(),
        "Ingress resolved"
    );

    Ok(IngressOutcome::Resolved {
        services,
        pods: pods.into_iter().collect(),
    })
}

#[cfg(test)]
#[path = "ingress_test.rs"]
mod tests;
