//! Pod readiness evaluation
//!
//! Decides the gate condition of one pod from its correlation entry and the
//! load balancer's view of its target, and persists it.

use super::Context;
use crate::error::{ReadinessError, Result};
use crate::model::{ConditionStatus, PodRef};
use crate::state::endpoint_index::{container_ports, pod_ip};
use crate::state::ServiceInfo;
use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, info, warn};

/// Attempts at a condition write before a conflict is surfaced
const MAX_WRITE_ATTEMPTS: usize = 3;

/// Reconcile the readiness gate of one pod
///
/// - pod gone: its Endpoint Index entries are dropped
/// - no gate: nothing is written
/// - terminating: its target is deregistered from the load balancer
/// - otherwise: the condition follows the load balancer health report
pub async fn reconcile_pod(key: &PodRef, ctx: &Context) -> Result<()> {
    let Some(pod) = ctx.call("get pod", ctx.cluster.get_pod(key)).await? else {
        let removed = ctx.index.remove_pod(key);
        debug!(pod = %key, removed, "Pod is gone, dropped its endpoints");
        return Ok(());
    };

    ctx.index.record_pod_endpoints(key, &pod);

    if !ctx.gate.is_enabled(&pod) {
        return Ok(());
    }

    if pod.metadata.deletion_timestamp.is_some() {
        return deregister(key, &pod, ctx).await;
    }

    let Some(ip) = pod_ip(&pod).map(str::to_string) else {
        write_condition(key, pod, ConditionStatus::Unknown, ctx).await?;
        return Err(ReadinessError::not_ready(format!(
            "pod {} has no IP yet",
            key
        )));
    };

    let correlated = ctx
        .store
        .find_service_for_pod(key)
        .filter(|found| !found.info.endpoint_groups.is_empty());
    let Some(found) = correlated else {
        write_condition(key, pod, ConditionStatus::Unknown, ctx).await?;
        return Err(ReadinessError::not_ready(format!(
            "pod {} is not correlated with a load balancer yet",
            key
        )));
    };

    if found.is_ambiguous() {
        warn!(
            pod = %key,
            service = %found.service,
            candidates = found.candidates,
            "Pod is a member of several services, using the first"
        );
        ctx.metrics.record_ambiguous_match();
    }

    let ports = target_ports(&pod, &ip, &found.info);
    if ports.is_empty() {
        write_condition(key, pod, ConditionStatus::Unknown, ctx).await?;
        return Err(ReadinessError::not_ready(format!(
            "pod {} exposes no port behind service {}",
            key, found.service
        )));
    }

    // A failed probe leaves the condition untouched
    let healthy = ctx
        .call(
            "describe target health",
            ctx.cloud
                .is_target_healthy(&found.info.endpoint_groups, &ip, &ports),
        )
        .await?;

    if healthy {
        write_condition(key, pod, ConditionStatus::True, ctx).await
    } else {
        write_condition(key, pod, ConditionStatus::False, ctx).await?;
        Err(ReadinessError::Unhealthy(key.clone()))
    }
}

/// Ports to probe: declared container ports, else the endpoints the
/// service lists for this IP
fn target_ports(pod: &Pod, ip: &str, info: &ServiceInfo) -> Vec<i32> {
    let declared = container_ports(pod);
    if !declared.is_empty() {
        return declared;
    }
    info.endpoints
        .iter()
        .filter(|endpoint| endpoint.ip == ip)
        .map(|endpoint| endpoint.port)
        .collect()
}

async fn deregister(key: &PodRef, pod: &Pod, ctx: &Context) -> Result<()> {
    let Some(found) = ctx.store.find_service_for_pod(key) else {
        debug!(pod = %key, "Terminating pod is not correlated, nothing to deregister");
        return Ok(());
    };
    let Some(ip) = pod_ip(pod) else {
        return Ok(());
    };
    if found.info.endpoint_groups.is_empty() {
        return Ok(());
    }

    for port in target_ports(pod, ip, &found.info) {
        ctx.call(
            "deregister target",
            ctx.cloud
                .deregister_target(&found.info.endpoint_groups, ip, port),
        )
        .await?;
        info!(pod = %key, ip, port, service = %found.service, "Deregistered terminating pod");
    }
    Ok(())
}

/// Persist `status` unless the pod already carries it
///
/// On a write conflict the pod is fetched again and the write recomputed.
async fn write_condition(
    key: &PodRef,
    mut pod: Pod,
    status: ConditionStatus,
    ctx: &Context,
) -> Result<()> {
    for attempt in 1..=MAX_WRITE_ATTEMPTS {
        let current = ctx.gate.condition(&pod);
        if current.as_ref().map(|c| c.status) == Some(status) {
            return Ok(());
        }

        let previous = current.as_ref().map(|c| c.status);
        let next = current.unwrap_or_default().observe(status, Utc::now());

        match ctx
            .call(
                "patch pod status",
                ctx.cluster.patch_pod_condition(&ctx.gate, key, &pod, &next),
            )
            .await
        {
            Ok(()) => {
                ctx.metrics.record_condition_write(status.as_str());
                info!(
                    pod = %key,
                    from = ?previous,
                    to = %status,
                    "Readiness condition updated"
                );
                return Ok(());
            }
            Err(ReadinessError::Conflict(_)) if attempt < MAX_WRITE_ATTEMPTS => {
                debug!(pod = %key, attempt, "Condition write conflicted, refetching pod");
                match ctx.call("get pod", ctx.cluster.get_pod(key)).await? {
                    Some(fresh) => pod = fresh,
                    None => return Ok(()),
                }
            }
            Err(e) => return Err(e),
        }
    }

    Err(ReadinessError::Conflict(key.clone()))
}

#[cfg(test)]
#[path = "pod_test.rs"]
mod tests;
