//! Tests for pod readiness evaluation

use super::*;
use crate::cloud::fake::{DeregisterScript, FakeCloud, HealthScript};
use crate::cloud::EndpointGroup;
use crate::controller::fake::{self, FakeCluster};
use crate::fixtures;
use crate::model::{Endpoint, ObjectKey};
use crate::state::ServiceResolution;
use chrono::TimeZone;
use std::sync::Arc;

const HOST: &str = "internal-web-1883083075.eu-west-1.elb.amazonaws.com";

struct Harness {
    cluster: Arc<FakeCluster>,
    cloud: Arc<FakeCloud>,
    ctx: Context,
}

fn harness() -> Harness {
    let cluster = Arc::new(FakeCluster::new());
    let cloud = Arc::new(FakeCloud::new().with_load_balancer(HOST, "lb-1", &["tg-1"]));
    let ctx = fake::context(&cluster, &cloud);
    Harness {
        cluster,
        cloud,
        ctx,
    }
}

/// Publish `service` with the given members as resolved by ingress `ing`
fn correlate(ctx: &Context, service: &str, members: &[&PodRef]) {
    ctx.store.publish(
        &ObjectKey::new("default", "ing"),
        vec![ServiceResolution {
            service: ObjectKey::new("default", service),
            hostname: HOST.to_string(),
            endpoint_groups: vec![EndpointGroup::new("tg-1")],
            endpoints: [Endpoint::new("10.0.0.5", 80)].into_iter().collect(),
            pods: members.iter().map(|p| (*p).clone()).collect(),
        }],
    );
}

fn condition_status(h: &Harness, key: &PodRef) -> Option<ConditionStatus> {
    let pod = h.cluster.pod(key)?;
    h.ctx.gate.condition(&pod).map(|c| c.status)
}

#[tokio::test]
async fn test_pod_without_gate_is_never_patched() {
    let h = harness();
    let key = h
        .cluster
        .put_pod(fixtures::pod("web-0", Some("10.0.0.5"), 80, false));
    correlate(&h.ctx, "web", &[&key]);

    reconcile_pod(&key, &h.ctx).await.unwrap();
    reconcile_pod(&key, &h.ctx).await.unwrap();

    assert!(h.cluster.patches().is_empty());
    assert_eq!(h.cloud.health_probes(), 0);
    // endpoints are still indexed for correlation
    assert_eq!(
        h.ctx.index.lookup(&Endpoint::new("10.0.0.5", 80)),
        Some(key)
    );
}

#[tokio::test]
async fn test_uncorrelated_pod_is_unknown_and_retried() {
    let h = harness();
    let key = h
        .cluster
        .put_pod(fixtures::pod("web-0", Some("10.0.0.5"), 80, true));

    let err = reconcile_pod(&key, &h.ctx).await.unwrap_err();
    assert!(matches!(err, ReadinessError::NotReady(_)));
    assert_eq!(condition_status(&h, &key), Some(ConditionStatus::Unknown));

    // still not correlated: still retryable, no second write
    let err = reconcile_pod(&key, &h.ctx).await.unwrap_err();
    assert!(matches!(err, ReadinessError::NotReady(_)));
    assert_eq!(h.cluster.patches().len(), 1);
}

#[tokio::test]
async fn test_correlation_without_target_groups_is_unknown() {
    let h = harness();
    let key = h
        .cluster
        .put_pod(fixtures::pod("web-0", Some("10.0.0.5"), 80, true));
    h.ctx.store.ensure(&ObjectKey::new("default", "web"));
    h.ctx
        .store
        .set_members(&ObjectKey::new("default", "web"), vec![key.clone()])
        .unwrap();

    let err = reconcile_pod(&key, &h.ctx).await.unwrap_err();

    assert!(matches!(err, ReadinessError::NotReady(_)));
    assert_eq!(condition_status(&h, &key), Some(ConditionStatus::Unknown));
    assert_eq!(h.cloud.health_probes(), 0);
}

#[tokio::test]
async fn test_pod_without_ip_is_unknown() {
    let h = harness();
    let key = h.cluster.put_pod(fixtures::pod("web-0", None, 80, true));

    let err = reconcile_pod(&key, &h.ctx).await.unwrap_err();

    assert!(matches!(err, ReadinessError::NotReady(_)));
    assert_eq!(condition_status(&h, &key), Some(ConditionStatus::Unknown));
    assert!(h.ctx.index.is_empty());
}

#[tokio::test]
async fn test_healthy_target_sets_true_once() {
    let h = harness();
    let key = h
        .cluster
        .put_pod(fixtures::pod("web-0", Some("10.0.0.5"), 80, true));
    correlate(&h.ctx, "web", &[&key]);

    reconcile_pod(&key, &h.ctx).await.unwrap();
    reconcile_pod(&key, &h.ctx).await.unwrap();

    assert_eq!(condition_status(&h, &key), Some(ConditionStatus::True));
    assert_eq!(
        h.cluster.patches(),
        vec![(key.clone(), ConditionStatus::True)],
        "re-confirming True must not write again"
    );
    assert_eq!(h.cloud.health_probes(), 2);
}

#[tokio::test]
async fn test_unhealthy_target_sets_false_and_retries() {
    let h = harness();
    let key = h
        .cluster
        .put_pod(fixtures::pod("web-0", Some("10.0.0.5"), 80, true));
    correlate(&h.ctx, "web", &[&key]);
    h.cloud.set_health(HealthScript::Unhealthy);

    let err = reconcile_pod(&key, &h.ctx).await.unwrap_err();

    assert!(matches!(err, ReadinessError::Unhealthy(ref k) if *k == key));
    assert_eq!(condition_status(&h, &key), Some(ConditionStatus::False));
}

#[tokio::test]
async fn test_cloud_error_keeps_true_condition() {
    let h = harness();
    let key = h
        .cluster
        .put_pod(fixtures::pod_with_condition("web-0", "10.0.0.5", 80, "True"));
    correlate(&h.ctx, "web", &[&key]);
    h.cloud.set_health(HealthScript::ApiError);

    let err = reconcile_pod(&key, &h.ctx).await.unwrap_err();

    assert!(matches!(err, ReadinessError::Cloud(_)));
    assert_eq!(condition_status(&h, &key), Some(ConditionStatus::True));
    assert!(h.cluster.patches().is_empty());
}

#[tokio::test]
async fn test_explicit_unhealthy_report_regresses_true() {
    let h = harness();
    let key = h
        .cluster
        .put_pod(fixtures::pod_with_condition("web-0", "10.0.0.5", 80, "True"));
    correlate(&h.ctx, "web", &[&key]);
    h.cloud.set_health(HealthScript::Unhealthy);

    assert!(reconcile_pod(&key, &h.ctx).await.is_err());
    assert_eq!(condition_status(&h, &key), Some(ConditionStatus::False));
}

#[tokio::test]
async fn test_transition_time_moves_on_status_change() {
    let h = harness();
    let key = h
        .cluster
        .put_pod(fixtures::pod_with_condition("web-0", "10.0.0.5", 80, "False"));
    correlate(&h.ctx, "web", &[&key]);

    reconcile_pod(&key, &h.ctx).await.unwrap();

    let pod = h.cluster.pod(&key).unwrap();
    let condition = h.ctx.gate.condition(&pod).unwrap();
    let before = chrono::Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    assert_eq!(condition.status, ConditionStatus::True);
    assert!(condition.last_transition_time.unwrap() > before);
    assert!(condition.last_probe_time.is_some());

    // the Ready condition owned by the kubelet is untouched
    let conditions = pod.status.unwrap().conditions.unwrap();
    assert!(conditions.iter().any(|c| c.type_ == "Ready"));
}

#[tokio::test]
async fn test_conflicting_write_is_retried() {
    let h = harness();
    let key = h
        .cluster
        .put_pod(fixtures::pod("web-0", Some("10.0.0.5"), 80, true));
    correlate(&h.ctx, "web", &[&key]);
    h.cluster.inject_conflicts(2);

    reconcile_pod(&key, &h.ctx).await.unwrap();

    assert_eq!(h.cluster.patches(), vec![(key.clone(), ConditionStatus::True)]);
}

#[tokio::test]
async fn test_persistent_conflict_is_surfaced() {
    let h = harness();
    let key = h
        .cluster
        .put_pod(fixtures::pod("web-0", Some("10.0.0.5"), 80, true));
    correlate(&h.ctx, "web", &[&key]);
    h.cluster.inject_conflicts(3);

    let err = reconcile_pod(&key, &h.ctx).await.unwrap_err();

    assert!(matches!(err, ReadinessError::Conflict(_)));
    assert!(h.cluster.patches().is_empty());
}

#[tokio::test]
async fn test_ambiguous_membership_uses_first_service_and_counts() {
    let h = harness();
    let key = h
        .cluster
        .put_pod(fixtures::pod("web-0", Some("10.0.0.5"), 80, true));
    h.ctx.store.publish(
        &ObjectKey::new("default", "ing"),
        ["web", "api"]
            .into_iter()
            .map(|service| ServiceResolution {
                service: ObjectKey::new("default", service),
                hostname: HOST.to_string(),
                endpoint_groups: vec![EndpointGroup::new("tg-1")],
                endpoints: Default::default(),
                pods: [key.clone()].into_iter().collect(),
            })
            .collect(),
    );

    reconcile_pod(&key, &h.ctx).await.unwrap();

    assert_eq!(condition_status(&h, &key), Some(ConditionStatus::True));
    assert_eq!(h.ctx.metrics.ambiguous_matches_total.get(), 1);
}

#[tokio::test]
async fn test_terminating_pod_is_deregistered() {
    let h = harness();
    let key = h.cluster.put_pod(fixtures::terminating(fixtures::pod_with_condition(
        "web-0", "10.0.0.5", 80, "True",
    )));
    correlate(&h.ctx, "web", &[&key]);

    reconcile_pod(&key, &h.ctx).await.unwrap();

    assert_eq!(h.cloud.deregistered(), vec![("10.0.0.5".to_string(), 80)]);
    assert!(h.cluster.patches().is_empty());
    assert_eq!(h.cloud.health_probes(), 0);
}

#[tokio::test]
async fn test_terminating_uncorrelated_pod_is_left_alone() {
    let h = harness();
    let key = h.cluster.put_pod(fixtures::terminating(fixtures::pod(
        "web-0",
        Some("10.0.0.5"),
        80,
        true,
    )));

    reconcile_pod(&key, &h.ctx).await.unwrap();

    assert!(h.cloud.deregistered().is_empty());
}

#[tokio::test]
async fn test_deleted_pod_drops_index_entries() {
    let h = harness();
    let key = h
        .cluster
        .put_pod(fixtures::pod("web-0", Some("10.0.0.5"), 80, false));
    reconcile_pod(&key, &h.ctx).await.unwrap();
    assert_eq!(h.ctx.index.len(), 1);

    h.cluster.delete_pod(&key);
    reconcile_pod(&key, &h.ctx).await.unwrap();

    assert!(h.ctx.index.is_empty());
}

#[tokio::test]
async fn test_unresolved_service_does_not_hide_resolved_one() {
    let h = harness();
    let key = h
        .cluster
        .put_pod(fixtures::pod("web-0", Some("10.0.0.5"), 80, true));
    // "admin" sorts before "web" and has no target groups yet
    let admin = ObjectKey::new("default", "admin");
    h.ctx.store.ensure(&admin);
    h.ctx.store.set_members(&admin, vec![key.clone()]).unwrap();
    correlate(&h.ctx, "web", &[&key]);

    reconcile_pod(&key, &h.ctx).await.unwrap();

    assert_eq!(condition_status(&h, &key), Some(ConditionStatus::True));
    assert_eq!(h.cloud.health_probes(), 1);
}

#[tokio::test]
async fn test_terminating_pod_already_absent_is_success() {
    let h = harness();
    let key = h.cluster.put_pod(fixtures::terminating(fixtures::pod_with_condition(
        "web-0", "10.0.0.5", 80, "True",
    )));
    correlate(&h.ctx, "web", &[&key]);
    h.cloud.set_deregister(DeregisterScript::AlreadyAbsent);

    reconcile_pod(&key, &h.ctx).await.unwrap();

    assert_eq!(h.cloud.deregister_attempts(), 1);
    assert!(h.cloud.deregistered().is_empty());
}

#[tokio::test]
async fn test_failed_deregistration_is_retryable() {
    let h = harness();
    let key = h.cluster.put_pod(fixtures::terminating(fixtures::pod_with_condition(
        "web-0", "10.0.0.5", 80, "True",
    )));
    correlate(&h.ctx, "web", &[&key]);
    h.cloud.set_deregister(DeregisterScript::ApiError);

    let err = reconcile_pod(&key, &h.ctx).await.unwrap_err();

    assert!(matches!(err, ReadinessError::Cloud(_)));
    assert!(h.cluster.patches().is_empty(), "condition is left alone");

    h.cloud.set_deregister(DeregisterScript::Removed);
    reconcile_pod(&key, &h.ctx).await.unwrap();
    assert_eq!(h.cloud.deregistered(), vec![("10.0.0.5".to_string(), 80)]);
}
