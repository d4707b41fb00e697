//! AWS ELBv2 (ALB/NLB) backend

use super::{CloudError, CloudProvider, EndpointGroup, LoadBalancer};
use crate::server::SharedMetrics;
use async_trait::async_trait;
use aws_config::sts::AssumeRoleProvider;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_elasticloadbalancingv2 as elbv2;
use elbv2::error::ProvideErrorMetadata;
use elbv2::operation::deregister_targets::{DeregisterTargetsError, DeregisterTargetsOutput};
use elbv2::types::{TargetDescription, TargetHealthStateEnum};
use std::collections::HashMap;
use tracing::debug;

const SESSION_NAME: &str = "kube-readiness";

pub struct AwsCloud {
    client: elbv2::Client,
    metrics: SharedMetrics,
}

impl AwsCloud {
    /// Build a client for `region`, optionally assuming `assume_role_arn`
    pub async fn new(region: &str, assume_role_arn: Option<&str>, metrics: SharedMetrics) -> Self {
        let region = Region::new(region.to_string());
        let base = aws_config::defaults(BehaviorVersion::latest())
            .region(region.clone())
            .load()
            .await;

        let config = match assume_role_arn {
            Some(role_arn) => {
                debug!(role_arn = %role_arn, "Assuming role for ELBv2 calls");
                let provider = AssumeRoleProvider::builder(role_arn)
                    .session_name(SESSION_NAME)
                    .configure(&base)
                    .build()
                    .await;
                aws_config::defaults(BehaviorVersion::latest())
                    .region(region)
                    .credentials_provider(provider)
                    .load()
                    .await
            }
            None => base,
        };

        AwsCloud {
            client: elbv2::Client::new(&config),
            metrics,
        }
    }

    fn success(&self, operation: &'static str) {
        debug!(service = "elbv2", operation, "Request succeeded");
        self.metrics.record_cloud_request(operation, "success");
    }

    fn failure<E: ProvideErrorMetadata>(&self, operation: &'static str, err: &E) {
        let result = match err.code() {
            Some("Throttling" | "ThrottlingException" | "RequestLimitExceeded") => "throttled",
            _ => "failed",
        };
        debug!(
            service = "elbv2",
            operation,
            code = ?err.code(),
            message = ?err.message(),
            "Request failed"
        );
        self.metrics.record_cloud_request(operation, result);
    }
}

/// Load balancer name encoded in its generated DNS name
///
/// `internal-my-lb-1883083075.eu-west-1.elb.amazonaws.com` -> `my-lb`
pub fn load_balancer_name(hostname: &str) -> &str {
    let label = hostname.split('.').next().unwrap_or(hostname);
    let label = label.strip_prefix("internal-").unwrap_or(label);
    match label.rsplit_once('-') {
        Some((name, _generated_id)) => name,
        None => label,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deregistration {
    Removed,
    AlreadyAbsent,
}

/// A target that is not registered in the group is already deregistered
fn deregister_outcome(
    result: Result<DeregisterTargetsOutput, DeregisterTargetsError>,
) -> Result<Deregistration, DeregisterTargetsError> {
    match result {
        Ok(_) => Ok(Deregistration::Removed),
        Err(err) if err.is_invalid_target_exception() => Ok(Deregistration::AlreadyAbsent),
        Err(err) => Err(err),
    }
}

#[async_trait]
impl CloudProvider for AwsCloud {
    async fn resolve_load_balancer(&self, hostname: &str) -> Result<LoadBalancer, CloudError> {
        const OPERATION: &str = "DescribeLoadBalancers";
        let name = load_balancer_name(hostname);

        let mut pages = self
            .client
            .describe_load_balancers()
            .names(name)
            .into_paginator()
            .send();

        let mut found = Vec::new();
        while let Some(page) = pages.next().await {
            match page {
                Ok(output) => found.extend(output.load_balancers().iter().cloned()),
                Err(err) => {
                    let err = err.into_service_error();
                    self.failure(OPERATION, &err);
                    if err.is_load_balancer_not_found_exception() {
                        return Err(CloudError::LoadBalancerNotFound(hostname.to_string()));
                    }
                    return Err(CloudError::api(OPERATION, err));
                }
            }
        }
        self.success(OPERATION);

        match found.as_slice() {
            [] => Err(CloudError::LoadBalancerNotFound(hostname.to_string())),
            [lb] => Ok(LoadBalancer {
                id: lb.load_balancer_arn().unwrap_or_default().to_string(),
                dns_name: lb.dns_name().unwrap_or_default().to_string(),
            }),
            many => Err(CloudError::AmbiguousLoadBalancer {
                hostname: hostname.to_string(),
                count: many.len(),
            }),
        }
    }

    async fn list_target_groups(
        &self,
        load_balancer: &LoadBalancer,
    ) -> Result<Vec<EndpointGroup>, CloudError> {
        const OPERATION: &str = "DescribeTargetGroups";

        let mut pages = self
            .client
            .describe_target_groups()
            .load_balancer_arn(&load_balancer.id)
            .into_paginator()
            .send();

        let mut groups = Vec::new();
        while let Some(page) = pages.next().await {
            match page {
                Ok(output) => groups.extend(
                    output
                        .target_groups()
                        .iter()
                        .filter_map(|tg| tg.target_group_arn())
                        .map(EndpointGroup::new),
                ),
                Err(err) => {
                    let err = err.into_service_error();
                    self.failure(OPERATION, &err);
                    return Err(CloudError::api(OPERATION, err));
                }
            }
        }
        self.success(OPERATION);
        Ok(groups)
    }

    async fn is_target_healthy(
        &self,
        groups: &[EndpointGroup],
        ip: &str,
        ports: &[i32],
    ) -> Result<bool, CloudError> {
        const OPERATION: &str = "DescribeTargetHealth";

        let targets: Vec<TargetDescription> = ports
            .iter()
            .map(|port| TargetDescription::builder().id(ip).port(*port).build())
            .collect();

        for group in groups {
            let output = match self
                .client
                .describe_target_health()
                .target_group_arn(&group.name)
                .set_targets(Some(targets.clone()))
                .send()
                .await
            {
                Ok(output) => output,
                Err(err) => {
                    let err = err.into_service_error();
                    self.failure(OPERATION, &err);
                    return Err(CloudError::api(OPERATION, err));
                }
            };
            self.success(OPERATION);

            let descriptions = output.target_health_descriptions();
            let mut per_port: HashMap<Option<i32>, usize> = HashMap::new();
            for description in descriptions {
                let port = description.target().and_then(|t| t.port());
                *per_port.entry(port).or_default() += 1;
            }
            if let Some((port, count)) = per_port.into_iter().find(|(_, count)| *count > 1) {
                return Err(CloudError::AmbiguousTargetHealth {
                    group: group.name.clone(),
                    target: format!("{}:{}", ip, port.unwrap_or_default()),
                    count,
                });
            }

            let healthy = descriptions.iter().any(|d| {
                d.target_health()
                    .and_then(|h| h.state())
                    .is_some_and(|state| *state == TargetHealthStateEnum::Healthy)
            });
            if healthy {
                return Ok(true);
            }
        }

        Ok(false)
    }

    async fn deregister_target(
        &self,
        groups: &[EndpointGroup],
        ip: &str,
        port: i32,
    ) -> Result<(), CloudError> {
        const OPERATION: &str = "DeregisterTargets";

        let target = TargetDescription::builder().id(ip).port(port).build();

        for group in groups {
            let result = self
                .client
                .deregister_targets()
                .target_group_arn(&group.name)
                .targets(target.clone())
                .send()
                .await
                .map_err(|err| err.into_service_error());
            match deregister_outcome(result) {
                Ok(Deregistration::Removed) => self.success(OPERATION),
                Ok(Deregistration::AlreadyAbsent) => {
                    debug!(group = %group, target = %ip, port, "Target already absent");
                }
                Err(err) => {
                    self.failure(OPERATION, &err);
                    return Err(CloudError::api(OPERATION, err));
                }
            }
        }
        Ok(())
    }
}
