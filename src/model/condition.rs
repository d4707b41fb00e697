//! Readiness gate condition helpers
//!
//! The readiness condition lives in `pod.status.conditions` under the gate's
//! condition type. Timestamps are handled as RFC 3339 strings on the wire so
//! the helpers do not depend on the datetime representation used by
//! `k8s-openapi`.

use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::Pod;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::fmt;

/// Condition type used when none is configured
pub const DEFAULT_READINESS_GATE: &str = "kube-readiness.io/load-balancer-ready";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionStatus {
    Unknown,
    False,
    True,
}

impl ConditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionStatus::Unknown => "Unknown",
            ConditionStatus::False => "False",
            ConditionStatus::True => "True",
        }
    }

    /// Anything Kubernetes does not define maps to `Unknown`
    pub fn parse(value: &str) -> Self {
        match value {
            "True" => ConditionStatus::True,
            "False" => ConditionStatus::False,
            _ => ConditionStatus::Unknown,
        }
    }
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The readiness gate condition of one pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessCondition {
    pub status: ConditionStatus,
    pub last_probe_time: Option<DateTime<Utc>>,
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl ReadinessCondition {
    /// Implicit initial condition of a gated pod
    pub fn unknown() -> Self {
        ReadinessCondition {
            status: ConditionStatus::Unknown,
            last_probe_time: None,
            last_transition_time: None,
        }
    }

    /// Condition after observing `status` at `now`
    ///
    /// `last_transition_time` only moves when the status changes (or was
    /// never set); `last_probe_time` always moves.
    pub fn observe(&self, status: ConditionStatus, now: DateTime<Utc>) -> Self {
        let last_transition_time = if status != self.status || self.last_transition_time.is_none()
        {
            Some(now)
        } else {
            self.last_transition_time
        };

        ReadinessCondition {
            status,
            last_probe_time: Some(now),
            last_transition_time,
        }
    }
}

impl Default for ReadinessCondition {
    fn default() -> Self {
        Self::unknown()
    }
}

/// The readiness gate this controller is responsible for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessGate {
    condition_type: String,
}

impl ReadinessGate {
    pub fn new(condition_type: impl Into<String>) -> Self {
        ReadinessGate {
            condition_type: condition_type.into(),
        }
    }

    pub fn condition_type(&self) -> &str {
        &self.condition_type
    }

    /// Whether the pod declares this gate in `spec.readinessGates`
    pub fn is_enabled(&self, pod: &Pod) -> bool {
        pod.spec
            .as_ref()
            .and_then(|spec| spec.readiness_gates.as_ref())
            .is_some_and(|gates| {
                gates
                    .iter()
                    .any(|gate| gate.condition_type == self.condition_type)
            })
    }

    /// Current gate condition of the pod, `None` if it was never written
    pub fn condition(&self, pod: &Pod) -> Option<ReadinessCondition> {
        let condition = pod
            .status
            .as_ref()?
            .conditions
            .as_ref()?
            .iter()
            .find(|c| c.type_ == self.condition_type)?;

        Some(ReadinessCondition {
            status: ConditionStatus::parse(&condition.status),
            last_probe_time: condition.last_probe_time.as_ref().and_then(parse_time),
            last_transition_time: condition
                .last_transition_time
                .as_ref()
                .and_then(parse_time),
        })
    }

    /// Wire form of the condition as it appears in `status.conditions`
    pub fn condition_json(&self, condition: &ReadinessCondition) -> Value {
        let mut body = Map::new();
        body.insert("type".to_string(), json!(self.condition_type));
        body.insert("status".to_string(), json!(condition.status.as_str()));
        if let Some(t) = condition.last_probe_time {
            body.insert("lastProbeTime".to_string(), json!(format_time(t)));
        }
        if let Some(t) = condition.last_transition_time {
            body.insert("lastTransitionTime".to_string(), json!(format_time(t)));
        }
        Value::Object(body)
    }

    /// Strategic merge patch for the status sub-resource
    ///
    /// Pod conditions merge on `type`, so other writers' conditions are left
    /// alone. The pod's resourceVersion is included, which turns a concurrent
    /// write into a 409 instead of a silent overwrite.
    pub fn status_patch(&self, pod: &Pod, condition: &ReadinessCondition) -> Value {
        let mut patch = json!({
            "status": {
                "conditions": [self.condition_json(condition)]
            }
        });
        if let Some(resource_version) = &pod.metadata.resource_version {
            patch["metadata"] = json!({ "resourceVersion": resource_version });
        }
        patch
    }

    /// Set the condition on an in-memory pod, replacing an existing entry of
    /// the same type or appending a new one
    pub fn apply(&self, pod: &Pod, condition: &ReadinessCondition) -> serde_json::Result<Pod> {
        let mut value = serde_json::to_value(pod)?;
        let new_condition = self.condition_json(condition);

        let root = value
            .as_object_mut()
            .ok_or_else(|| invalid("pod is not an object"))?;
        let status = root
            .entry("status")
            .or_insert_with(|| Value::Object(Map::new()));
        let status = status
            .as_object_mut()
            .ok_or_else(|| invalid("pod status is not an object"))?;
        let conditions = status
            .entry("conditions")
            .or_insert_with(|| Value::Array(Vec::new()));

        if let Value::Array(items) = conditions {
            match items
                .iter_mut()
                .find(|c| c["type"] == json!(self.condition_type))
            {
                Some(existing) => *existing = new_condition,
                None => items.push(new_condition),
            }
        }

        serde_json::from_value(value)
    }
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new(DEFAULT_READINESS_GATE)
    }
}

fn invalid(msg: &str) -> serde_json::Error {
    <serde_json::Error as serde::de::Error>::custom(msg)
}

/// Read a Kubernetes timestamp through its serialized RFC 3339 form
pub fn parse_time<T: Serialize>(time: &T) -> Option<DateTime<Utc>> {
    let value = serde_json::to_value(time).ok()?;
    let raw = value.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Kubernetes `Time` has second precision
pub fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
#[path = "condition_test.rs"]
mod tests;
