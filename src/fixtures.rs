//! Kubernetes object fixtures for unit tests

use k8s_openapi::api::core::v1::{Endpoints, Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;

pub const GATE: &str = "kube-readiness.io/load-balancer-ready";

#[allow(clippy::unwrap_used)]
fn from_yaml<T: serde::de::DeserializeOwned>(yaml: &str) -> T {
    serde_yaml::from_str(yaml).unwrap()
}

/// Pod with one container port, optionally gated and with an IP
pub fn pod(name: &str, ip: Option<&str>, port: i32, gated: bool) -> Pod {
    let gates = if gated {
        format!("  readinessGates:\n  - conditionType: {GATE}\n")
    } else {
        String::new()
    };
    let status = match ip {
        Some(ip) => format!("status:\n  podIP: {ip}\n"),
        None => String::new(),
    };
    from_yaml(&format!(
        r#"
apiVersion: v1
kind: Pod
metadata:
  name: {name}
  namespace: default
  resourceVersion: "1"
spec:
  containers:
  - name: app
    image: nginx
    ports:
    - name: http
      containerPort: {port}
{gates}{status}"#
    ))
}

/// Same pod with its gate condition already written
pub fn pod_with_condition(name: &str, ip: &str, port: i32, status: &str) -> Pod {
    from_yaml(&format!(
        r#"
apiVersion: v1
kind: Pod
metadata:
  name: {name}
  namespace: default
  resourceVersion: "1"
spec:
  containers:
  - name: app
    image: nginx
    ports:
    - name: http
      containerPort: {port}
  readinessGates:
  - conditionType: {GATE}
status:
  podIP: {ip}
  conditions:
  - type: Ready
    status: "False"
  - type: {GATE}
    status: "{status}"
    lastTransitionTime: "2024-01-01T00:00:00Z"
"#
    ))
}

pub fn service(name: &str, port: i32, target_port: i32) -> Service {
    from_yaml(&format!(
        r#"
apiVersion: v1
kind: Service
metadata:
  name: {name}
  namespace: default
spec:
  ports:
  - port: {port}
    targetPort: {target_port}
"#
    ))
}

/// Endpoints with one subset; addresses are (ip, ready)
pub fn endpoints(name: &str, port: i32, addresses: &[(&str, bool)]) -> Endpoints {
    let ready: Vec<String> = addresses
        .iter()
        .filter(|(_, ready)| *ready)
        .map(|(ip, _)| format!("  - ip: {ip}\n"))
        .collect();
    let not_ready: Vec<String> = addresses
        .iter()
        .filter(|(_, ready)| !*ready)
        .map(|(ip, _)| format!("  - ip: {ip}\n"))
        .collect();

    let mut subset = String::from("subsets:\n- ports:\n  - port: ");
    subset.push_str(&port.to_string());
    subset.push('\n');
    if !ready.is_empty() {
        subset.push_str("  addresses:\n");
        subset.push_str(&ready.concat());
    }
    if !not_ready.is_empty() {
        subset.push_str("  notReadyAddresses:\n");
        subset.push_str(&not_ready.concat());
    }

    from_yaml(&format!(
        r#"
apiVersion: v1
kind: Endpoints
metadata:
  name: {name}
  namespace: default
{subset}"#
    ))
}

/// Ingress with a single `/` rule routing to `service:port`
pub fn ingress(name: &str, service: &str, port: i32, hostname: Option<&str>) -> Ingress {
    let status = match hostname {
        Some(host) => format!("status:\n  loadBalancer:\n    ingress:\n    - hostname: {host}\n"),
        None => String::new(),
    };
    from_yaml(&format!(
        r#"
apiVersion: networking.k8s.io/v1
kind: Ingress
metadata:
  name: {name}
  namespace: default
spec:
  rules:
  - host: app.example.com
    http:
      paths:
      - path: /
        pathType: Prefix
        backend:
          service:
            name: {service}
            port:
              number: {port}
{status}"#
    ))
}

/// The pod with `metadata.deletionTimestamp` set
pub fn terminating(pod: Pod) -> Pod {
    let mut value = serde_json::to_value(pod).unwrap();
    value["metadata"]["deletionTimestamp"] = serde_json::json!("2024-01-01T00:00:00Z");
    serde_json::from_value(value).unwrap()
}
