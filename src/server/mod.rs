//! Process surfaces around the engine
//!
//! - `/healthz`, `/readyz` and `/metrics` HTTP endpoints
//! - Prometheus metrics registry
//! - Lease based leader election
//! - Shutdown signal

mod health;
pub mod leader;
pub mod metrics;
mod shutdown;

pub use health::{run_health_server, ReadinessState};
pub use leader::{run_leader_election, LeaderConfig, LeaderState};
pub use metrics::{create_metrics, ControllerMetrics, SharedMetrics};
pub use shutdown::{shutdown_channel, trigger_on_os_signal, ShutdownSignal, ShutdownTrigger};

#[cfg(test)]
#[path = "health_test.rs"]
mod tests;

#[cfg(test)]
#[path = "leader_test.rs"]
mod leader_tests;

#[cfg(test)]
#[path = "metrics_test.rs"]
mod metrics_tests;
