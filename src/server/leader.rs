//! Leader election for multi-replica safety
//!
//! Uses a coordination.k8s.io/v1 Lease so only one replica reconciles and
//! writes readiness conditions at a time. Lease timestamps are read and
//! written through their RFC 3339 wire form.

use super::ShutdownSignal;
use crate::model::condition::parse_time;
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::coordination::v1::Lease;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Default lease TTL (how long leadership is valid)
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(15);

/// Default renew interval (should be ~1/3 of TTL)
pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(5);

pub const DEFAULT_LEASE_NAME: &str = "kube-readiness-leader";

const DEFAULT_LEASE_NAMESPACE: &str = "kube-system";

/// Leader election configuration
#[derive(Debug, Clone)]
pub struct LeaderConfig {
    /// Unique identifier for this instance (usually pod name)
    pub holder_id: String,
    pub lease_name: String,
    pub lease_namespace: String,
    /// How long leadership is valid (in seconds)
    pub lease_duration_seconds: i32,
    pub renew_interval: Duration,
}

impl LeaderConfig {
    /// Create config from environment variables
    ///
    /// - `POD_NAME` for holder_id (falls back to `HOSTNAME`, then a UUID)
    /// - `POD_NAMESPACE` for lease_namespace (falls back to "kube-system")
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let holder_id = lookup("POD_NAME")
            .or_else(|| lookup("HOSTNAME"))
            .unwrap_or_else(|| format!("kube-readiness-{}", uuid::Uuid::new_v4()));

        let lease_namespace =
            lookup("POD_NAMESPACE").unwrap_or_else(|| DEFAULT_LEASE_NAMESPACE.to_string());

        Self {
            holder_id,
            lease_name: DEFAULT_LEASE_NAME.to_string(),
            lease_namespace,
            lease_duration_seconds: DEFAULT_LEASE_TTL.as_secs() as i32,
            renew_interval: DEFAULT_RENEW_INTERVAL,
        }
    }
}

/// Shared state for leader status
///
/// Clones share the flag; [`LeaderState::subscribe`] lets a task wait for
/// changes instead of polling.
#[derive(Clone)]
pub struct LeaderState {
    is_leader: Arc<AtomicBool>,
    changes: Arc<watch::Sender<bool>>,
}

impl LeaderState {
    /// Create new leader state (initially not leader)
    pub fn new() -> Self {
        let (changes, _) = watch::channel(false);
        Self {
            is_leader: Arc::new(AtomicBool::new(false)),
            changes: Arc::new(changes),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Update leader status
    ///
    /// Used by the election loop and by main() when leader election is
    /// disabled.
    pub fn set_leader(&self, is_leader: bool) {
        self.is_leader.store(is_leader, Ordering::SeqCst);
        self.changes.send_if_modified(|current| {
            let changed = *current != is_leader;
            *current = is_leader;
            changed
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.changes.subscribe()
    }

    /// Resolve once this instance holds the lease
    pub async fn wait_until_leader(&self) {
        let mut changes = self.subscribe();
        let _ = changes.wait_for(|leader| *leader).await;
    }

    /// Resolve once leadership is lost
    pub async fn wait_until_lost(&self) {
        let mut changes = self.subscribe();
        let _ = changes.wait_for(|leader| !*leader).await;
    }
}

impl Default for LeaderState {
    fn default() -> Self {
        Self::new()
    }
}

/// Lease spec fields this election reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseView {
    pub holder: Option<String>,
    pub renew_time: Option<DateTime<Utc>>,
    pub lease_duration_seconds: Option<i32>,
    pub transitions: i32,
}

impl LeaseView {
    pub fn from_lease(lease: &Lease) -> Self {
        let spec = lease.spec.as_ref();
        LeaseView {
            holder: spec.and_then(|s| s.holder_identity.clone()),
            renew_time: spec.and_then(|s| s.renew_time.as_ref()).and_then(parse_time),
            lease_duration_seconds: spec.and_then(|s| s.lease_duration_seconds),
            transitions: spec.and_then(|s| s.lease_transitions).unwrap_or(0),
        }
    }

    /// Expired leases (or ones missing renew time or duration) can be taken over
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match (self.renew_time, self.lease_duration_seconds) {
            (Some(renew), Some(duration)) => {
                now > renew + chrono::Duration::seconds(duration as i64)
            }
            _ => true,
        }
    }
}

/// Lease timestamps are MicroTime
fn micro_time(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Try to acquire or renew leadership
///
/// Returns true if we are now the leader, false otherwise.
async fn try_acquire_or_renew(
    api: &Api<Lease>,
    config: &LeaderConfig,
) -> Result<bool, kube::Error> {
    let now = Utc::now();

    let Some(existing) = api.get_opt(&config.lease_name).await? else {
        info!(holder_id = %config.holder_id, "Creating new lease");
        let lease: Lease = serde_json::from_value(json!({
            "metadata": {
                "name": config.lease_name,
                "namespace": config.lease_namespace,
            },
            "spec": {
                "holderIdentity": config.holder_id,
                "acquireTime": micro_time(now),
                "renewTime": micro_time(now),
                "leaseDurationSeconds": config.lease_duration_seconds,
                "leaseTransitions": 0
            }
        }))
        .map_err(kube::Error::SerdeError)?;

        return match api.create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            // another replica created it first; retry on the next interval
            Err(kube::Error::Api(err)) if err.code == 409 => {
                info!(
                    holder_id = %config.holder_id,
                    "Lease already created by another holder"
                );
                Ok(false)
            }
            Err(e) => Err(e),
        };
    };

    let view = LeaseView::from_lease(&existing);

    if view.holder.as_deref() == Some(config.holder_id.as_str()) {
        debug!(holder_id = %config.holder_id, "Renewing lease");
        let patch = json!({
            "spec": {
                "renewTime": micro_time(now),
                "leaseDurationSeconds": config.lease_duration_seconds
            }
        });
        api.patch(
            &config.lease_name,
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
        return Ok(true);
    }

    if view.is_expired(now) {
        debug!(holder_id = %config.holder_id, "Lease expired, attempting to acquire");
        // resourceVersion makes two replicas racing for the same lease conflict
        let patch = json!({
            "metadata": { "resourceVersion": existing.metadata.resource_version },
            "spec": {
                "holderIdentity": config.holder_id,
                "acquireTime": micro_time(now),
                "renewTime": micro_time(now),
                "leaseDurationSeconds": config.lease_duration_seconds,
                "leaseTransitions": view.transitions + 1
            }
        });
        return match api
            .patch(
                &config.lease_name,
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(err)) if err.code == 409 => Ok(false),
            Err(e) => Err(e),
        };
    }

    debug!(
        holder_id = %config.holder_id,
        current_holder = ?view.holder,
        "Lease held by another instance"
    );
    Ok(false)
}

/// Run leader election loop
///
/// Continuously tries to acquire/renew leadership and publishes the result
/// in `state`. Returns when the shutdown signal fires.
pub async fn run_leader_election(
    client: Client,
    config: LeaderConfig,
    state: LeaderState,
    mut shutdown: ShutdownSignal,
) {
    let api: Api<Lease> = Api::namespaced(client, &config.lease_namespace);

    info!(
        holder_id = %config.holder_id,
        lease_name = %config.lease_name,
        lease_namespace = %config.lease_namespace,
        "Starting leader election"
    );

    // first tick fires immediately
    let mut renew_interval = tokio::time::interval(config.renew_interval);

    loop {
        tokio::select! {
            _ = renew_interval.tick() => {
                match try_acquire_or_renew(&api, &config).await {
                    Ok(is_leader) => {
                        let was_leader = state.is_leader();
                        state.set_leader(is_leader);

                        if is_leader && !was_leader {
                            info!(holder_id = %config.holder_id, "Acquired leadership");
                        } else if !is_leader && was_leader {
                            warn!(holder_id = %config.holder_id, "Lost leadership");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Leader election error");
                        if state.is_leader() {
                            warn!(holder_id = %config.holder_id, "Lost leadership due to error");
                            state.set_leader(false);
                        }
                    }
                }
            }
            _ = shutdown.wait() => {
                // the lease is left to expire
                info!("Leader election shutting down");
                break;
            }
        }
    }
}
