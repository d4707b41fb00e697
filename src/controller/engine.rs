//! Reconciliation engine
//!
//! Owns one work queue per reconciled kind and the workers draining them.
//! Service and Endpoints changes share the service queue, so one service is
//! never reconciled by two workers at once.
//! Watch notifications arrive as [`Event`]s on a bounded channel and are
//! turned into queue keys; follow-up work (an ingress touching its services
//! and pods, a service touching its members) is enqueued the same way.

use super::ingress::{reconcile_ingress, IngressOutcome};
use super::pod::reconcile_pod;
use super::queue::WorkQueue;
use super::service::reconcile_service;
use super::{Context, ResourceKind};
use crate::config::Config;
use crate::error::{ReadinessError, Result};
use crate::model::{ObjectKey, PodRef};
use crate::server::ShutdownSignal;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Kinds with their own queue and workers
const QUEUED_KINDS: [ResourceKind; 3] = [
    ResourceKind::Pod,
    ResourceKind::Service,
    ResourceKind::Ingress,
];

/// A change notification for one object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: ResourceKind,
    pub key: ObjectKey,
}

impl Event {
    pub fn new(kind: ResourceKind, key: ObjectKey) -> Self {
        Event { kind, key }
    }
}

pub struct Engine {
    ctx: Context,
    pods: WorkQueue<PodRef>,
    services: WorkQueue<ObjectKey>,
    ingresses: WorkQueue<ObjectKey>,
    workers: usize,
    max_retries: u32,
    ingress_recheck: Duration,
    resync_interval: Duration,
}

impl Engine {
    pub fn new(ctx: Context, config: &Config) -> Self {
        Engine {
            ctx,
            pods: WorkQueue::new(config.backoff),
            services: WorkQueue::new(config.backoff),
            ingresses: WorkQueue::new(config.backoff),
            workers: config.workers.max(1),
            max_retries: config.max_retries,
            ingress_recheck: config.ingress_recheck,
            resync_interval: config.resync,
        }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    fn queue(&self, kind: ResourceKind) -> &WorkQueue<ObjectKey> {
        match kind {
            ResourceKind::Pod => &self.pods,
            ResourceKind::Service | ResourceKind::Endpoints => &self.services,
            ResourceKind::Ingress => &self.ingresses,
        }
    }

    pub fn notify_pod_changed(&self, key: PodRef) {
        self.pods.add(key);
    }

    pub fn notify_service_changed(&self, key: ObjectKey) {
        self.services.add(key);
    }

    /// Endpoints are keyed by their service
    pub fn notify_endpoints_changed(&self, key: ObjectKey) {
        self.services.add(key);
    }

    pub fn notify_ingress_changed(&self, key: ObjectKey) {
        self.ingresses.add(key);
    }

    pub fn notify(&self, event: Event) {
        match event.kind {
            ResourceKind::Pod => self.notify_pod_changed(event.key),
            ResourceKind::Service => self.notify_service_changed(event.key),
            ResourceKind::Endpoints => self.notify_endpoints_changed(event.key),
            ResourceKind::Ingress => self.notify_ingress_changed(event.key),
        }
    }

    /// Re-enqueue every known ingress and indexed pod
    pub fn resync(&self) {
        let ingresses = self.ctx.store.ingresses();
        let pods = self.ctx.index.pods();
        debug!(ingresses = ingresses.len(), pods = pods.len(), "Periodic resync");
        for key in ingresses {
            self.ingresses.add(key);
        }
        for key in pods {
            self.pods.add(key);
        }
    }

    pub fn shut_down(&self) {
        for kind in QUEUED_KINDS {
            self.queue(kind).shut_down();
        }
    }

    async fn reconcile(&self, kind: ResourceKind, key: &ObjectKey) -> Result<()> {
        match kind {
            ResourceKind::Pod => reconcile_pod(key, &self.ctx).await,
            ResourceKind::Service | ResourceKind::Endpoints => {
                for pod in reconcile_service(key, &self.ctx).await? {
                    self.pods.add(pod);
                }
                Ok(())
            }
            ResourceKind::Ingress => {
                match reconcile_ingress(key, &self.ctx).await? {
                    IngressOutcome::Resolved { services, pods } => {
                        for service in services {
                            self.services.add(service);
                        }
                        for pod in pods {
                            self.pods.add(pod);
                        }
                        self.ingresses.add_after(key.clone(), self.ingress_recheck);
                    }
                    IngressOutcome::Removed { pods } => {
                        for pod in pods {
                            self.pods.add(pod);
                        }
                    }
                }
                Ok(())
            }
        }
    }

    /// Apply the retry policy to one reconciliation result
    pub(crate) fn finish(
        &self,
        kind: ResourceKind,
        key: &ObjectKey,
        result: Result<()>,
        elapsed: Duration,
    ) {
        let queue = self.queue(kind);
        let metrics = &self.ctx.metrics;
        let kind_label = kind.as_str();

        let err = match result {
            Ok(()) => {
                metrics.record_reconciliation_success(kind_label, elapsed.as_secs_f64());
                queue.forget(key);
                return;
            }
            Err(err) => err,
        };
        metrics.record_reconciliation_error(kind_label, elapsed.as_secs_f64());

        let requeues = queue.num_requeues(key);
        if requeues >= self.max_retries {
            warn!(
                kind = %kind,
                key = %key,
                error = %err,
                retries = requeues,
                "Giving up until the next change"
            );
            queue.forget(key);
            metrics.record_dropped(kind_label);
            return;
        }

        match err {
            ReadinessError::NotReady(_) | ReadinessError::Unhealthy(_) => {
                debug!(kind = %kind, key = %key, error = %err, retries = requeues, "Will retry");
            }
            _ => {
                warn!(
                    kind = %kind,
                    key = %key,
                    error = %err,
                    error_kind = err.kind(),
                    retries = requeues,
                    "Reconcile error (will retry)"
                );
            }
        }
        queue.add_rate_limited(key.clone());
        metrics.record_retry(kind_label);
    }

    async fn worker(self: Arc<Self>, kind: ResourceKind) {
        let queue = self.queue(kind).clone();
        while let Some(key) = queue.get().await {
            let started = Instant::now();
            let result = self.reconcile(kind, &key).await;
            self.finish(kind, &key, result, started.elapsed());
            queue.done(&key);
            self.ctx.metrics.set_queue_depth(kind.as_str(), queue.len());
        }
        debug!(kind = %kind, "Worker stopped");
    }

    /// Drain `events` into the queues until shutdown or until the channel
    /// closes, then stop the workers
    ///
    /// In-flight reconciliations finish before this returns.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<Event>, mut shutdown: ShutdownSignal) {
        let mut workers = Vec::new();
        for kind in QUEUED_KINDS {
            for _ in 0..self.workers {
                workers.push(tokio::spawn(self.clone().worker(kind)));
            }
        }
        info!(workers_per_kind = self.workers, "Reconciliation engine started");

        let mut resync = tokio::time::interval(self.resync_interval);
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately
        resync.tick().await;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.notify(event),
                    None => {
                        info!("Event channel closed");
                        break;
                    }
                },
                _ = resync.tick() => self.resync(),
                _ = shutdown.wait() => {
                    info!("Reconciliation engine shutting down");
                    break;
                }
            }
        }

        self.shut_down();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Worker task failed");
            }
        }
        info!("Reconciliation engine stopped");
    }
}

#[cfg(test)]
#[path = "engine_test.rs"]
mod tests;
