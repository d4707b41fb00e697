//! In-memory Kubernetes collaborator for tests

use super::cluster::ClusterApi;
use super::Context;
use crate::cloud::fake::FakeCloud;
use crate::error::{ReadinessError, Result};
use crate::fixtures::GATE;
use crate::model::{ConditionStatus, ObjectKey, PodRef, ReadinessCondition, ReadinessGate};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Endpoints, Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::Resource;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Context over in-memory collaborators with a fresh index, store and registry
pub fn context(cluster: &Arc<FakeCluster>, cloud: &Arc<FakeCloud>) -> Context {
    Context::new(
        cluster.clone(),
        cloud.clone(),
        ReadinessGate::new(GATE),
        crate::server::create_metrics().expect("metrics registry"),
    )
}

#[derive(Default)]
pub struct FakeCluster {
    pods: Mutex<HashMap<ObjectKey, Pod>>,
    services: Mutex<HashMap<ObjectKey, Service>>,
    endpoints: Mutex<HashMap<ObjectKey, Endpoints>>,
    ingresses: Mutex<HashMap<ObjectKey, Ingress>>,
    patches: Mutex<Vec<(PodRef, ConditionStatus)>>,
    conflicts: Mutex<usize>,
}

fn key_of<K: Resource>(obj: &K) -> ObjectKey {
    ObjectKey::from_resource(obj).expect("fixture objects are namespaced")
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_pod(&self, pod: Pod) -> PodRef {
        let key = key_of(&pod);
        self.pods.lock().insert(key.clone(), pod);
        key
    }

    pub fn delete_pod(&self, key: &PodRef) {
        self.pods.lock().remove(key);
    }

    pub fn put_service(&self, service: Service) -> ObjectKey {
        let key = key_of(&service);
        self.services.lock().insert(key.clone(), service);
        key
    }

    pub fn delete_service(&self, key: &ObjectKey) {
        self.services.lock().remove(key);
    }

    pub fn put_endpoints(&self, endpoints: Endpoints) -> ObjectKey {
        let key = key_of(&endpoints);
        self.endpoints.lock().insert(key.clone(), endpoints);
        key
    }

    pub fn put_ingress(&self, ingress: Ingress) -> ObjectKey {
        let key = key_of(&ingress);
        self.ingresses.lock().insert(key.clone(), ingress);
        key
    }

    pub fn delete_ingress(&self, key: &ObjectKey) {
        self.ingresses.lock().remove(key);
    }

    pub fn pod(&self, key: &PodRef) -> Option<Pod> {
        self.pods.lock().get(key).cloned()
    }

    /// Every accepted condition write, in order
    pub fn patches(&self) -> Vec<(PodRef, ConditionStatus)> {
        self.patches.lock().clone()
    }

    /// Reject the next `n` condition writes with a conflict
    pub fn inject_conflicts(&self, n: usize) {
        *self.conflicts.lock() = n;
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get_pod(&self, key: &PodRef) -> Result<Option<Pod>> {
        Ok(self.pods.lock().get(key).cloned())
    }

    async fn get_service(&self, key: &ObjectKey) -> Result<Option<Service>> {
        Ok(self.services.lock().get(key).cloned())
    }

    async fn get_endpoints(&self, key: &ObjectKey) -> Result<Option<Endpoints>> {
        Ok(self.endpoints.lock().get(key).cloned())
    }

    async fn get_ingress(&self, key: &ObjectKey) -> Result<Option<Ingress>> {
        Ok(self.ingresses.lock().get(key).cloned())
    }

    async fn patch_pod_condition(
        &self,
        gate: &ReadinessGate,
        key: &PodRef,
        _pod: &Pod,
        condition: &ReadinessCondition,
    ) -> Result<()> {
        {
            let mut conflicts = self.conflicts.lock();
            if *conflicts > 0 {
                *conflicts -= 1;
                return Err(ReadinessError::Conflict(key.clone()));
            }
        }

        let mut pods = self.pods.lock();
        let Some(current) = pods.get(key) else {
            return Err(ReadinessError::not_ready(format!("pod {} is gone", key)));
        };
        let updated = gate
            .apply(current, condition)
            .expect("condition applies to fixture pod");
        pods.insert(key.clone(), updated);
        self.patches.lock().push((key.clone(), condition.status));
        Ok(())
    }
}
