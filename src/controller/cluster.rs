//! Kubernetes collaborator
//!
//! Typed reads return `Ok(None)` when the object does not exist, so callers
//! can treat "not found" as deletion instead of failure.

use crate::error::{ReadinessError, Result};
use crate::model::{ObjectKey, PodRef, ReadinessCondition, ReadinessGate};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Endpoints, Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use tracing::debug;

#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_pod(&self, key: &PodRef) -> Result<Option<Pod>>;

    async fn get_service(&self, key: &ObjectKey) -> Result<Option<Service>>;

    async fn get_endpoints(&self, key: &ObjectKey) -> Result<Option<Endpoints>>;

    async fn get_ingress(&self, key: &ObjectKey) -> Result<Option<Ingress>>;

    /// Write one readiness condition to the pod's status sub-resource
    ///
    /// The write is conditional on the resourceVersion of `pod`; a stale
    /// pod yields `ReadinessError::Conflict`.
    async fn patch_pod_condition(
        &self,
        gate: &ReadinessGate,
        key: &PodRef,
        pod: &Pod,
        condition: &ReadinessCondition,
    ) -> Result<()>;
}

#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        KubeCluster { client }
    }

    async fn get<K>(&self, key: &ObjectKey) -> Result<Option<K>>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), &key.namespace);
        Ok(api.get_opt(&key.name).await?)
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_pod(&self, key: &PodRef) -> Result<Option<Pod>> {
        self.get(key).await
    }

    async fn get_service(&self, key: &ObjectKey) -> Result<Option<Service>> {
        self.get(key).await
    }

    async fn get_endpoints(&self, key: &ObjectKey) -> Result<Option<Endpoints>> {
        self.get(key).await
    }

    async fn get_ingress(&self, key: &ObjectKey) -> Result<Option<Ingress>> {
        self.get(key).await
    }

    async fn patch_pod_condition(
        &self,
        gate: &ReadinessGate,
        key: &PodRef,
        pod: &Pod,
        condition: &ReadinessCondition,
    ) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &key.namespace);
        let patch = gate.status_patch(pod, condition);
        debug!(pod = %key, status = %condition.status, "Patching readiness condition");

        match api
            .patch_status(&key.name, &PatchParams::default(), &Patch::Strategic(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 409 => {
                Err(ReadinessError::Conflict(key.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
