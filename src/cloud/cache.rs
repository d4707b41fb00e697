//! Response cache in front of a cloud provider
//!
//! Pod retries and periodic rechecks query the same targets over and over.
//! With the cache enabled, load balancer lookups and target health answers
//! are reused until their TTL expires. Only successful answers are cached.

use super::{CloudError, CloudProvider, EndpointGroup, LoadBalancer};
use crate::server::SharedMetrics;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub const LOAD_BALANCER_TTL: Duration = Duration::from_secs(60);
pub const TARGET_HEALTH_TTL: Duration = Duration::from_secs(10);

type HealthKey = (Vec<EndpointGroup>, String, Vec<i32>);

struct TtlMap<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, (Instant, V)>>,
}

impl<K: Eq + Hash, V: Clone> TtlMap<K, V> {
    fn new(ttl: Duration) -> Self {
        TtlMap {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((stored, value)) if stored.elapsed() < self.ttl => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn insert(&self, key: K, value: V) {
        self.entries.lock().insert(key, (Instant::now(), value));
    }

    fn retain<F: FnMut(&K) -> bool>(&self, mut keep: F) {
        self.entries.lock().retain(|key, _| keep(key));
    }
}

pub struct CachedCloud {
    inner: Arc<dyn CloudProvider>,
    metrics: SharedMetrics,
    load_balancers: TtlMap<String, LoadBalancer>,
    target_health: TtlMap<HealthKey, bool>,
}

impl CachedCloud {
    pub fn new(inner: Arc<dyn CloudProvider>, metrics: SharedMetrics) -> Self {
        Self::with_ttls(inner, metrics, LOAD_BALANCER_TTL, TARGET_HEALTH_TTL)
    }

    pub fn with_ttls(
        inner: Arc<dyn CloudProvider>,
        metrics: SharedMetrics,
        load_balancer_ttl: Duration,
        target_health_ttl: Duration,
    ) -> Self {
        CachedCloud {
            inner,
            metrics,
            load_balancers: TtlMap::new(load_balancer_ttl),
            target_health: TtlMap::new(target_health_ttl),
        }
    }

    fn lookup<K: Eq + Hash, V: Clone>(
        &self,
        operation: &'static str,
        map: &TtlMap<K, V>,
        key: &K,
    ) -> Option<V> {
        let found = map.get(key);
        self.metrics.record_cache_lookup(operation, found.is_some());
        found
    }
}

#[async_trait]
impl CloudProvider for CachedCloud {
    async fn resolve_load_balancer(&self, hostname: &str) -> Result<LoadBalancer, CloudError> {
        let key = hostname.to_string();
        if let Some(hit) = self.lookup("DescribeLoadBalancers", &self.load_balancers, &key) {
            return Ok(hit);
        }
        let load_balancer = self.inner.resolve_load_balancer(hostname).await?;
        self.load_balancers.insert(key, load_balancer.clone());
        Ok(load_balancer)
    }

    async fn list_target_groups(
        &self,
        load_balancer: &LoadBalancer,
    ) -> Result<Vec<EndpointGroup>, CloudError> {
        self.inner.list_target_groups(load_balancer).await
    }

    async fn is_target_healthy(
        &self,
        groups: &[EndpointGroup],
        ip: &str,
        ports: &[i32],
    ) -> Result<bool, CloudError> {
        let key = (groups.to_vec(), ip.to_string(), ports.to_vec());
        if let Some(hit) = self.lookup("DescribeTargetHealth", &self.target_health, &key) {
            return Ok(hit);
        }
        let healthy = self.inner.is_target_healthy(groups, ip, ports).await?;
        self.target_health.insert(key, healthy);
        Ok(healthy)
    }

    async fn deregister_target(
        &self,
        groups: &[EndpointGroup],
        ip: &str,
        port: i32,
    ) -> Result<(), CloudError> {
        self.inner.deregister_target(groups, ip, port).await?;
        self.target_health.retain(|(_, cached_ip, _)| cached_ip != ip);
        Ok(())
    }
}
