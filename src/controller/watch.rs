//! Watch plumbing: Kubernetes watch streams to engine events

use super::engine::Event;
use super::ResourceKind;
use crate::model::ObjectKey;
use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Api for `K` in `namespace`, or across all namespaces
pub fn scoped_api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(namespace) => Api::namespaced(client, namespace),
        None => Api::all(client),
    }
}

/// Forward every applied or deleted object of one kind as an [`Event`]
///
/// Watch errors are retried with the default backoff. Returns when the
/// engine side of the channel is gone.
pub async fn forward_events<K>(api: Api<K>, kind: ResourceKind, events: mpsc::Sender<Event>)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
    K::DynamicType: Default,
{
    info!(kind = %kind, "Starting watch");
    let stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .touched_objects();
    futures::pin_mut!(stream);

    while let Some(item) = stream.next().await {
        match item {
            Ok(obj) => {
                let Some(key) = ObjectKey::from_resource(&obj) else {
                    continue;
                };
                if events.send(Event::new(kind, key)).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!(kind = %kind, error = %e, "Watch error"),
        }
    }
    info!(kind = %kind, "Watch stopped");
}
