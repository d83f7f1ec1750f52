//! Vigil kubehub: the Kubernetes API as a `ListerWatcher`.

#![forbid(unsafe_code)]

use std::fmt::Debug;

use anyhow::{anyhow, Result};
use futures::StreamExt;
use kube::{
    api::{Api, ListParams, WatchParams},
    core::{DynamicObject, ErrorResponse, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client, Resource,
};
use metrics::counter;
use serde::de::DeserializeOwned;
use tracing::{debug, info};
use vigil_core::{ListPage, ListerWatcher, Selector, TransportError, WatchEvent, WatchStream};

/// Server-side watch timeout; must stay below the apiserver's 295s limit.
const WATCH_TIMEOUT_SECS: u32 = 290;

/// List/watch of one resource kind through a kube `Api`.
pub struct KubeListerWatcher<K> {
    api: Api<K>,
    strip_managed_fields: bool,
}

impl<K> KubeListerWatcher<K> {
    pub fn new(api: Api<K>) -> Self { Self { api, strip_managed_fields: true } }

    /// Keep `metadata.managedFields` on cached objects (dropped by default to save memory).
    pub fn keep_managed_fields(mut self) -> Self {
        self.strip_managed_fields = false;
        self
    }
}

impl KubeListerWatcher<DynamicObject> {
    /// Resolve a GVK key such as `v1/Pod` or `apps/v1/Deployment` through discovery.
    pub async fn dynamic(client: Client, gvk_key: &str, namespace: Option<&str>) -> Result<Self> {
        let gvk = parse_gvk_key(gvk_key)?;
        let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
        let api: Api<DynamicObject> = match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(client, ns, &ar),
            _ => Api::all_with(client, &ar),
        };
        info!(gvk = %gvk_key, ns = ?namespace, namespaced, "dynamic lister/watcher ready");
        Ok(Self::new(api))
    }
}

fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() }),
        [group, version, kind] => Ok(GroupVersionKind { group: (*group).to_string(), version: (*version).to_string(), kind: (*kind).to_string() }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(kube::core::ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

fn list_params(selector: &Selector) -> ListParams {
    let mut lp = ListParams::default();
    if let Some(labels) = selector.labels.as_deref() {
        lp = lp.labels(labels);
    }
    if let Some(fields) = selector.fields.as_deref() {
        lp = lp.fields(fields);
    }
    lp
}

fn watch_params(selector: &Selector) -> WatchParams {
    let mut wp = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
    if let Some(labels) = selector.labels.as_deref() {
        wp = wp.labels(labels);
    }
    if let Some(fields) = selector.fields.as_deref() {
        wp = wp.fields(fields);
    }
    wp
}

fn strip<K: Resource>(mut obj: K, strip_managed_fields: bool) -> K {
    if strip_managed_fields {
        obj.meta_mut().managed_fields = None;
    }
    obj
}

fn api_error(resp: ErrorResponse) -> TransportError {
    // 410 Gone: the cursor fell out of the server's history window.
    if resp.code == 410 {
        TransportError::Expired(resp.message)
    } else {
        TransportError::Watch(Box::new(kube::Error::Api(resp)))
    }
}

fn watch_error(err: kube::Error) -> TransportError {
    match err {
        kube::Error::Api(resp) => api_error(resp),
        other => TransportError::Watch(Box::new(other)),
    }
}

fn decode<K: Resource>(ev: kube::api::WatchEvent<K>, strip_managed_fields: bool) -> Result<WatchEvent<K>, TransportError> {
    match ev {
        kube::api::WatchEvent::Added(o) => Ok(WatchEvent::Added(strip(o, strip_managed_fields))),
        kube::api::WatchEvent::Modified(o) => Ok(WatchEvent::Modified(strip(o, strip_managed_fields))),
        kube::api::WatchEvent::Deleted(o) => Ok(WatchEvent::Deleted(strip(o, strip_managed_fields))),
        kube::api::WatchEvent::Bookmark(b) => Ok(WatchEvent::Bookmark(b.metadata.resource_version)),
        kube::api::WatchEvent::Error(resp) => Err(api_error(resp)),
    }
}

#[async_trait::async_trait]
impl<K> ListerWatcher<K> for KubeListerWatcher<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    async fn list(&self, selector: &Selector) -> Result<ListPage<K>, TransportError> {
        counter!("kube_list_requests_total", 1u64);
        let list = self
            .api
            .list(&list_params(selector))
            .await
            .map_err(|e| TransportError::List(Box::new(e)))?;
        let cursor = list.metadata.resource_version.unwrap_or_default();
        let strip_managed_fields = self.strip_managed_fields;
        let items: Vec<K> = list.items.into_iter().map(|o| strip(o, strip_managed_fields)).collect();
        debug!(count = items.len(), cursor = %cursor, "kube list");
        Ok(ListPage { items, cursor })
    }

    async fn watch(&self, selector: &Selector, cursor: &str) -> Result<WatchStream<K>, TransportError> {
        counter!("kube_watch_requests_total", 1u64);
        let stream = self
            .api
            .watch(&watch_params(selector), cursor)
            .await
            .map_err(watch_error)?;
        let strip_managed_fields = self.strip_managed_fields;
        debug!(cursor = %cursor, "kube watch opened");
        Ok(stream
            .map(move |r| match r {
                Ok(ev) => decode(ev, strip_managed_fields),
                Err(e) => Err(watch_error(e)),
            })
            .boxed())
    }
}
