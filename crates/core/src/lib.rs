//! Vigil core types: object keys, deltas and the upstream list/watch contract.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use kube::Resource;
use serde::{Deserialize, Serialize};

/// Objects a controller can mirror: any kube resource type fixed at compile time.
pub trait Object: Resource + Clone + Send + Sync + 'static {}

impl<K> Object for K where K: Resource + Clone + Send + Sync + 'static {}

/// Stable identity of an object: `namespace/name`, or `name` when cluster-scoped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        match namespace {
            Some(ns) if !ns.is_empty() => Self(format!("{}/{}", ns, name)),
            _ => Self(name.to_string()),
        }
    }

    /// Derive the key from object metadata. Fails when the object carries no name.
    pub fn for_object<K: Resource>(obj: &K) -> Result<Self, KeyError> {
        let meta = obj.meta();
        let name = meta
            .name
            .as_deref()
            .filter(|n| !n.is_empty())
            .ok_or(KeyError::MissingName)?;
        Ok(Self::new(meta.namespace.as_deref(), name))
    }

    pub fn as_str(&self) -> &str { &self.0 }

    /// Split back into `(namespace, name)`.
    pub fn split(&self) -> (Option<&str>, &str) {
        match self.0.split_once('/') {
            Some((ns, name)) => (Some(ns), name),
            None => (None, self.0.as_str()),
        }
    }

    pub fn namespace(&self) -> Option<&str> { self.split().0 }
    pub fn name(&self) -> &str { self.split().1 }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for ObjectKey {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

impl From<String> for ObjectKey {
    fn from(s: String) -> Self { Self(s) }
}

/// Resource version of an object, if the server assigned one.
pub fn resource_version<K: Resource>(obj: &K) -> Option<&str> {
    obj.meta().resource_version.as_deref()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("object has no metadata.name")]
    MissingName,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DeltaKind {
    Added,
    Updated,
    Deleted,
    /// Periodic resync of an unchanged cached object.
    Synced,
}

impl DeltaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeltaKind::Added => "added",
            DeltaKind::Updated => "updated",
            DeltaKind::Deleted => "deleted",
            DeltaKind::Synced => "synced",
        }
    }
}

/// A normalized single-object change. For `Deleted` the snapshot is the last known state.
#[derive(Debug)]
pub struct Delta<K> {
    pub kind: DeltaKind,
    pub key: ObjectKey,
    pub object: Arc<K>,
}

impl<K> Delta<K> {
    pub fn new(kind: DeltaKind, key: ObjectKey, object: Arc<K>) -> Self {
        Self { kind, key, object }
    }
}

impl<K> Clone for Delta<K> {
    fn clone(&self) -> Self {
        Self { kind: self.kind, key: self.key.clone(), object: Arc::clone(&self.object) }
    }
}

/// Opaque filter forwarded to the remote store on list and watch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Selector {
    pub labels: Option<String>,
    pub fields: Option<String>,
}

impl Selector {
    pub fn labels(expr: impl Into<String>) -> Self {
        Self { labels: Some(expr.into()), fields: None }
    }

    pub fn with_fields(mut self, expr: impl Into<String>) -> Self {
        self.fields = Some(expr.into());
        self
    }
}

/// Result of a full listing: every matching object plus the cursor to watch from.
#[derive(Debug, Clone)]
pub struct ListPage<K> {
    pub items: Vec<K>,
    pub cursor: String,
}

/// Raw notification from the remote store's watch stream.
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    /// Progress marker carrying a newer cursor and no object.
    Bookmark(String),
}

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failures of the list/watch transport. All of them are recovered by relisting.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("list failed: {0}")]
    List(#[source] BoxError),
    #[error("watch failed: {0}")]
    Watch(#[source] BoxError),
    #[error("watch cursor expired: {0}")]
    Expired(String),
}

impl TransportError {
    pub fn is_expired(&self) -> bool { matches!(self, TransportError::Expired(_)) }
}

pub type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>, TransportError>>;

/// Upstream contract: a snapshot listing plus a resumable change stream.
#[async_trait::async_trait]
pub trait ListerWatcher<K>: Send + Sync {
    async fn list(&self, selector: &Selector) -> Result<ListPage<K>, TransportError>;

    /// Open a watch starting after `cursor`. The stream may end or fail at any time.
    async fn watch(&self, selector: &Selector, cursor: &str) -> Result<WatchStream<K>, TransportError>;
}

/// What the reconciler wants done with the key after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Converged; clear retry state.
    Success,
    /// Not ready yet; retry after a short fixed delay without backoff penalty.
    Retry,
    /// Retry after exactly this long.
    RetryAfter(Duration),
}

pub mod prelude {
    pub use super::{
        Delta, DeltaKind, KeyError, ListPage, ListerWatcher, Object, ObjectKey, Outcome, Selector,
        TransportError, WatchEvent, WatchStream,
    };
}
