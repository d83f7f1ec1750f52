//! Watch events in, deltas out.

use std::sync::Arc;

use metrics::counter;
use tracing::warn;
use vigil_core::{Delta, DeltaKind, KeyError, Object, ObjectKey, WatchEvent};
use vigil_store::Cache;

#[derive(Debug)]
pub enum Decoded<K> {
    Delta(Delta<K>),
    /// Cursor advance without an object.
    Bookmark(String),
}

/// Normalize one watch event against the cache content.
///
/// The cache is the authority on whether a key is new: an `Added` for a key
/// already cached becomes `Updated`, a `Modified` for an unknown key becomes
/// `Added`. Deletes pass through even for unknown keys.
pub fn decode<K: Object>(cache: &Cache<K>, ev: WatchEvent<K>) -> Result<Decoded<K>, KeyError> {
    let (obj, hint) = match ev {
        WatchEvent::Bookmark(cursor) => return Ok(Decoded::Bookmark(cursor)),
        WatchEvent::Added(o) => (o, DeltaKind::Added),
        WatchEvent::Modified(o) => (o, DeltaKind::Updated),
        WatchEvent::Deleted(o) => (o, DeltaKind::Deleted),
    };
    let key = ObjectKey::for_object(&obj)?;
    let kind = match hint {
        DeltaKind::Deleted => DeltaKind::Deleted,
        _ if cache.contains(&key) => DeltaKind::Updated,
        _ => DeltaKind::Added,
    };
    Ok(Decoded::Delta(Delta::new(kind, key, Arc::new(obj))))
}

/// Key every listed object, dropping the ones without an identity.
pub fn key_listing<K: Object>(items: Vec<K>) -> Vec<(ObjectKey, K)> {
    items
        .into_iter()
        .filter_map(|obj| match ObjectKey::for_object(&obj) {
            Ok(key) => Some((key, obj)),
            Err(e) => {
                record_key_error(&e);
                None
            }
        })
        .collect()
}

pub(crate) fn record_key_error(err: &KeyError) {
    counter!("reflector_decode_errors_total", 1u64);
    warn!(error = %err, "dropping object without a usable key");
}
