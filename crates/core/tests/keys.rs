#![forbid(unsafe_code)]

use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::api::ObjectMeta;
use vigil_core::{KeyError, ObjectKey};

fn pod(ns: Option<&str>, name: Option<&str>, rv: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: name.map(|s| s.to_string()),
            namespace: ns.map(|s| s.to_string()),
            resource_version: Some(rv.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[test]
fn namespaced_key_is_ns_slash_name() {
    let key = ObjectKey::for_object(&pod(Some("ns"), Some("pod-a"), "1")).unwrap();
    assert_eq!(key.as_str(), "ns/pod-a");
    assert_eq!(key.split(), (Some("ns"), "pod-a"));
}

#[test]
fn cluster_scoped_key_is_bare_name() {
    let ns = Namespace {
        metadata: ObjectMeta { name: Some("prod".into()), ..Default::default() },
        ..Default::default()
    };
    let key = ObjectKey::for_object(&ns).unwrap();
    assert_eq!(key.as_str(), "prod");
    assert_eq!(key.namespace(), None);
    assert_eq!(key.name(), "prod");
    // empty namespace behaves like cluster scope
    assert_eq!(ObjectKey::new(Some(""), "prod"), key);
}

#[test]
fn key_is_stable_across_updates() {
    let a = ObjectKey::for_object(&pod(Some("ns"), Some("pod-a"), "1")).unwrap();
    let b = ObjectKey::for_object(&pod(Some("ns"), Some("pod-a"), "42")).unwrap();
    assert_eq!(a, b);
}

#[test]
fn missing_name_is_a_key_error() {
    assert_eq!(ObjectKey::for_object(&pod(Some("ns"), None, "1")), Err(KeyError::MissingName));
    assert_eq!(ObjectKey::for_object(&pod(Some("ns"), Some(""), "1")), Err(KeyError::MissingName));
}
