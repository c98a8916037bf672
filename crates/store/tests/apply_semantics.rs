#![forbid(unsafe_code)]

use k8s_openapi::api::core::v1::Service;
use servicetrait_core::{ClusterStore, ObjectKey, ObjectType, StoreError, TypedReference};
use servicetrait_store::MemStore;

fn svc_key() -> ObjectKey {
    ObjectKey::namespaced(ObjectType::new("v1", "Service"), "ns", "web")
}

fn svc(port: Option<i32>) -> Service {
    let mut raw = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": { "name": "web", "namespace": "ns", "labels": { "workload.oam.crossplane.io": "t-1" } },
        "spec": { "selector": { "app": "web" }, "type": "ClusterIP" }
    });
    if let Some(p) = port {
        raw["spec"]["ports"] = serde_json::json!([{ "name": "web", "port": p, "targetPort": p }]);
    }
    serde_json::from_value(raw).unwrap()
}

fn rv(s: &Service) -> String {
    s.metadata.resource_version.clone().unwrap_or_default()
}

#[tokio::test]
async fn apply_twice_is_idempotent() {
    let store = MemStore::new();
    let first = store.apply(&svc(Some(8080)), "expose", true).await.unwrap();
    let second = store.apply(&svc(Some(8080)), "expose", true).await.unwrap();
    assert!(first.metadata.uid.is_some());
    assert_eq!(first.metadata.uid, second.metadata.uid);
    assert_eq!(rv(&first), rv(&second), "no-op apply must not bump resourceVersion");
    let raw = store.get_raw(&svc_key()).unwrap();
    assert_eq!(raw.pointer("/metadata/resourceVersion").and_then(|v| v.as_str()), Some(rv(&second).as_str()));
}

#[tokio::test]
async fn fields_of_other_managers_are_left_untouched() {
    let store = MemStore::new();
    store.apply(&svc(Some(8080)), "expose", true).await.unwrap();
    // another actor adds an annotation and a session affinity
    let other = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": { "name": "web", "namespace": "ns", "annotations": { "team": "payments" } },
        "spec": { "sessionAffinity": "ClientIP" }
    });
    store.apply_raw(&other, "kubectl", false).unwrap();

    let live = store.apply(&svc(Some(9090)), "expose", true).await.unwrap();
    let raw = serde_json::to_value(&live).unwrap();
    assert_eq!(raw.pointer("/metadata/annotations/team").and_then(|v| v.as_str()), Some("payments"));
    assert_eq!(raw.pointer("/spec/sessionAffinity").and_then(|v| v.as_str()), Some("ClientIP"));
    assert_eq!(raw.pointer("/spec/ports/0/port").and_then(|v| v.as_i64()), Some(9090));
    let managers = store.managers(&svc_key());
    assert_eq!(managers.get("spec.sessionAffinity").map(String::as_str), Some("kubectl"));
    assert_eq!(managers.get("spec.ports").map(String::as_str), Some("expose"));
}

#[tokio::test]
async fn conflicting_write_without_force_fails_and_force_takes_ownership() {
    let store = MemStore::new();
    store.apply(&svc(Some(8080)), "expose", true).await.unwrap();
    let err = store.apply(&svc(Some(9090)), "someone-else", false).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(ref m) if m.contains("spec.ports")), "{:?}", err);

    store.apply(&svc(Some(9090)), "someone-else", true).await.unwrap();
    assert_eq!(store.managers(&svc_key()).get("spec.ports").map(String::as_str), Some("someone-else"));
}

#[tokio::test]
async fn fields_dropped_from_payload_are_released() {
    let store = MemStore::new();
    store.apply(&svc(Some(8080)), "expose", true).await.unwrap();
    let live = store.apply(&svc(None), "expose", true).await.unwrap();
    let ports = live.spec.as_ref().and_then(|s| s.ports.as_ref()).map(|p| p.len()).unwrap_or(0);
    assert_eq!(ports, 0);
    assert!(!store.managers(&svc_key()).contains_key("spec.ports"));
}

#[tokio::test]
async fn delete_requires_matching_uid() {
    let store = MemStore::new();
    let live = store.apply(&svc(Some(8080)), "expose", true).await.unwrap();
    let uid = live.metadata.uid.clone().unwrap();

    let stale = TypedReference { api_version: "v1".into(), kind: "Service".into(), name: "web".into(), uid: "old".into() };
    assert!(matches!(store.delete(&stale, "ns").await, Err(StoreError::Conflict(_))));
    assert!(store.get_raw(&svc_key()).is_some());

    let current = TypedReference { uid, ..stale };
    store.delete(&current, "ns").await.unwrap();
    assert!(store.get_raw(&svc_key()).is_none());
    assert!(store.delete(&current, "ns").await.unwrap_err().is_not_found());
    assert_eq!(store.deleted(), vec![current]);
}
