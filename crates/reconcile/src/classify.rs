//! Kind classification: re-shape a generic object into one of the typed workload views.

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use kube::core::DynamicObject;
use serde::de::DeserializeOwned;
use servicetrait_core::{ReconcileError, KIND_DEPLOYMENT, KIND_STATEFUL_SET};
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub enum ClassifiedWorkload {
    Stateful(StatefulSet),
    Scalable(Deployment),
}

impl ClassifiedWorkload {
    pub fn kind(&self) -> &'static str {
        match self {
            ClassifiedWorkload::Stateful(_) => KIND_STATEFUL_SET,
            ClassifiedWorkload::Scalable(_) => KIND_DEPLOYMENT,
        }
    }

    pub fn name(&self) -> &str {
        let meta = match self {
            ClassifiedWorkload::Stateful(s) => &s.metadata,
            ClassifiedWorkload::Scalable(d) => &d.metadata,
        };
        meta.name.as_deref().unwrap_or_default()
    }
}

/// Classify by `kind`. A recognized kind whose body does not fit the typed view is
/// rejected as `UnsupportedKind` rather than continuing with an empty value.
pub fn classify(obj: &DynamicObject) -> Result<ClassifiedWorkload, ReconcileError> {
    let kind = obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or_default();
    match kind {
        KIND_STATEFUL_SET => reshape::<StatefulSet>(obj, kind).map(ClassifiedWorkload::Stateful),
        KIND_DEPLOYMENT => reshape::<Deployment>(obj, kind).map(ClassifiedWorkload::Scalable),
        other => Err(ReconcileError::UnsupportedKind {
            kind: other.to_string(),
            reason: "not a StatefulSet or Deployment".to_string(),
        }),
    }
}

fn reshape<K: DeserializeOwned>(obj: &DynamicObject, kind: &str) -> Result<K, ReconcileError> {
    let converted = serde_json::to_value(obj).and_then(serde_json::from_value::<K>);
    converted.map_err(|e| {
        warn!(kind, name = ?obj.metadata.name, error = %e, "failed to convert object to typed workload");
        ReconcileError::UnsupportedKind { kind: kind.to_string(), reason: format!("cannot convert: {}", e) }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dynamic(v: serde_json::Value) -> DynamicObject {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn recognized_kinds_classify() {
        let ss = dynamic(serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "StatefulSet",
            "metadata": { "name": "db" },
            "spec": {
                "serviceName": "db",
                "selector": { "matchLabels": { "app": "db" } },
                "template": { "spec": { "containers": [ { "name": "pg", "image": "postgres" } ] } }
            }
        }));
        let c = classify(&ss).unwrap();
        assert_eq!(c.kind(), "StatefulSet");
        assert_eq!(c.name(), "db");

        let deploy = dynamic(serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "api" },
            "spec": { "selector": {}, "template": {} }
        }));
        assert!(matches!(classify(&deploy).unwrap(), ClassifiedWorkload::Scalable(_)));
    }

    #[test]
    fn other_kinds_are_unsupported() {
        for kind in ["DaemonSet", "Service", ""] {
            let obj = dynamic(serde_json::json!({ "apiVersion": "apps/v1", "kind": kind, "metadata": { "name": "x" } }));
            match classify(&obj) {
                Err(ReconcileError::UnsupportedKind { kind: k, .. }) => assert_eq!(k, kind),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn malformed_body_is_rejected_not_zeroed() {
        let obj = dynamic(serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "StatefulSet",
            "metadata": { "name": "db" },
            "spec": { "replicas": "three" }
        }));
        match classify(&obj) {
            Err(ReconcileError::UnsupportedKind { reason, .. }) => assert!(reason.starts_with("cannot convert"), "{}", reason),
            other => panic!("unexpected {:?}", other),
        }
    }
}
