//! Convergence: field-owned apply of the synthesized service.

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::Resource;
use metrics::counter;
use servicetrait_core::{ClusterStore, ReconcileError, StoreError, StoreOp, TypedReference};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::guarded;

#[derive(Debug, Clone)]
pub struct AppliedChild {
    pub reference: TypedReference,
    pub service: Service,
}

/// Apply `service` as `field_manager`, forcing ownership of the fields it carries.
pub async fn apply_service<S: ClusterStore + ?Sized>(
    store: &S,
    service: &Service,
    field_manager: &str,
    cancel: &CancellationToken,
) -> Result<AppliedChild, ReconcileError> {
    let live = guarded(cancel, store.apply(service, field_manager, true)).await.map_err(|e| match e {
        StoreError::Conflict(msg) => ReconcileError::ApplyConflict(msg),
        e => ReconcileError::store(StoreOp::Apply, e),
    })?;
    let uid = live.metadata.uid.clone().ok_or_else(|| {
        ReconcileError::store(StoreOp::Apply, StoreError::Invalid("applied service has no metadata.uid".into()))
    })?;
    let reference = TypedReference {
        api_version: Service::API_VERSION.to_string(),
        kind: Service::KIND.to_string(),
        name: live.metadata.name.clone().unwrap_or_default(),
        uid,
    };
    counter!("service_apply_total", 1);
    info!(service = %reference.name, uid = %reference.uid, manager = field_manager, "applied service");
    Ok(AppliedChild { reference, service: live })
}

#[cfg(test)]
mod tests {
    use super::*;
    use servicetrait_store::MemStore;

    fn svc() -> Service {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": { "name": "web", "namespace": "ns" },
            "spec": { "type": "ClusterIP", "ports": [ { "name": "web", "port": 80, "targetPort": 80 } ] }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn repeated_apply_keeps_identity() {
        let store = MemStore::new();
        let cancel = CancellationToken::new();
        let a = apply_service(&store, &svc(), "expose", &cancel).await.unwrap();
        let b = apply_service(&store, &svc(), "expose", &cancel).await.unwrap();
        assert_eq!(a.reference, b.reference);
        assert_eq!(a.reference.kind, "Service");
        assert_eq!(a.reference.api_version, "v1");
        assert_eq!(a.service.metadata.resource_version, b.service.metadata.resource_version);
    }

    #[tokio::test]
    async fn store_conflict_maps_to_apply_conflict() {
        let store = MemStore::new();
        store.fail_next(StoreOp::Apply, StoreError::Conflict("spec.ports owned by helm".into()));
        let err = apply_service(&store, &svc(), "expose", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ReconcileError::ApplyConflict(_)), "{:?}", err);
        assert_eq!(err.condition_prefix(), "cannot apply the service");
    }
}
