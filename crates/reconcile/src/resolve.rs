//! Workload resolution: turn a workload reference into the concrete objects it manages.

use kube::core::DynamicObject;
use servicetrait_core::{
    ClusterStore, ObjectKey, ReconcileError, StoreOp, WorkloadReference, APPS_API_VERSION, COMPOSITE_API_VERSION,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::guarded;

/// How a workload reference is resolved, decided by its API identity alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadPath {
    /// Definition-backed workload expanded through its WorkloadDefinition.
    Composite,
    /// Directly manageable resource; the workload is its own managed set.
    Direct,
}

pub fn route(api_version: &str) -> Result<WorkloadPath, ReconcileError> {
    match api_version {
        "" => Err(ReconcileError::MissingApiVersion),
        COMPOSITE_API_VERSION => Ok(WorkloadPath::Composite),
        APPS_API_VERSION => Ok(WorkloadPath::Direct),
        other => Err(ReconcileError::UnsupportedApiVersion(other.to_string())),
    }
}

#[derive(Debug, Clone)]
pub struct Resolved {
    pub path: WorkloadPath,
    pub workload: DynamicObject,
    /// Managed objects in resolution order. Exactly `[workload]` on the direct path.
    pub managed: Vec<DynamicObject>,
}

pub async fn resolve<S: ClusterStore + ?Sized>(
    store: &S,
    reference: &WorkloadReference,
    namespace: &str,
    cancel: &CancellationToken,
) -> Result<Resolved, ReconcileError> {
    let path = route(&reference.api_version)?;
    let key = ObjectKey::namespaced(reference.object_type(), namespace, reference.name.clone());
    let workload = guarded(cancel, store.get(&key)).await.map_err(|source| match source {
        servicetrait_core::StoreError::Cancelled => ReconcileError::Cancelled,
        source => ReconcileError::NotFound { what: format!("workload {}", key), source },
    })?;
    debug!(workload = %key, uid = ?workload.metadata.uid, "fetched workload");

    let managed = match path {
        WorkloadPath::Direct => {
            info!(api_version = %reference.api_version, kind = %reference.kind, "workload is a native resource");
            vec![workload.clone()]
        }
        WorkloadPath::Composite => {
            let objs = guarded(cancel, store.expand(&workload))
                .await
                .map_err(|e| ReconcileError::store(StoreOp::Expand, e))?;
            info!(workload = %key, managed = objs.len(), "expanded composite workload");
            objs
        }
    };
    Ok(Resolved { path, workload, managed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use servicetrait_core::StoreError;
    use servicetrait_store::MemStore;

    fn reference(api_version: &str) -> WorkloadReference {
        WorkloadReference { api_version: api_version.into(), kind: "StatefulSet".into(), name: "web".into() }
    }

    #[test]
    fn route_dispatches_on_api_version() {
        assert_eq!(route("apps/v1").unwrap(), WorkloadPath::Direct);
        assert_eq!(route("core.oam.dev/v1alpha2").unwrap(), WorkloadPath::Composite);
        assert!(matches!(route(""), Err(ReconcileError::MissingApiVersion)));
        match route("batch/v1") {
            Err(ReconcileError::UnsupportedApiVersion(v)) => assert_eq!(v, "batch/v1"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn direct_resource_resolves_to_itself() {
        let store = MemStore::new();
        store
            .insert(serde_json::json!({ "apiVersion": "apps/v1", "kind": "StatefulSet", "metadata": { "name": "web", "namespace": "ns" } }))
            .unwrap();
        let r = resolve(&store, &reference("apps/v1"), "ns", &CancellationToken::new()).await.unwrap();
        assert_eq!(r.path, WorkloadPath::Direct);
        assert_eq!(r.managed.len(), 1);
        assert_eq!(r.managed[0].metadata.name.as_deref(), Some("web"));
        assert_eq!(r.managed[0].metadata.uid, r.workload.metadata.uid);
    }

    #[tokio::test]
    async fn empty_api_version_fails_before_reading() {
        let store = MemStore::new();
        // a failing read would surface as NotFound; the identity check comes first
        store.fail_next(StoreOp::Get, StoreError::Backend("unreachable".into()));
        let err = resolve(&store, &reference(""), "ns", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ReconcileError::MissingApiVersion));
    }

    #[tokio::test]
    async fn fetch_errors_surface_as_not_found() {
        let store = MemStore::new();
        let err = resolve(&store, &reference("apps/v1"), "ns", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ReconcileError::NotFound { .. }), "{:?}", err);

        store.fail_next(StoreOp::Get, StoreError::Backend("timeout".into()));
        let err = resolve(&store, &reference("apps/v1"), "ns", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ReconcileError::NotFound { source: StoreError::Backend(_), .. }), "{:?}", err);
    }

    #[tokio::test]
    async fn cancelled_token_aborts_reads() {
        let store = MemStore::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = resolve(&store, &reference("apps/v1"), "ns", &cancel).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Cancelled));
    }
}
