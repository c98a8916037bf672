//! Garbage collection of services this trait recorded but no longer produces.

use metrics::counter;
use servicetrait_core::{ClusterStore, ReconcileError, StoreError, StoreOp, TypedReference};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::guarded;

/// Delete every recorded reference whose UID is not `keep_uid`. Objects already gone, or
/// whose name now belongs to another instance, count as collected. Returns the references
/// a delete was issued for.
pub async fn collect<S: ClusterStore + ?Sized>(
    store: &S,
    recorded: &[TypedReference],
    keep_uid: &str,
    namespace: &str,
    cancel: &CancellationToken,
) -> Result<Vec<TypedReference>, ReconcileError> {
    let mut issued = Vec::new();
    for stale in recorded.iter().filter(|r| r.uid != keep_uid) {
        issued.push(stale.clone());
        match guarded(cancel, store.delete(stale, namespace)).await {
            Ok(()) => {
                counter!("service_gc_deleted_total", 1);
                info!(reference = %stale, "deleted stale service");
            }
            Err(StoreError::NotFound(_)) | Err(StoreError::Conflict(_)) => {
                debug!(reference = %stale, "stale service already gone");
            }
            Err(e) => return Err(ReconcileError::store(StoreOp::Delete, e)),
        }
    }
    Ok(issued)
}

#[cfg(test)]
mod tests {
    use super::*;
    use servicetrait_store::MemStore;

    fn reference(uid: &str) -> TypedReference {
        TypedReference { api_version: "v1".into(), kind: "Service".into(), name: "web".into(), uid: uid.into() }
    }

    #[tokio::test]
    async fn current_identity_is_never_collected() {
        let store = MemStore::new();
        let issued = collect(&store, &[reference("2")], "2", "ns", &CancellationToken::new()).await.unwrap();
        assert!(issued.is_empty());
        assert!(store.deleted().is_empty());
    }

    #[tokio::test]
    async fn missing_stale_objects_are_already_satisfied() {
        let store = MemStore::new();
        let issued = collect(&store, &[reference("1"), reference("2")], "2", "ns", &CancellationToken::new()).await.unwrap();
        assert_eq!(issued, vec![reference("1")]);
    }

    #[tokio::test]
    async fn delete_failures_are_reported() {
        let store = MemStore::new();
        store.fail_next(StoreOp::Delete, StoreError::Backend("forbidden".into()));
        let err = collect(&store, &[reference("1")], "2", "ns", &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.condition_prefix(), "cannot clean up stale services");
    }
}
