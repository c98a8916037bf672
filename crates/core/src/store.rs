//! Cluster store boundary: the reads and writes a reconcile pass performs.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Service;
use kube::core::DynamicObject;
use serde::Deserialize;

use crate::{
    ObjectKey, ObjectType, ServiceTrait, StoreError, TypedReference, COMPOSITE_API_VERSION, KIND_WORKLOAD_DEFINITION,
};

/// Object store the reconciler reads workloads from and writes services and status to.
///
/// Implementations must not retry internally; failures surface to the caller.
#[async_trait::async_trait]
pub trait ClusterStore: Send + Sync {
    /// Fetch one object in its generic representation.
    async fn get(&self, key: &ObjectKey) -> Result<DynamicObject, StoreError>;

    /// List objects of a type in a namespace whose labels contain `selector`.
    async fn list(
        &self,
        object_type: &ObjectType,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>, StoreError>;

    /// Plural resource name for a type (e.g. `statefulsets`).
    async fn plural(&self, object_type: &ObjectType) -> Result<String, StoreError>;

    /// Field-owned apply: `field_manager` claims exactly the fields present in `service`.
    /// Without `force`, fields owned by another manager fail with [`StoreError::Conflict`].
    async fn apply(&self, service: &Service, field_manager: &str, force: bool) -> Result<Service, StoreError>;

    /// Delete the referenced object, only if its UID still matches.
    async fn delete(&self, reference: &TypedReference, namespace: &str) -> Result<(), StoreError>;

    /// Persist the trait's status; stale resourceVersions fail with [`StoreError::Conflict`].
    async fn update_status(&self, object: &ServiceTrait) -> Result<ServiceTrait, StoreError>;

    /// Concrete objects managed by a composite workload.
    async fn expand(&self, workload: &DynamicObject) -> Result<Vec<DynamicObject>, StoreError> {
        expand_workload(self, workload).await
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChildResourceKind {
    api_version: String,
    kind: String,
    #[serde(default)]
    selector: BTreeMap<String, String>,
}

/// Name of the WorkloadDefinition describing a workload type: `<plural>.<group>`.
pub fn definition_name(plural: &str, group: &str) -> String {
    if group.is_empty() {
        plural.to_string()
    } else {
        format!("{}.{}", plural, group)
    }
}

/// Expand a composite workload through its WorkloadDefinition: list every declared child
/// resource kind in the workload's namespace and keep the objects it owns (by UID).
pub async fn expand_workload<S: ClusterStore + ?Sized>(
    store: &S,
    workload: &DynamicObject,
) -> Result<Vec<DynamicObject>, StoreError> {
    let object_type = ObjectType::of(workload).ok_or_else(|| StoreError::Invalid("workload without apiVersion/kind".into()))?;
    let uid = workload.metadata.uid.as_deref().ok_or_else(|| StoreError::Invalid("workload without metadata.uid".into()))?;
    let namespace = workload.metadata.namespace.as_deref().unwrap_or("default");

    let plural = store.plural(&object_type).await?;
    let def_key = ObjectKey::cluster(
        ObjectType::new(COMPOSITE_API_VERSION, KIND_WORKLOAD_DEFINITION),
        definition_name(&plural, object_type.group()),
    );
    let definition = store.get(&def_key).await?;
    let kinds: Vec<ChildResourceKind> = match definition.data.get("spec").and_then(|s| s.get("childResourceKinds")) {
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| StoreError::Invalid(format!("{}: childResourceKinds: {}", def_key, e)))?,
        None => Vec::new(),
    };

    let mut out = Vec::new();
    for child in kinds {
        let child_type = ObjectType::new(child.api_version, child.kind);
        let items = store.list(&child_type, namespace, &child.selector).await?;
        out.extend(items.into_iter().filter(|o| owned_by(o, uid)));
    }
    Ok(out)
}

fn owned_by(obj: &DynamicObject, uid: &str) -> bool {
    obj.metadata
        .owner_references
        .as_ref()
        .map(|refs| refs.iter().any(|r| r.uid == uid))
        .unwrap_or(false)
}
