//! ServiceTrait core types: the custom resource, object addressing, errors and the
//! cluster store boundary the reconciler talks to.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

pub mod error;
pub mod resources;
pub mod store;

pub use error::{ReconcileError, StoreError, StoreOp};
pub use resources::{Condition, ServiceTrait, ServiceTraitSpec, ServiceTraitStatus, TypedReference, WorkloadReference};
pub use store::{expand_workload, ClusterStore};

/// Label binding a derived service to the trait instance (value: trait UID).
pub const OWNERSHIP_LABEL: &str = "workload.oam.crossplane.io";

/// API identity of composite (definition-backed) workloads.
pub const COMPOSITE_API_VERSION: &str = "core.oam.dev/v1alpha2";
/// API identity of directly manageable workloads.
pub const APPS_API_VERSION: &str = "apps/v1";

pub const KIND_STATEFUL_SET: &str = "StatefulSet";
pub const KIND_DEPLOYMENT: &str = "Deployment";
pub const KIND_WORKLOAD_DEFINITION: &str = "WorkloadDefinition";

/// Delay before a failed pass is retried.
pub const DEFAULT_REQUEUE_SECS: u64 = 30;

/// `apiVersion` + `kind` pair addressing a resource type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectType {
    pub api_version: String,
    pub kind: String,
}

impl ObjectType {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { api_version: api_version.into(), kind: kind.into() }
    }

    /// API group; empty for the core group (`v1`).
    pub fn group(&self) -> &str {
        match self.api_version.split_once('/') {
            Some((g, _)) => g,
            None => "",
        }
    }

    pub fn version(&self) -> &str {
        match self.api_version.split_once('/') {
            Some((_, v)) => v,
            None => &self.api_version,
        }
    }

    /// Stable key, e.g. `apps/v1/StatefulSet` or `v1/Service`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.api_version, self.kind)
    }

    /// Type of a dynamic object, if it carries apiVersion and kind.
    pub fn of(obj: &kube::core::DynamicObject) -> Option<Self> {
        obj.types.as_ref().map(|t| Self::new(t.api_version.clone(), t.kind.clone()))
    }
}

impl std::fmt::Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

/// Addresses one object: type, optional namespace (None for cluster scope) and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub object_type: ObjectType,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn namespaced(object_type: ObjectType, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { object_type, namespace: Some(namespace.into()), name: name.into() }
    }

    pub fn cluster(object_type: ObjectType, name: impl Into<String>) -> Self {
        Self { object_type, namespace: None, name: name.into() }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.object_type, ns, self.name),
            None => write!(f, "{} {}", self.object_type, self.name),
        }
    }
}

pub mod prelude {
    pub use super::{
        ClusterStore, ObjectKey, ObjectType, ReconcileError, ServiceTrait, StoreError, StoreOp, TypedReference,
        OWNERSHIP_LABEL,
    };
}
