//! ServiceTrait custom resource and the references it records in status.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::ObjectType;

pub const CONDITION_SYNCED: &str = "Synced";
pub const REASON_SUCCESS: &str = "ReconcileSuccess";
pub const REASON_ERROR: &str = "ReconcileError";

/// ServiceTrait exposes the first stateful set of a workload through a ClusterIP service.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "core.oam.dev",
    version = "v1alpha2",
    kind = "ServiceTrait",
    plural = "servicetraits",
    namespaced,
    status = "ServiceTraitStatus",
    printcolumn = r#"{"name":"Workload", "type":"string", "jsonPath":".spec.workloadRef.name"}"#,
    printcolumn = r#"{"name":"Synced", "type":"string", "jsonPath":".status.conditions[?(@.type=='Synced')].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTraitSpec {
    /// Workload this trait attaches to. The namespace is the trait's own.
    pub workload_ref: WorkloadReference,
}

/// Pointer to the workload a trait is attached to.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadReference {
    #[serde(default)]
    pub api_version: String,
    pub kind: String,
    pub name: String,
}

impl WorkloadReference {
    pub fn object_type(&self) -> ObjectType {
        ObjectType::new(self.api_version.clone(), self.kind.clone())
    }
}

/// Identity of an object this trait applied.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TypedReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
}

impl TypedReference {
    pub fn object_type(&self) -> ObjectType {
        ObjectType::new(self.api_version.clone(), self.kind.clone())
    }
}

impl std::fmt::Display for TypedReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} {} (uid {})", self.api_version, self.kind, self.name, self.uid)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    /// `True`, `False` or `Unknown`.
    pub status: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl Condition {
    pub fn reconcile_success() -> Self {
        Self {
            type_: CONDITION_SYNCED.to_string(),
            status: "True".to_string(),
            reason: REASON_SUCCESS.to_string(),
            message: String::new(),
            last_transition_time: Some(now_rfc3339()),
        }
    }

    pub fn reconcile_error(message: impl Into<String>) -> Self {
        Self {
            type_: CONDITION_SYNCED.to_string(),
            status: "False".to_string(),
            reason: REASON_ERROR.to_string(),
            message: message.into(),
            last_transition_time: Some(now_rfc3339()),
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == "True"
    }

    /// Same condition apart from the transition timestamp.
    pub fn equivalent(&self, other: &Condition) -> bool {
        self.type_ == other.type_ && self.status == other.status && self.reason == other.reason && self.message == other.message
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTraitStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Children currently owned by the trait.
    #[serde(default)]
    pub resources: Vec<TypedReference>,
}

impl ServiceTraitStatus {
    /// Insert or replace the condition of the same type. An equivalent condition keeps
    /// its original transition time.
    pub fn set_condition(&mut self, cond: Condition) {
        match self.conditions.iter_mut().find(|c| c.type_ == cond.type_) {
            Some(existing) if existing.equivalent(&cond) => {}
            Some(existing) => *existing = cond,
            None => self.conditions.push(cond),
        }
    }

    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    pub fn synced(&self) -> Option<&Condition> {
        self.condition(CONDITION_SYNCED)
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
