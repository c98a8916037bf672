//! Error taxonomy shared by the stores and the reconciler.

use std::fmt;

/// Failures surfaced by a [`crate::ClusterStore`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    /// Optimistic-concurrency or field-ownership conflict.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error("cancelled")]
    Cancelled,
    #[error("store: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Store operation a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Get,
    Expand,
    Apply,
    Delete,
    Status,
}

impl StoreOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreOp::Get => "get",
            StoreOp::Expand => "expand",
            StoreOp::Apply => "apply",
            StoreOp::Delete => "delete",
            StoreOp::Status => "status",
        }
    }
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reconcile error strings, written as the prefix of the status condition message.
pub const ERR_LOCATE_WORKLOAD: &str = "cannot find workload";
pub const ERR_LOCATE_RESOURCES: &str = "cannot find resources";
pub const ERR_UNSUPPORTED_KIND: &str = "unsupported workload kind";
pub const ERR_LOCATE_STATEFULSET: &str = "cannot find statefulset";
pub const ERR_APPLY_SERVICE: &str = "cannot apply the service";
pub const ERR_GC_SERVICE: &str = "cannot clean up stale services";
pub const ERR_UPDATE_STATUS: &str = "cannot apply status";
pub const ERR_INVALID_TRAIT: &str = "invalid trait";

/// Everything that can stop a reconcile pass.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("trait is missing metadata.{0}")]
    MissingIdentity(&'static str),
    #[error("workload reference has no apiVersion")]
    MissingApiVersion,
    #[error("unsupported workload apiVersion {0:?}")]
    UnsupportedApiVersion(String),
    #[error("{what} not found: {source}")]
    NotFound {
        what: String,
        #[source]
        source: StoreError,
    },
    #[error("unsupported kind {kind:?}: {reason}")]
    UnsupportedKind { kind: String, reason: String },
    #[error("no statefulset with containers among {candidates} managed objects")]
    NoEligibleSource { candidates: usize },
    #[error("apply conflict: {0}")]
    ApplyConflict(String),
    #[error("{op} failed: {source}")]
    Store {
        op: StoreOp,
        #[source]
        source: StoreError,
    },
    #[error("reconcile cancelled")]
    Cancelled,
}

impl ReconcileError {
    /// Wrap a store failure, keeping cancellation distinguishable.
    pub fn store(op: StoreOp, source: StoreError) -> Self {
        match source {
            StoreError::Cancelled => ReconcileError::Cancelled,
            source => ReconcileError::Store { op, source },
        }
    }

    /// Fixed per-category prefix used in the status condition.
    pub fn condition_prefix(&self) -> &'static str {
        match self {
            ReconcileError::MissingIdentity(_) => ERR_INVALID_TRAIT,
            ReconcileError::MissingApiVersion
            | ReconcileError::UnsupportedApiVersion(_)
            | ReconcileError::NotFound { .. } => ERR_LOCATE_WORKLOAD,
            ReconcileError::UnsupportedKind { .. } => ERR_UNSUPPORTED_KIND,
            ReconcileError::NoEligibleSource { .. } => ERR_LOCATE_STATEFULSET,
            ReconcileError::ApplyConflict(_) => ERR_APPLY_SERVICE,
            ReconcileError::Store { op, .. } => match op {
                StoreOp::Get | StoreOp::Expand => ERR_LOCATE_RESOURCES,
                StoreOp::Apply => ERR_APPLY_SERVICE,
                StoreOp::Delete => ERR_GC_SERVICE,
                StoreOp::Status => ERR_UPDATE_STATUS,
            },
            ReconcileError::Cancelled => "cancelled",
        }
    }

    /// Human-readable condition message: `<prefix>: <cause>`.
    pub fn condition_message(&self) -> String {
        format!("{}: {}", self.condition_prefix(), self)
    }

    /// Errors that recur until the trait or workload is edited.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ReconcileError::UnsupportedApiVersion(_) | ReconcileError::UnsupportedKind { .. } | ReconcileError::MissingApiVersion
        )
    }

    /// Short label for metrics.
    pub fn category(&self) -> &'static str {
        match self {
            ReconcileError::MissingIdentity(_) => "missing_identity",
            ReconcileError::MissingApiVersion => "missing_api_version",
            ReconcileError::UnsupportedApiVersion(_) => "unsupported_api_version",
            ReconcileError::NotFound { .. } => "not_found",
            ReconcileError::UnsupportedKind { .. } => "unsupported_kind",
            ReconcileError::NoEligibleSource { .. } => "no_eligible_source",
            ReconcileError::ApplyConflict(_) => "apply_conflict",
            ReconcileError::Store { .. } => "store",
            ReconcileError::Cancelled => "cancelled",
        }
    }
}
