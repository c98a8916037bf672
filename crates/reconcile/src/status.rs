//! Status reporting: conditions plus the recorded child references.

use servicetrait_core::{
    ClusterStore, Condition, ReconcileError, ServiceTrait, ServiceTraitStatus, StoreOp, TypedReference,
};
use tokio_util::sync::CancellationToken;

use crate::guarded;

/// Status after a pass. Success replaces the recorded references with the applied child;
/// failure keeps them so the next pass still knows what to collect.
pub fn next_status(prior: Option<&ServiceTraitStatus>, outcome: Result<&TypedReference, &ReconcileError>) -> ServiceTraitStatus {
    let mut status = prior.cloned().unwrap_or_default();
    match outcome {
        Ok(applied) => {
            status.resources = vec![applied.clone()];
            status.set_condition(Condition::reconcile_success());
        }
        Err(e) => status.set_condition(Condition::reconcile_error(e.condition_message())),
    }
    status
}

/// Persist the status computed from `outcome` onto the trait.
pub async fn report<S: ClusterStore + ?Sized>(
    store: &S,
    object: &ServiceTrait,
    outcome: Result<&TypedReference, &ReconcileError>,
    cancel: &CancellationToken,
) -> Result<ServiceTrait, ReconcileError> {
    let mut updated = object.clone();
    updated.status = Some(next_status(object.status.as_ref(), outcome));
    guarded(cancel, store.update_status(&updated)).await.map_err(|e| ReconcileError::store(StoreOp::Status, e))
}
