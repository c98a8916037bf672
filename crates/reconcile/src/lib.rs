//! ServiceTrait reconciliation: one pass resolves the referenced workload, synthesizes a
//! ClusterIP service for its first stateful set, applies it, collects stale services and
//! reports status. Retries are the caller's business (see [`Outcome`]).

#![forbid(unsafe_code)]

use std::future::Future;
use std::time::{Duration, Instant};

use kube::ResourceExt;
use metrics::{counter, histogram};
use servicetrait_core::{ClusterStore, ReconcileError, ServiceTrait, StoreError, DEFAULT_REQUEUE_SECS};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod apply;
pub mod classify;
pub mod gc;
pub mod resolve;
pub mod status;
pub mod synthesize;

pub use apply::{apply_service, AppliedChild};
pub use classify::{classify, ClassifiedWorkload};
pub use gc::collect;
pub use resolve::{resolve, route, Resolved, WorkloadPath};
pub use status::{next_status, report};
pub use synthesize::{render_service, synthesize};

#[derive(Debug, Clone)]
pub struct Settings {
    /// Delay before a failed pass runs again.
    pub requeue_after: Duration,
    /// Apply field manager; `None` uses the trait's name.
    pub field_manager: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self { requeue_after: Duration::from_secs(DEFAULT_REQUEUE_SECS), field_manager: None }
    }
}

/// What the scheduler should do after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Converged; wait for the next change.
    Done,
    RequeueAfter(Duration),
}

/// Progress of a pass. `Ready` is left again on the next external change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Pending,
    Resolving,
    Synthesizing,
    Applying,
    Collecting,
    Ready,
    Error,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Pending => "pending",
            Stage::Resolving => "resolving",
            Stage::Synthesizing => "synthesizing",
            Stage::Applying => "applying",
            Stage::Collecting => "collecting",
            Stage::Ready => "ready",
            Stage::Error => "error",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Race a store call against cancellation.
pub(crate) async fn guarded<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    if cancel.is_cancelled() {
        return Err(StoreError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StoreError::Cancelled),
        res = fut => res,
    }
}

/// Run one reconcile pass for `object`.
///
/// Failures are written to the trait's status and turned into `RequeueAfter`. An `Err`
/// is returned only when the status itself could not be written, or when the pass was
/// cancelled (nothing is written then).
pub async fn reconcile<S: ClusterStore + ?Sized>(
    store: &S,
    object: &ServiceTrait,
    settings: &Settings,
    cancel: &CancellationToken,
) -> Result<Outcome, ReconcileError> {
    let t0 = Instant::now();
    let name = object.name_any();
    let namespace = object.namespace().unwrap_or_default();
    info!(trait_name = %name, namespace = %namespace, workload = ?object.spec.workload_ref, "reconcile service trait");

    let mut stage = Stage::Pending;
    let result = run_pass(store, object, settings, cancel, &mut stage).await;
    let outcome = match result {
        Ok(applied) => {
            status::report(store, object, Ok(&applied.reference), cancel).await?;
            stage = Stage::Ready;
            counter!("reconcile_total", 1, "outcome" => "ok");
            Outcome::Done
        }
        Err(ReconcileError::Cancelled) => {
            info!(trait_name = %name, stage = %stage, "pass cancelled; status left untouched");
            return Err(ReconcileError::Cancelled);
        }
        Err(e) => {
            if e.is_configuration() {
                warn!(trait_name = %name, stage = %stage, error = %e, "trait or workload misconfigured");
            } else {
                error!(trait_name = %name, stage = %stage, error = %e, "reconcile failed");
            }
            stage = Stage::Error;
            status::report(store, object, Err(&e), cancel).await?;
            counter!("reconcile_total", 1, "outcome" => e.category());
            Outcome::RequeueAfter(settings.requeue_after)
        }
    };
    histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    debug!(trait_name = %name, stage = %stage, ?outcome, "pass finished");
    Ok(outcome)
}

async fn run_pass<S: ClusterStore + ?Sized>(
    store: &S,
    object: &ServiceTrait,
    settings: &Settings,
    cancel: &CancellationToken,
    stage: &mut Stage,
) -> Result<AppliedChild, ReconcileError> {
    let uid = object.uid().ok_or(ReconcileError::MissingIdentity("uid"))?;
    let namespace = object.namespace().ok_or(ReconcileError::MissingIdentity("namespace"))?;

    *stage = Stage::Resolving;
    let resolved = resolve::resolve(store, &object.spec.workload_ref, &namespace, cancel).await?;
    if resolved.path == WorkloadPath::Direct {
        let classified = classify::classify(&resolved.workload)?;
        debug!(kind = classified.kind(), name = classified.name(), "classified workload");
    }

    *stage = Stage::Synthesizing;
    let service = synthesize::synthesize(&uid, &resolved.managed)?;

    *stage = Stage::Applying;
    let field_manager = settings.field_manager.clone().unwrap_or_else(|| object.name_any());
    let applied = apply::apply_service(store, &service, &field_manager, cancel).await?;

    *stage = Stage::Collecting;
    let recorded = object.status.as_ref().map(|s| s.resources.as_slice()).unwrap_or(&[]);
    gc::collect(store, recorded, &applied.reference.uid, &namespace, cancel).await?;
    Ok(applied)
}
