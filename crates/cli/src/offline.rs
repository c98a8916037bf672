//! Offline commands: run passes against manifests loaded into the in-RAM store.

use anyhow::{anyhow, Context, Result};
use k8s_openapi::api::core::v1::Service;
use kube::{core::DynamicObject, Resource, ResourceExt};
use serde::Serialize;
use servicetrait_core::{ObjectKey, ObjectType, ServiceTrait, TypedReference};
use servicetrait_reconcile::{classify, render_service, ClassifiedWorkload, Outcome, Settings};
use servicetrait_store::MemStore;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Serialize)]
pub struct TraitReport {
    pub namespace: String,
    pub name: String,
    pub outcome: String,
    pub synced: Option<String>,
    pub message: Option<String>,
    pub resources: Vec<TypedReference>,
}

#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub loaded: usize,
    pub traits: Vec<TraitReport>,
    pub services: Vec<Service>,
    pub deleted: Vec<TypedReference>,
}

fn trait_type() -> ObjectType {
    ObjectType::new(ServiceTrait::api_version(&()), ServiceTrait::kind(&()))
}

fn describe(outcome: &Result<Outcome, servicetrait_core::ReconcileError>) -> String {
    match outcome {
        Ok(Outcome::Done) => "done".to_string(),
        Ok(Outcome::RequeueAfter(d)) => format!("requeue after {}s", d.as_secs()),
        Err(e) => format!("failed: {}", e),
    }
}

/// Load `yaml` and run one pass for every ServiceTrait in it, in namespace/name order.
pub async fn simulate(yaml: &str, settings: &Settings) -> Result<SimulationReport> {
    let store = MemStore::new();
    let loaded = store.load_yaml(yaml).context("loading manifests")?;
    let cancel = CancellationToken::new();
    let ty = trait_type();

    let mut traits = Vec::new();
    for raw in store.objects_of(&ty) {
        let object: ServiceTrait = serde_json::from_value(raw).context("decoding ServiceTrait")?;
        let namespace = object.namespace().unwrap_or_default();
        let name = object.name_any();
        let outcome = servicetrait_reconcile::reconcile(&store, &object, settings, &cancel).await;
        info!(trait_name = %name, namespace = %namespace, outcome = %describe(&outcome), "simulated pass");

        let key = ObjectKey::namespaced(ty.clone(), namespace.clone(), name.clone());
        let after: ServiceTrait = store.get_as(&key).unwrap_or(object);
        let status = after.status.unwrap_or_default();
        let synced = status.synced().cloned();
        traits.push(TraitReport {
            namespace,
            name,
            outcome: describe(&outcome),
            synced: synced.as_ref().map(|c| c.status.clone()),
            message: synced.map(|c| c.message).filter(|m| !m.is_empty()),
            resources: status.resources,
        });
    }

    let services = store
        .objects_of(&ObjectType::new("v1", "Service"))
        .into_iter()
        .map(serde_json::from_value)
        .collect::<Result<Vec<Service>, _>>()
        .context("decoding services")?;
    Ok(SimulationReport { loaded, traits, services, deleted: store.deleted() })
}

/// Render the service a trait with `trait_uid` would own for a single StatefulSet manifest.
pub fn render(yaml: &str, trait_uid: &str) -> Result<Service> {
    let obj: DynamicObject = serde_yaml::from_str(yaml).context("parsing workload manifest")?;
    match classify(&obj)? {
        ClassifiedWorkload::Stateful(set) => Ok(render_service(trait_uid, &set)),
        other => Err(anyhow!("{} {} cannot be exposed; only StatefulSets are", other.kind(), other.name())),
    }
}
