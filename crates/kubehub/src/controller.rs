//! Controller wiring: watch registrations, trigger mapping and the reconcile loop.

use std::fmt::Debug;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use futures::{stream::BoxStream, Stream, StreamExt};
use k8s_openapi::api::{apps::v1::StatefulSet, core::v1::Service};
use kube::{
    api::{Api, ListParams},
    runtime::{
        controller::{Action, Controller},
        reflector::ObjectRef,
        watcher::{self, watcher, Event},
    },
    Client, Resource, ResourceExt,
};
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use servicetrait_core::{ReconcileError, ServiceTrait, APPS_API_VERSION, KIND_STATEFUL_SET, OWNERSHIP_LABEL};
use servicetrait_reconcile::{Outcome, Settings};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::KubeStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchedKind {
    ServiceTrait,
    StatefulSet,
    Service,
}

/// Which updates of a watched kind trigger a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeFilter {
    Any,
    /// Only creates, deletes and `metadata.generation` changes; status-only updates are dropped.
    Generation,
}

#[derive(Debug, Clone, Copy)]
pub struct Registration {
    pub kind: WatchedKind,
    pub filter: ChangeFilter,
}

/// ServiceTrait is the primary kind; the rest only map back onto traits.
pub const REGISTRATIONS: [Registration; 3] = [
    Registration { kind: WatchedKind::ServiceTrait, filter: ChangeFilter::Any },
    Registration { kind: WatchedKind::StatefulSet, filter: ChangeFilter::Generation },
    Registration { kind: WatchedKind::Service, filter: ChangeFilter::Generation },
];

#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    /// Restrict watches to one namespace; `None` watches all.
    pub namespace: Option<String>,
    pub settings: Settings,
}

struct Context {
    store: KubeStore,
    settings: Settings,
    cancel: CancellationToken,
}

fn scoped<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Drop applied objects whose generation was already seen. Deletions always pass.
pub fn generation_changes<K, S>(events: S) -> impl Stream<Item = Result<K, watcher::Error>> + Send
where
    K: Resource + Send + 'static,
    S: Stream<Item = Result<Event<K>, watcher::Error>> + Send,
{
    let mut seen: FxHashMap<String, Option<i64>> = FxHashMap::default();
    events.flat_map(move |ev| {
        let out: Vec<Result<K, watcher::Error>> = match ev {
            Err(e) => vec![Err(e)],
            Ok(Event::Deleted(obj)) => {
                if let Some(uid) = obj.uid() {
                    seen.remove(&uid);
                }
                vec![Ok(obj)]
            }
            Ok(Event::Applied(obj)) => {
                let prev = obj.uid().and_then(|uid| seen.get(&uid).copied());
                changed(&mut seen, prev, obj).into_iter().map(Ok).collect()
            }
            Ok(Event::Restarted(list)) => {
                // objects missing from the relist are forgotten
                let mut relisted: FxHashMap<String, Option<i64>> = FxHashMap::default();
                let out: Vec<Result<K, watcher::Error>> = list
                    .into_iter()
                    .filter_map(|o| {
                        let prev = o.uid().and_then(|uid| seen.get(&uid).copied());
                        changed(&mut relisted, prev, o)
                    })
                    .map(Ok)
                    .collect();
                seen = relisted;
                out
            }
        };
        futures::stream::iter(out)
    })
}

/// Record the object's generation in `into`; pass it on unless it equals `prev`.
fn changed<K: Resource>(into: &mut FxHashMap<String, Option<i64>>, prev: Option<Option<i64>>, obj: K) -> Option<K> {
    let Some(uid) = obj.uid() else { return Some(obj) };
    let generation = obj.meta().generation;
    into.insert(uid, generation);
    match prev {
        Some(p) if p == generation => None,
        _ => Some(obj),
    }
}

/// Secondary trigger stream; secondaries are registered with [`ChangeFilter::Generation`].
fn trigger<K>(api: Api<K>) -> BoxStream<'static, Result<K, watcher::Error>>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
    K::DynamicType: Default,
{
    generation_changes(watcher(api, watcher::Config::default())).boxed()
}

/// Traits owning a service, by the UID in its ownership label.
pub fn traits_for_service(svc: &Service, traits: &[Arc<ServiceTrait>]) -> Vec<ObjectRef<ServiceTrait>> {
    let Some(owner) = svc.labels().get(OWNERSHIP_LABEL) else { return Vec::new() };
    traits
        .iter()
        .filter(|t| t.uid().as_deref() == Some(owner.as_str()))
        .map(|t| ObjectRef::from_obj(t.as_ref()))
        .collect()
}

/// Traits interested in a stateful set: those referencing it directly, and those whose
/// workload is one of its owners.
pub fn traits_for_statefulset(set: &StatefulSet, traits: &[Arc<ServiceTrait>]) -> Vec<ObjectRef<ServiceTrait>> {
    let ns = set.namespace();
    let name = set.name_any();
    let owners = set.owner_references();
    traits
        .iter()
        .filter(|t| t.namespace() == ns)
        .filter(|t| {
            let r = &t.spec.workload_ref;
            let direct = r.api_version == APPS_API_VERSION && r.kind == KIND_STATEFUL_SET && r.name == name;
            direct || owners.iter().any(|o| o.api_version == r.api_version && o.kind == r.kind && o.name == r.name)
        })
        .map(|t| ObjectRef::from_obj(t.as_ref()))
        .collect()
}

async fn reconcile(object: Arc<ServiceTrait>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let outcome = servicetrait_reconcile::reconcile(&ctx.store, &object, &ctx.settings, &ctx.cancel).await?;
    Ok(action_for(outcome))
}

fn action_for(outcome: Outcome) -> Action {
    match outcome {
        Outcome::Done => Action::await_change(),
        Outcome::RequeueAfter(d) => Action::requeue(d),
    }
}

fn error_policy(object: Arc<ServiceTrait>, err: &ReconcileError, ctx: Arc<Context>) -> Action {
    match err {
        ReconcileError::Cancelled => Action::await_change(),
        _ => {
            warn!(trait_name = %object.name_any(), error = %err, "pass failed without status; requeueing");
            Action::requeue(ctx.settings.requeue_after)
        }
    }
}

/// Run the controller until `cancel` fires. In-flight passes observe the same token.
pub async fn run(client: Client, cfg: RunConfig, cancel: CancellationToken) -> Result<()> {
    let ns = cfg.namespace.as_deref();
    let traits: Api<ServiceTrait> = scoped(client.clone(), ns);
    traits
        .list(&ListParams::default().limit(1))
        .await
        .context("listing ServiceTraits (is the CRD installed?)")?;

    let mut controller = Controller::new(traits, watcher::Config::default());
    let index = controller.store();
    for reg in REGISTRATIONS {
        debug!(kind = ?reg.kind, filter = ?reg.filter, "registering watch");
        controller = match reg.kind {
            WatchedKind::ServiceTrait => controller,
            WatchedKind::StatefulSet => {
                let index = index.clone();
                let api: Api<StatefulSet> = scoped(client.clone(), ns);
                controller.watches_stream(trigger(api), move |set| traits_for_statefulset(&set, &index.state()))
            }
            WatchedKind::Service => {
                let index = index.clone();
                let api: Api<Service> = scoped(client.clone(), ns);
                controller.watches_stream(trigger(api), move |svc| traits_for_service(&svc, &index.state()))
            }
        };
    }

    let ctx = Arc::new(Context { store: KubeStore::new(client), settings: cfg.settings, cancel: cancel.clone() });
    info!(namespace = ?cfg.namespace, "service trait controller started");
    let shutdown = cancel.clone();
    controller
        .graceful_shutdown_on(async move { shutdown.cancelled().await })
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, action)) => debug!(object = %obj, ?action, "reconciled"),
                Err(e) => debug!(error = %e, "controller event"),
            }
        })
        .await;
    info!("service trait controller stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use servicetrait_core::WorkloadReference;
    use servicetrait_core::resources::ServiceTraitSpec;
    use std::time::Duration;

    fn service_trait(name: &str, uid: &str, api_version: &str, kind: &str, workload: &str) -> Arc<ServiceTrait> {
        let mut t = ServiceTrait::new(
            name,
            ServiceTraitSpec {
                workload_ref: WorkloadReference { api_version: api_version.into(), kind: kind.into(), name: workload.into() },
            },
        );
        t.metadata.namespace = Some("ns".into());
        t.metadata.uid = Some(uid.into());
        Arc::new(t)
    }

    fn statefulset(v: serde_json::Value) -> StatefulSet {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn registrations_have_one_primary() {
        let primaries: Vec<_> = REGISTRATIONS.iter().filter(|r| r.kind == WatchedKind::ServiceTrait).collect();
        assert_eq!(primaries.len(), 1);
        assert_eq!(primaries[0].filter, ChangeFilter::Any);
        assert!(REGISTRATIONS.iter().filter(|r| r.kind != WatchedKind::ServiceTrait).all(|r| r.filter == ChangeFilter::Generation));
    }

    #[test]
    fn service_maps_to_owner_by_label() {
        let traits = vec![service_trait("a", "uid-a", "apps/v1", "StatefulSet", "db"), service_trait("b", "uid-b", "apps/v1", "StatefulSet", "web")];
        let mut svc: Service = serde_json::from_value(serde_json::json!({ "metadata": { "name": "web", "namespace": "ns" } })).unwrap();
        svc.labels_mut().insert(OWNERSHIP_LABEL.to_string(), "uid-b".to_string());
        let refs = traits_for_service(&svc, &traits);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "b");

        let unlabelled: Service = serde_json::from_value(serde_json::json!({ "metadata": { "name": "web", "namespace": "ns" } })).unwrap();
        assert!(traits_for_service(&unlabelled, &traits).is_empty());
    }

    #[test]
    fn statefulset_maps_by_reference_or_owner() {
        let traits = vec![
            service_trait("direct", "u1", "apps/v1", "StatefulSet", "db"),
            service_trait("composite", "u2", "core.oam.dev/v1alpha2", "ContainerizedWorkload", "app"),
            service_trait("other", "u3", "apps/v1", "StatefulSet", "cache"),
        ];
        let set = statefulset(serde_json::json!({
            "metadata": {
                "name": "db",
                "namespace": "ns",
                "ownerReferences": [ { "apiVersion": "core.oam.dev/v1alpha2", "kind": "ContainerizedWorkload", "name": "app", "uid": "w-1" } ]
            }
        }));
        let mut names: Vec<_> = traits_for_statefulset(&set, &traits).into_iter().map(|r| r.name).collect();
        names.sort();
        assert_eq!(names, vec!["composite".to_string(), "direct".to_string()]);

        let elsewhere = statefulset(serde_json::json!({ "metadata": { "name": "db", "namespace": "other" } }));
        assert!(traits_for_statefulset(&elsewhere, &traits).is_empty());
    }

    #[test]
    fn outcomes_map_to_actions() {
        assert_eq!(action_for(Outcome::Done), Action::await_change());
        assert_eq!(action_for(Outcome::RequeueAfter(Duration::from_secs(30))), Action::requeue(Duration::from_secs(30)));
    }

    #[test]
    fn generation_filter_drops_status_only_updates() {
        let set = |gen: i64| {
            statefulset(serde_json::json!({ "metadata": { "name": "db", "namespace": "ns", "uid": "s-1", "generation": gen } }))
        };
        let events: Vec<Result<Event<StatefulSet>, watcher::Error>> = vec![
            Ok(Event::Applied(set(1))),
            Ok(Event::Applied(set(1))),
            Ok(Event::Applied(set(2))),
            Ok(Event::Restarted(vec![set(2)])),
            Ok(Event::Deleted(set(2))),
        ];
        let passed: Vec<_> = futures::executor::block_on(generation_changes(futures::stream::iter(events)).collect::<Vec<_>>());
        let gens: Vec<_> = passed.into_iter().map(|r| r.unwrap().metadata.generation).collect();
        assert_eq!(gens, vec![Some(1), Some(2), Some(2)]);
    }

    #[test]
    fn restart_forgets_objects_missing_from_relist() {
        let set = |uid: &str, gen: i64| {
            statefulset(serde_json::json!({ "metadata": { "name": uid, "namespace": "ns", "uid": uid, "generation": gen } }))
        };
        let events: Vec<Result<Event<StatefulSet>, watcher::Error>> = vec![
            Ok(Event::Applied(set("a", 1))),
            Ok(Event::Applied(set("b", 1))),
            // "a" vanished while the watch was down
            Ok(Event::Restarted(vec![set("b", 1)])),
            Ok(Event::Applied(set("a", 1))),
            Ok(Event::Applied(set("b", 1))),
        ];
        let passed: Vec<_> = futures::executor::block_on(generation_changes(futures::stream::iter(events)).collect::<Vec<_>>());
        let names: Vec<_> = passed.into_iter().map(|r| r.unwrap().metadata.name.unwrap()).collect();
        assert_eq!(names, vec!["a", "b", "a"]);
    }
}
