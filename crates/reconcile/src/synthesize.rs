//! Child synthesis: build the ClusterIP service for the first eligible stateful set.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::core::DynamicObject;
use servicetrait_core::{ObjectType, ReconcileError, APPS_API_VERSION, KIND_STATEFUL_SET, OWNERSHIP_LABEL};
use tracing::{debug, info};

use crate::classify::{classify, ClassifiedWorkload};

pub const SERVICE_TYPE: &str = "ClusterIP";

/// Build the service for the first `apps/v1` StatefulSet in `managed` that has at least
/// one container. Later objects, eligible or not, are ignored.
pub fn synthesize(owner_uid: &str, managed: &[DynamicObject]) -> Result<Service, ReconcileError> {
    for obj in managed {
        let Some(set) = eligible(obj) else { continue };
        info!(
            statefulset = ?set.metadata.name,
            uid = ?set.metadata.uid,
            "selected statefulset to expose"
        );
        return Ok(render_service(owner_uid, &set));
    }
    info!(total = managed.len(), "cannot locate any statefulset");
    Err(ReconcileError::NoEligibleSource { candidates: managed.len() })
}

fn eligible(obj: &DynamicObject) -> Option<StatefulSet> {
    let ty = ObjectType::of(obj)?;
    if ty.api_version != APPS_API_VERSION || ty.kind != KIND_STATEFUL_SET {
        return None;
    }
    match classify(obj) {
        Ok(ClassifiedWorkload::Stateful(set)) if !containers_of(&set).is_empty() => Some(set),
        Ok(_) => {
            debug!(name = ?obj.metadata.name, "statefulset has no containers; skipping");
            None
        }
        Err(e) => {
            debug!(name = ?obj.metadata.name, error = %e, "skipping unclassifiable object");
            None
        }
    }
}

fn containers_of(set: &StatefulSet) -> &[k8s_openapi::api::core::v1::Container] {
    set.spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .map(|p| p.containers.as_slice())
        .unwrap_or(&[])
}

/// Service named after the set, selecting its pods, labelled with the owner UID, with at
/// most one port taken from the first container's first declared port.
pub fn render_service(owner_uid: &str, set: &StatefulSet) -> Service {
    let name = set.metadata.name.clone().unwrap_or_default();
    let selector = set.spec.as_ref().and_then(|s| s.selector.match_labels.clone());

    let first_port = containers_of(set)
        .first()
        .and_then(|c| c.ports.as_ref())
        .and_then(|ports| ports.first())
        .map(|p| p.container_port);
    let ports = first_port.map(|port| {
        vec![ServicePort {
            name: Some(name.clone()),
            port,
            target_port: Some(IntOrString::Int(port)),
            ..Default::default()
        }]
    });

    Service {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: set.metadata.namespace.clone(),
            labels: Some(BTreeMap::from([(OWNERSHIP_LABEL.to_string(), owner_uid.to_string())])),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector,
            ports,
            type_: Some(SERVICE_TYPE.to_string()),
            ..Default::default()
        }),
        status: None,
    }
}

/// Number of ports on a synthesized service.
pub fn port_count(svc: &Service) -> usize {
    svc.spec.as_ref().and_then(|s| s.ports.as_ref()).map(|p| p.len()).unwrap_or(0)
}
