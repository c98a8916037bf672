//! ServiceTrait kubehub: the Kubernetes-backed cluster store and controller wiring

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::Result;
use k8s_openapi::api::core::v1::Service;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, Preconditions},
    core::{ApiResource, DynamicObject, GroupVersionKind, TypeMeta},
    discovery::{Discovery, Scope},
    Client, ResourceExt,
};
use metrics::counter;
use rustc_hash::FxHashMap;
use servicetrait_core::{ClusterStore, ObjectKey, ObjectType, ServiceTrait, StoreError, StoreOp, TypedReference};
use tracing::{debug, info};

pub mod controller;

pub use controller::{run, RunConfig, REGISTRATIONS};

/// Build a client from the ambient kubeconfig or in-cluster environment.
pub async fn get_kube_client() -> Result<Client> {
    let client = Client::try_default().await?;
    Ok(client)
}

/// Map a kube error onto the store taxonomy and count it under `op`.
pub fn store_error(op: StoreOp, err: kube::Error) -> StoreError {
    let mapped = match err {
        kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound(resp.message),
        kube::Error::Api(resp) if resp.code == 409 => StoreError::Conflict(resp.message),
        kube::Error::Api(resp) if resp.code == 422 || resp.code == 400 => StoreError::Invalid(resp.message),
        other => StoreError::Backend(other.to_string()),
    };
    counter!("store_errors_total", 1, "op" => op.as_str());
    mapped
}

fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
}

/// [`ClusterStore`] over the API server. Resource discovery results are cached per
/// `apiVersion/kind`; nothing is retried here.
pub struct KubeStore {
    client: Client,
    resources: Mutex<FxHashMap<String, (ApiResource, bool)>>,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client, resources: Mutex::new(FxHashMap::default()) }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn cached(&self, key: &str) -> Option<(ApiResource, bool)> {
        self.resources.lock().ok().and_then(|m| m.get(key).cloned())
    }

    /// Resolve an object type to its served resource and scope.
    async fn find_api_resource(&self, object_type: &ObjectType, op: StoreOp) -> Result<(ApiResource, bool), StoreError> {
        let key = object_type.key();
        if let Some(hit) = self.cached(&key) {
            return Ok(hit);
        }
        let gvk = GroupVersionKind::gvk(object_type.group(), object_type.version(), &object_type.kind);
        let discovery = Discovery::new(self.client.clone())
            .filter(&[gvk.group.as_str()])
            .run()
            .await
            .map_err(|e| store_error(op, e))?;
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    debug!(resource = %key, plural = %ar.plural, namespaced, "discovered api resource");
                    if let Ok(mut m) = self.resources.lock() {
                        m.insert(key, (ar.clone(), namespaced));
                    }
                    return Ok((ar, namespaced));
                }
            }
        }
        counter!("store_errors_total", 1, "op" => op.as_str());
        Err(StoreError::NotFound(format!("resource type {} is not served", key)))
    }

    async fn dynamic_api(
        &self,
        object_type: &ObjectType,
        namespace: Option<&str>,
        op: StoreOp,
    ) -> Result<(Api<DynamicObject>, ApiResource), StoreError> {
        let (ar, namespaced) = self.find_api_resource(object_type, op).await?;
        let api = match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            (true, None) => Api::default_namespaced_with(self.client.clone(), &ar),
            (false, _) => Api::all_with(self.client.clone(), &ar),
        };
        Ok((api, ar))
    }
}

/// List responses omit per-item `apiVersion`/`kind`; restore them from the resource.
fn with_types(mut obj: DynamicObject, ar: &ApiResource) -> DynamicObject {
    if obj.types.is_none() {
        obj.types = Some(TypeMeta { api_version: ar.api_version.clone(), kind: ar.kind.clone() });
    }
    obj
}

#[async_trait::async_trait]
impl ClusterStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<DynamicObject, StoreError> {
        let (api, ar) = self.dynamic_api(&key.object_type, key.namespace.as_deref(), StoreOp::Get).await?;
        let obj = api.get(&key.name).await.map_err(|e| store_error(StoreOp::Get, e))?;
        Ok(with_types(obj, &ar))
    }

    async fn list(
        &self,
        object_type: &ObjectType,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>, StoreError> {
        let (api, ar) = self.dynamic_api(object_type, Some(namespace), StoreOp::Expand).await?;
        let mut lp = ListParams::default();
        if !selector.is_empty() {
            lp = lp.labels(&selector_string(selector));
        }
        let list = api.list(&lp).await.map_err(|e| store_error(StoreOp::Expand, e))?;
        let mut items: Vec<DynamicObject> = list.items.into_iter().map(|o| with_types(o, &ar)).collect();
        items.sort_by(|a, b| a.name_any().cmp(&b.name_any()));
        Ok(items)
    }

    async fn plural(&self, object_type: &ObjectType) -> Result<String, StoreError> {
        let (ar, _) = self.find_api_resource(object_type, StoreOp::Expand).await?;
        Ok(ar.plural)
    }

    async fn apply(&self, service: &Service, field_manager: &str, force: bool) -> Result<Service, StoreError> {
        let name = service.metadata.name.as_deref().ok_or_else(|| StoreError::Invalid("service without name".into()))?;
        let ns = service.metadata.namespace.as_deref().ok_or_else(|| StoreError::Invalid("service without namespace".into()))?;
        let api: Api<Service> = Api::namespaced(self.client.clone(), ns);
        let mut pp = PatchParams::apply(field_manager);
        if force {
            pp = pp.force();
        }
        let applied = api.patch(name, &pp, &Patch::Apply(service)).await.map_err(|e| store_error(StoreOp::Apply, e))?;
        info!(service = %name, namespace = %ns, field_manager, "applied service");
        Ok(applied)
    }

    async fn delete(&self, reference: &TypedReference, namespace: &str) -> Result<(), StoreError> {
        let object_type = ObjectType::new(reference.api_version.clone(), reference.kind.clone());
        let (api, _) = self.dynamic_api(&object_type, Some(namespace), StoreOp::Delete).await?;
        let dp = DeleteParams {
            preconditions: Some(Preconditions { uid: Some(reference.uid.clone()), resource_version: None }),
            ..DeleteParams::default()
        };
        api.delete(&reference.name, &dp).await.map_err(|e| store_error(StoreOp::Delete, e))?;
        Ok(())
    }

    async fn update_status(&self, object: &ServiceTrait) -> Result<ServiceTrait, StoreError> {
        let name = object.name_any();
        let ns = object.namespace().ok_or_else(|| StoreError::Invalid("trait without namespace".into()))?;
        let api: Api<ServiceTrait> = Api::namespaced(self.client.clone(), &ns);
        let body = serde_json::json!({
            "metadata": { "resourceVersion": object.resource_version() },
            "status": object.status,
        });
        api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&body))
            .await
            .map_err(|e| store_error(StoreOp::Status, e))
    }
}
