//! In-RAM cluster store: objects kept as raw JSON, field-owned apply, UID preconditions on
//! delete and resourceVersion checks on status writes.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use k8s_openapi::api::core::v1::Service;
use kube::core::DynamicObject;
use rustc_hash::FxHashMap;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as Json;
use servicetrait_core::{ClusterStore, ObjectKey, ObjectType, ServiceTrait, StoreError, StoreOp, TypedReference};
use tracing::debug;

type FieldPath = Vec<String>;

struct Entry {
    raw: Json,
    /// Leaf field -> owning manager.
    managers: FxHashMap<FieldPath, String>,
}

#[derive(Default)]
struct Inner {
    objects: FxHashMap<ObjectKey, Entry>,
    plurals: FxHashMap<ObjectType, String>,
    deleted: Vec<TypedReference>,
    failures: FxHashMap<StoreOp, StoreError>,
    next_rv: u64,
}

impl Inner {
    fn bump_rv(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }

    fn take_failure(&mut self, op: StoreOp) -> Result<(), StoreError> {
        match self.failures.remove(&op) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// In-memory [`ClusterStore`]. Cheap to build; every call completes synchronously.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or replace an object. Assigns `metadata.uid` when absent and a fresh
    /// resourceVersion. Field ownership is reset.
    pub fn insert(&self, mut raw: Json) -> Result<Json, StoreError> {
        let key = key_of(&raw)?;
        let mut inner = self.lock();
        let rv = inner.bump_rv();
        let meta = metadata_mut(&mut raw)?;
        if !meta.contains_key("uid") {
            meta.insert("uid".into(), Json::String(uuid::Uuid::new_v4().to_string()));
        }
        meta.insert("resourceVersion".into(), Json::String(rv));
        meta.entry("creationTimestamp").or_insert_with(|| Json::String(now_ts()));
        inner.objects.insert(key, Entry { raw: raw.clone(), managers: FxHashMap::default() });
        Ok(raw)
    }

    /// Insert any serializable resource (typed k8s object, custom resource).
    pub fn insert_object<K: Serialize>(&self, obj: &K) -> Result<Json, StoreError> {
        let raw = serde_json::to_value(obj).map_err(|e| StoreError::Invalid(e.to_string()))?;
        self.insert(raw)
    }

    /// Load every document of a multi-document YAML stream. Returns the number inserted.
    pub fn load_yaml(&self, yaml: &str) -> Result<usize, StoreError> {
        let mut n = 0usize;
        for doc in serde_yaml::Deserializer::from_str(yaml) {
            let val = serde_yaml::Value::deserialize(doc).map_err(|e| StoreError::Invalid(format!("parsing YAML: {}", e)))?;
            if val.is_null() {
                continue;
            }
            let json = serde_json::to_value(val).map_err(|e| StoreError::Invalid(format!("converting YAML: {}", e)))?;
            self.insert(json)?;
            n += 1;
        }
        Ok(n)
    }

    /// Override the plural used for WorkloadDefinition lookups (default: lowercase kind + "s").
    pub fn register_plural(&self, object_type: ObjectType, plural: impl Into<String>) {
        self.lock().plurals.insert(object_type, plural.into());
    }

    /// Fail the next call of `op` with `err`.
    pub fn fail_next(&self, op: StoreOp, err: StoreError) {
        self.lock().failures.insert(op, err);
    }

    pub fn get_raw(&self, key: &ObjectKey) -> Option<Json> {
        self.lock().objects.get(key).map(|e| e.raw.clone())
    }

    pub fn get_as<K: DeserializeOwned>(&self, key: &ObjectKey) -> Result<K, StoreError> {
        let raw = self.get_raw(key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        serde_json::from_value(raw).map_err(|e| StoreError::Invalid(format!("{}: {}", key, e)))
    }

    /// All objects of a type, sorted by namespace then name.
    pub fn objects_of(&self, object_type: &ObjectType) -> Vec<Json> {
        let inner = self.lock();
        let mut keys: Vec<&ObjectKey> = inner.objects.keys().filter(|k| &k.object_type == object_type).collect();
        keys.sort_by(|a, b| a.namespace.cmp(&b.namespace).then(a.name.cmp(&b.name)));
        keys.into_iter().filter_map(|k| inner.objects.get(k).map(|e| e.raw.clone())).collect()
    }

    /// References deleted through [`ClusterStore::delete`], in call order.
    pub fn deleted(&self) -> Vec<TypedReference> {
        self.lock().deleted.clone()
    }

    /// Field ownership of an object, rendered as `a.b.c -> manager`.
    pub fn managers(&self, key: &ObjectKey) -> BTreeMap<String, String> {
        self.lock()
            .objects
            .get(key)
            .map(|e| e.managers.iter().map(|(p, m)| (p.join("."), m.clone())).collect())
            .unwrap_or_default()
    }

    /// Field-owned merge of `payload` into the live object.
    pub fn apply_raw(&self, payload: &Json, field_manager: &str, force: bool) -> Result<Json, StoreError> {
        let key = key_of(payload)?;
        let mut inner = self.lock();
        inner.take_failure(StoreOp::Apply)?;

        let new_paths = field_paths(payload);
        let (mut live, mut managers) = match inner.objects.get(&key) {
            Some(e) => (e.raw.clone(), e.managers.clone()),
            None => {
                let mut meta = serde_json::Map::new();
                meta.insert("name".into(), Json::String(key.name.clone()));
                if let Some(ns) = &key.namespace {
                    meta.insert("namespace".into(), Json::String(ns.clone()));
                }
                let skeleton = serde_json::json!({
                    "apiVersion": key.object_type.api_version,
                    "kind": key.object_type.kind,
                    "metadata": meta,
                });
                (skeleton, FxHashMap::default())
            }
        };
        let existed = inner.objects.contains_key(&key);

        let mut conflicts = Vec::new();
        for path in new_paths.iter() {
            if let Some(owner) = managers.get(path) {
                if owner != field_manager && !force && lookup(&live, path) != lookup(payload, path) {
                    conflicts.push(format!("{} (owned by {})", path.join("."), owner));
                }
            }
        }
        if !conflicts.is_empty() {
            return Err(StoreError::Conflict(format!("{}: {}", key, conflicts.join(", "))));
        }

        let before = live.clone();
        // Fields this manager owned previously but no longer sends are dropped.
        let released: Vec<FieldPath> = managers
            .iter()
            .filter(|(p, m)| m.as_str() == field_manager && !new_paths.contains(*p))
            .map(|(p, _)| p.clone())
            .collect();
        for path in released {
            remove(&mut live, &path);
            managers.remove(&path);
        }
        for path in new_paths.iter() {
            if let Some(v) = lookup(payload, path) {
                let shared = lookup(&live, path) == Some(v);
                assign(&mut live, path, v.clone());
                let keep_other = shared && !force && managers.get(path).map(|m| m != field_manager).unwrap_or(false);
                if !keep_other {
                    managers.insert(path.clone(), field_manager.to_string());
                }
            }
        }

        if !existed || live != before {
            let rv = inner.bump_rv();
            let meta = metadata_mut(&mut live)?;
            meta.entry("uid").or_insert_with(|| Json::String(uuid::Uuid::new_v4().to_string()));
            meta.entry("creationTimestamp").or_insert_with(|| Json::String(now_ts()));
            meta.insert("resourceVersion".into(), Json::String(rv));
            debug!(object = %key, manager = field_manager, created = !existed, "applied");
        }
        inner.objects.insert(key, Entry { raw: live.clone(), managers });
        Ok(live)
    }
}

#[async_trait::async_trait]
impl ClusterStore for MemStore {
    async fn get(&self, key: &ObjectKey) -> Result<DynamicObject, StoreError> {
        self.lock().take_failure(StoreOp::Get)?;
        self.get_as(key)
    }

    async fn list(
        &self,
        object_type: &ObjectType,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>, StoreError> {
        self.lock().take_failure(StoreOp::Expand)?;
        let mut items: Vec<(String, Json)> = {
            let inner = self.lock();
            inner
                .objects
                .iter()
                .filter(|(k, e)| {
                    &k.object_type == object_type && k.namespace.as_deref() == Some(namespace) && labels_match(&e.raw, selector)
                })
                .map(|(k, e)| (k.name.clone(), e.raw.clone()))
                .collect()
        };
        items.sort_by(|a, b| a.0.cmp(&b.0));
        items
            .into_iter()
            .map(|(name, raw)| serde_json::from_value(raw).map_err(|e| StoreError::Invalid(format!("{}: {}", name, e))))
            .collect()
    }

    async fn plural(&self, object_type: &ObjectType) -> Result<String, StoreError> {
        let inner = self.lock();
        Ok(inner
            .plurals
            .get(object_type)
            .cloned()
            .unwrap_or_else(|| format!("{}s", object_type.kind.to_lowercase())))
    }

    async fn apply(&self, service: &Service, field_manager: &str, force: bool) -> Result<Service, StoreError> {
        let payload = serde_json::to_value(service).map_err(|e| StoreError::Invalid(e.to_string()))?;
        let live = self.apply_raw(&payload, field_manager, force)?;
        serde_json::from_value(live).map_err(|e| StoreError::Invalid(e.to_string()))
    }

    async fn delete(&self, reference: &TypedReference, namespace: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.take_failure(StoreOp::Delete)?;
        let key = ObjectKey::namespaced(reference.object_type(), namespace, reference.name.clone());
        let live_uid = match inner.objects.get(&key) {
            Some(e) => e.raw.pointer("/metadata/uid").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            None => return Err(StoreError::NotFound(key.to_string())),
        };
        if live_uid != reference.uid {
            return Err(StoreError::Conflict(format!("{}: uid precondition {} != {}", key, reference.uid, live_uid)));
        }
        inner.objects.remove(&key);
        inner.deleted.push(reference.clone());
        debug!(object = %key, uid = %reference.uid, "deleted");
        Ok(())
    }

    async fn update_status(&self, object: &ServiceTrait) -> Result<ServiceTrait, StoreError> {
        let raw = serde_json::to_value(object).map_err(|e| StoreError::Invalid(e.to_string()))?;
        let key = key_of(&raw)?;
        let mut inner = self.lock();
        inner.take_failure(StoreOp::Status)?;
        let current_rv = match inner.objects.get(&key) {
            Some(e) => e.raw.pointer("/metadata/resourceVersion").and_then(|v| v.as_str()).map(|s| s.to_string()),
            None => return Err(StoreError::NotFound(key.to_string())),
        };
        if let Some(rv) = object.metadata.resource_version.as_deref() {
            if current_rv.as_deref() != Some(rv) {
                return Err(StoreError::Conflict(format!("{}: resourceVersion {} is stale", key, rv)));
            }
        }
        let rv = inner.bump_rv();
        let entry = inner.objects.get_mut(&key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if let Some(obj) = entry.raw.as_object_mut() {
            match raw.get("status") {
                Some(status) => obj.insert("status".into(), status.clone()),
                None => obj.remove("status"),
            };
        }
        metadata_mut(&mut entry.raw)?.insert("resourceVersion".into(), Json::String(rv));
        serde_json::from_value(entry.raw.clone()).map_err(|e| StoreError::Invalid(e.to_string()))
    }
}

fn now_ts() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

fn key_of(raw: &Json) -> Result<ObjectKey, StoreError> {
    let field = |ptr: &str| raw.pointer(ptr).and_then(|v| v.as_str()).map(|s| s.to_string());
    let api_version = field("/apiVersion").ok_or_else(|| StoreError::Invalid("object missing apiVersion".into()))?;
    let kind = field("/kind").ok_or_else(|| StoreError::Invalid("object missing kind".into()))?;
    let name = field("/metadata/name").ok_or_else(|| StoreError::Invalid("object missing metadata.name".into()))?;
    Ok(ObjectKey { object_type: ObjectType::new(api_version, kind), namespace: field("/metadata/namespace"), name })
}

fn metadata_mut(raw: &mut Json) -> Result<&mut serde_json::Map<String, Json>, StoreError> {
    raw.get_mut("metadata")
        .and_then(|m| m.as_object_mut())
        .ok_or_else(|| StoreError::Invalid("object missing metadata".into()))
}

fn labels_match(raw: &Json, selector: &BTreeMap<String, String>) -> bool {
    let labels = raw.pointer("/metadata/labels").and_then(|v| v.as_object());
    selector.iter().all(|(k, v)| labels.and_then(|l| l.get(k)).and_then(|x| x.as_str()) == Some(v.as_str()))
}

/// Identity and server-populated fields never claimed by a manager.
fn is_unowned(path: &[String]) -> bool {
    match path {
        [top] => top == "apiVersion" || top == "kind" || top == "status",
        [m, f] if m == "metadata" => {
            matches!(f.as_str(), "name" | "namespace" | "uid" | "resourceVersion" | "generation" | "creationTimestamp" | "managedFields")
        }
        [top, ..] => top == "status",
        [] => true,
    }
}

/// Leaf paths of a payload. Arrays and scalars are leaves; empty objects too.
fn field_paths(v: &Json) -> BTreeSet<FieldPath> {
    fn walk(v: &Json, prefix: &mut FieldPath, out: &mut BTreeSet<FieldPath>) {
        match v {
            Json::Object(map) if !map.is_empty() => {
                for (k, vv) in map.iter() {
                    prefix.push(k.clone());
                    walk(vv, prefix, out);
                    prefix.pop();
                }
            }
            _ => {
                if !prefix.is_empty() {
                    out.insert(prefix.clone());
                }
            }
        }
    }
    let mut out = BTreeSet::new();
    walk(v, &mut Vec::new(), &mut out);
    out.retain(|p| !is_unowned(p));
    out
}

fn lookup<'a>(v: &'a Json, path: &[String]) -> Option<&'a Json> {
    path.iter().try_fold(v, |cur, seg| cur.get(seg.as_str()))
}

fn assign(v: &mut Json, path: &[String], val: Json) {
    let Some((last, parents)) = path.split_last() else { return };
    let mut cur = v;
    for seg in parents {
        if !cur.get(seg.as_str()).map(|x| x.is_object()).unwrap_or(false) {
            if let Some(obj) = cur.as_object_mut() {
                obj.insert(seg.clone(), Json::Object(serde_json::Map::new()));
            }
        }
        match cur.get_mut(seg.as_str()) {
            Some(next) => cur = next,
            None => return,
        }
    }
    if let Some(obj) = cur.as_object_mut() {
        obj.insert(last.clone(), val);
    }
}

fn remove(v: &mut Json, path: &[String]) {
    let Some((last, parents)) = path.split_last() else { return };
    let mut cur = v;
    for seg in parents {
        match cur.get_mut(seg.as_str()) {
            Some(next) => cur = next,
            None => return,
        }
    }
    if let Some(obj) = cur.as_object_mut() {
        obj.remove(last);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> FieldPath {
        s.split('.').map(|x| x.to_string()).collect()
    }

    #[test]
    fn field_paths_skip_identity_and_treat_arrays_as_leaves() {
        let v = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": { "name": "web", "namespace": "ns", "labels": { "a": "1" } },
            "spec": { "ports": [ { "port": 80 } ], "type": "ClusterIP" }
        });
        let paths = field_paths(&v);
        assert!(paths.contains(&p("metadata.labels.a")));
        assert!(paths.contains(&p("spec.ports")));
        assert!(paths.contains(&p("spec.type")));
        assert!(!paths.contains(&p("metadata.name")));
        assert!(!paths.contains(&p("apiVersion")));
        assert_eq!(paths.len(), 3);
    }

    #[test]
    fn assign_creates_intermediate_objects_and_remove_drops_leaf() {
        let mut v = serde_json::json!({});
        assign(&mut v, &p("spec.selector.app"), serde_json::json!("web"));
        assert_eq!(v, serde_json::json!({ "spec": { "selector": { "app": "web" } } }));
        remove(&mut v, &p("spec.selector.app"));
        assert_eq!(v, serde_json::json!({ "spec": { "selector": {} } }));
    }

    #[test]
    fn insert_assigns_uid_and_resource_version() {
        let store = MemStore::new();
        let stored = store
            .insert(serde_json::json!({ "apiVersion": "apps/v1", "kind": "StatefulSet", "metadata": { "name": "web", "namespace": "ns" } }))
            .unwrap();
        assert!(stored.pointer("/metadata/uid").and_then(|v| v.as_str()).is_some());
        assert_eq!(stored.pointer("/metadata/resourceVersion").and_then(|v| v.as_str()), Some("1"));
    }

    #[test]
    fn insert_rejects_objects_without_name() {
        let store = MemStore::new();
        let err = store.insert(serde_json::json!({ "apiVersion": "v1", "kind": "Service", "metadata": {} })).unwrap_err();
        assert!(err.to_string().contains("metadata.name"), "{}", err);
    }

    #[test]
    fn load_yaml_reads_every_document() {
        let store = MemStore::new();
        let yaml = "apiVersion: apps/v1\nkind: StatefulSet\nmetadata:\n  name: a\n  namespace: ns\n---\n---\napiVersion: v1\nkind: Service\nmetadata:\n  name: b\n  namespace: ns\n";
        assert_eq!(store.load_yaml(yaml).unwrap(), 2);
        assert_eq!(store.objects_of(&ObjectType::new("v1", "Service")).len(), 1);
    }
}
