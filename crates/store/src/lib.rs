//! kfold store: an in-RAM object store that answers discovery and resource
//! client calls the way an API server would. The engine's tests run against it.
//!
//! Objects are keyed by group, kind, namespace and name, so one object is
//! visible through every served version of its kind. Every write assigns a
//! fresh `resourceVersion` from a store-wide counter.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use kfold_core::{
    DeleteOptions, Discovery, PatchBody, RawObj, ResourceClient, ResourceClientFactory, ResourceKind,
    ServerVersion, StoreError,
};
use kfold_schema::SchemaIndex;
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use smallvec::SmallVec;
use tracing::debug;

const VERBS: [&str; 8] = ["create", "delete", "deletecollection", "get", "list", "patch", "update", "watch"];

/// A resource kind serving the usual verbs.
pub fn resource(group: &str, version: &str, kind: &str, plural: &str, namespaced: bool) -> ResourceKind {
    ResourceKind {
        group: group.into(),
        version: version.into(),
        kind: kind.into(),
        plural: plural.into(),
        namespaced,
        verbs: VERBS.iter().map(|v| v.to_string()).collect(),
        preferred: true,
    }
}

/// Like [`resource`], for a version served next to a preferred one.
pub fn older_resource(group: &str, version: &str, kind: &str, plural: &str, namespaced: bool) -> ResourceKind {
    ResourceKind { preferred: false, ..resource(group, version, kind, plural, namespaced) }
}

/// The kinds a fresh store serves.
pub fn builtin_resources() -> Vec<ResourceKind> {
    let mut review = resource("authorization.k8s.io", "v1", "SelfSubjectAccessReview", "selfsubjectaccessreviews", false);
    review.verbs = SmallVec::from_iter(["create".to_string()]);
    vec![
        resource("", "v1", "Namespace", "namespaces", false),
        resource("", "v1", "ServiceAccount", "serviceaccounts", true),
        resource("", "v1", "Secret", "secrets", true),
        resource("", "v1", "ConfigMap", "configmaps", true),
        resource("", "v1", "Service", "services", true),
        resource("", "v1", "Pod", "pods", true),
        resource("apps", "v1", "Deployment", "deployments", true),
        resource("apps", "v1", "ReplicaSet", "replicasets", true),
        resource("autoscaling", "v2", "HorizontalPodAutoscaler", "horizontalpodautoscalers", true),
        older_resource("autoscaling", "v1", "HorizontalPodAutoscaler", "horizontalpodautoscalers", true),
        resource("rbac.authorization.k8s.io", "v1", "ClusterRole", "clusterroles", false),
        resource("apiextensions.k8s.io", "v1", "CustomResourceDefinition", "customresourcedefinitions", false),
        review,
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct ObjKey {
    group: String,
    kind: String,
    namespace: Option<String>,
    name: String,
}

/// One recorded client call.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Get { kind: String, namespace: Option<String>, name: String },
    List { kind: String, namespace: Option<String> },
    Create { kind: String, namespace: Option<String>, name: String },
    Patch { kind: String, namespace: Option<String>, name: String, body: PatchBody },
    Delete { kind: String, namespace: Option<String>, name: String, opts: DeleteOptions },
}

impl Call {
    /// True for calls that change the store.
    pub fn is_write(&self) -> bool {
        matches!(self, Call::Create { .. } | Call::Patch { .. } | Call::Delete { .. })
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Call::Get { name, .. } | Call::Create { name, .. } | Call::Patch { name, .. } | Call::Delete { name, .. } => Some(name),
            Call::List { .. } => None,
        }
    }
}

struct Inner {
    resources: Vec<ResourceKind>,
    version: ServerVersion,
    openapi: Option<Json>,
    openapi_broken: bool,
    schema: Option<SchemaIndex>,
    objects: FxHashMap<ObjKey, RawObj>,
    next_rv: u64,
    conflicts: FxHashMap<(String, String), u32>,
    delete_faults: FxHashMap<(String, String), StoreError>,
    journal: Vec<Call>,
    discovery_calls: usize,
}

impl Inner {
    fn bump_rv(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }
}

/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemStore {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                resources: builtin_resources(),
                version: ServerVersion::new(1, 29),
                openapi: None,
                openapi_broken: false,
                schema: None,
                objects: FxHashMap::default(),
                next_rv: 0,
                conflicts: FxHashMap::default(),
                delete_faults: FxHashMap::default(),
                journal: Vec::new(),
                discovery_calls: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_version(self, version: ServerVersion) -> Self {
        self.lock().version = version;
        self
    }

    /// Publish an OpenAPI v2 document; strategic patches are applied using it.
    pub fn with_openapi(self, doc: Json) -> Self {
        {
            let mut g = self.lock();
            g.schema = SchemaIndex::from_openapi_v2(&doc).ok();
            g.openapi = Some(doc);
        }
        self
    }

    /// Make OpenAPI fetches fail with a transport error.
    pub fn with_broken_openapi(self) -> Self {
        self.lock().openapi_broken = true;
        self
    }

    /// Start serving another kind, as if a CRD had just been established.
    pub fn serve(&self, resource: ResourceKind) {
        self.lock().resources.push(resource);
    }

    /// Insert an object directly, assigning `uid` and `resourceVersion` when missing.
    pub fn seed(&self, value: Json) -> Result<RawObj, StoreError> {
        let mut obj = RawObj::from_value(value).map_err(invalid)?;
        let name = obj.name().ok_or_else(|| invalid("seeded objects need metadata.name"))?.to_string();
        let gvk = obj.gvk();
        let mut g = self.lock();
        if obj.uid().is_none() {
            obj.set_uid(&uuid::Uuid::new_v4().to_string());
        }
        let rv = g.bump_rv();
        obj.set_resource_version(Some(&rv));
        let key = ObjKey { group: gvk.group, kind: gvk.kind, namespace: obj.namespace().map(str::to_string), name };
        g.objects.insert(key, obj.clone());
        Ok(obj)
    }

    /// Look an object up by kind, namespace and name.
    pub fn object(&self, kind: &str, namespace: Option<&str>, name: &str) -> Option<RawObj> {
        self.lock()
            .objects
            .iter()
            .find(|(k, _)| k.kind == kind && k.namespace.as_deref() == namespace && k.name == name)
            .map(|(_, o)| o.clone())
    }

    /// All stored objects ordered by group, kind, namespace and name.
    pub fn objects(&self) -> Vec<RawObj> {
        let g = self.lock();
        let sorted: BTreeMap<&ObjKey, &RawObj> = g.objects.iter().collect();
        sorted.into_values().cloned().collect()
    }

    /// Fail the next `n` patches of `kind`/`name` with a conflict.
    pub fn inject_conflicts(&self, kind: &str, name: &str, n: u32) {
        self.lock().conflicts.insert((kind.to_string(), name.to_string()), n);
    }

    /// Fail the next delete of `kind`/`name` with `err`. The object stays.
    pub fn fail_delete(&self, kind: &str, name: &str, err: StoreError) {
        self.lock().delete_faults.insert((kind.to_string(), name.to_string()), err);
    }

    pub fn journal(&self) -> Vec<Call> {
        self.lock().journal.clone()
    }

    pub fn writes(&self) -> Vec<Call> {
        self.lock().journal.iter().filter(|c| c.is_write()).cloned().collect()
    }

    pub fn clear_journal(&self) {
        self.lock().journal.clear();
    }

    /// How many times the served resource list was fetched.
    pub fn discovery_calls(&self) -> usize {
        self.lock().discovery_calls
    }
}

fn invalid(msg: impl std::fmt::Display) -> StoreError {
    StoreError::Api { code: 422, message: msg.to_string() }
}

#[async_trait::async_trait]
impl Discovery for MemStore {
    async fn resources(&self) -> Result<Vec<ResourceKind>, StoreError> {
        let mut g = self.lock();
        g.discovery_calls += 1;
        Ok(g.resources.clone())
    }

    async fn server_version(&self) -> Result<ServerVersion, StoreError> {
        Ok(self.lock().version)
    }

    async fn openapi_v2(&self) -> Result<Option<Json>, StoreError> {
        let g = self.lock();
        if g.openapi_broken {
            return Err(StoreError::Transport("openapi endpoint unavailable".into()));
        }
        Ok(g.openapi.clone())
    }
}

impl ResourceClientFactory for MemStore {
    fn client_for(&self, resource: &ResourceKind, namespace: Option<&str>) -> Result<Box<dyn ResourceClient>, StoreError> {
        let namespace = if resource.namespaced { namespace.map(str::to_string) } else { None };
        Ok(Box::new(MemClient { store: self.clone(), resource: resource.clone(), namespace }))
    }
}

/// Client bound to one kind and namespace of a [`MemStore`].
pub struct MemClient {
    store: MemStore,
    resource: ResourceKind,
    namespace: Option<String>,
}

impl MemClient {
    fn key(&self, name: &str) -> Result<ObjKey, StoreError> {
        if self.resource.namespaced && self.namespace.is_none() {
            return Err(StoreError::Api { code: 400, message: format!("{} is namespaced; a namespace is required", self.resource.kind) });
        }
        Ok(ObjKey {
            group: self.resource.group.clone(),
            kind: self.resource.kind.clone(),
            namespace: self.namespace.clone(),
            name: name.to_string(),
        })
    }

    fn describe(&self, name: &str) -> String {
        match &self.namespace {
            Some(ns) => format!("{} {}/{}", self.resource.kind, ns, name),
            None => format!("{} {}", self.resource.kind, name),
        }
    }

    fn require(&self, verb: &str) -> Result<(), StoreError> {
        if self.resource.supports(verb) {
            Ok(())
        } else {
            Err(StoreError::Api { code: 405, message: format!("{verb} not allowed on {}", self.resource.plural) })
        }
    }
}

#[async_trait::async_trait]
impl ResourceClient for MemClient {
    async fn get(&self, name: &str) -> Result<Option<RawObj>, StoreError> {
        self.require("get")?;
        let key = self.key(name)?;
        let mut g = self.store.lock();
        g.journal.push(Call::Get { kind: key.kind.clone(), namespace: key.namespace.clone(), name: key.name.clone() });
        Ok(g.objects.get(&key).cloned())
    }

    async fn patch(&self, name: &str, body: &PatchBody) -> Result<RawObj, StoreError> {
        self.require("patch")?;
        let key = self.key(name)?;
        let mut g = self.store.lock();
        g.journal.push(Call::Patch { kind: key.kind.clone(), namespace: key.namespace.clone(), name: key.name.clone(), body: body.clone() });
        let live = g.objects.get(&key).cloned().ok_or_else(|| StoreError::NotFound(self.describe(name)))?;

        let wanted_rv = body.value().get("metadata").and_then(|m| m.get("resourceVersion")).and_then(Json::as_str);
        if let Some(rv) = wanted_rv {
            if Some(rv) != live.resource_version() {
                return Err(StoreError::Conflict(format!("{}: resourceVersion {rv} is stale", self.describe(name))));
            }
        }
        if let Some(left) = g.conflicts.get_mut(&(key.kind.clone(), key.name.clone())) {
            if *left > 0 {
                *left -= 1;
                return Err(StoreError::Conflict(format!("{}: injected conflict", self.describe(name))));
            }
        }

        let meta = match body {
            PatchBody::Strategic(_) => g.schema.as_ref().and_then(|s| s.lookup(&self.resource.gvk()).ok()),
            PatchBody::Merge(_) => None,
        };
        let mut value = live.as_value().clone();
        kfold_schema::apply_patch(&mut value, body, meta.as_ref());
        // identity is not patchable
        for field in ["name", "namespace", "uid"] {
            match live.as_value()["metadata"].get(field) {
                Some(v) => value["metadata"][field] = v.clone(),
                None => {
                    if let Some(m) = value.get_mut("metadata").and_then(Json::as_object_mut) {
                        m.remove(field);
                    }
                }
            }
        }
        let mut obj = RawObj::from_value(value).map_err(invalid)?;
        let rv = g.bump_rv();
        obj.set_resource_version(Some(&rv));
        debug!(obj = %obj.describe(), rv = %rv, "patched");
        g.objects.insert(key, obj.clone());
        Ok(obj)
    }

    async fn create(&self, obj: &RawObj) -> Result<RawObj, StoreError> {
        self.require("create")?;
        let mut obj = obj.clone();
        if let (Some(want), Some(have)) = (self.namespace.as_deref(), obj.namespace()) {
            if want != have {
                return Err(invalid(format!("namespace {have} does not match request namespace {want}")));
            }
        }
        match &self.namespace {
            Some(ns) => obj.set_namespace(ns),
            None if self.resource.namespaced => return Err(invalid(format!("{} needs a namespace", obj.describe()))),
            None => {}
        }
        let name = match (obj.name(), obj.generate_name()) {
            (Some(n), _) => n.to_string(),
            (None, Some(prefix)) => {
                let suffix: String = uuid::Uuid::new_v4().simple().to_string().chars().take(5).collect();
                format!("{prefix}{suffix}")
            }
            (None, None) => return Err(invalid("metadata.name required")),
        };
        let key = self.key(&name)?;
        let mut g = self.store.lock();
        g.journal.push(Call::Create { kind: key.kind.clone(), namespace: key.namespace.clone(), name: name.clone() });
        if g.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(self.describe(&name)));
        }
        obj.set_name(&name);
        obj.set_uid(&uuid::Uuid::new_v4().to_string());
        let rv = g.bump_rv();
        obj.set_resource_version(Some(&rv));
        debug!(obj = %obj.describe(), "created");
        g.objects.insert(key, obj.clone());
        Ok(obj)
    }

    async fn delete(&self, name: &str, opts: &DeleteOptions) -> Result<(), StoreError> {
        self.require("delete")?;
        let key = self.key(name)?;
        let mut g = self.store.lock();
        g.journal.push(Call::Delete { kind: key.kind.clone(), namespace: key.namespace.clone(), name: key.name.clone(), opts: opts.clone() });
        if let Some(err) = g.delete_faults.remove(&(key.kind.clone(), key.name.clone())) {
            return Err(err);
        }
        let live = g.objects.get(&key).ok_or_else(|| StoreError::NotFound(self.describe(name)))?;
        if let Some(uid) = opts.precondition_uid.as_deref() {
            if live.uid() != Some(uid) {
                return Err(StoreError::Conflict(format!("{}: uid precondition failed", self.describe(name))));
            }
        }
        g.objects.remove(&key);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<RawObj>, StoreError> {
        self.require("list")?;
        let mut g = self.store.lock();
        g.journal.push(Call::List { kind: self.resource.kind.clone(), namespace: self.namespace.clone() });
        let mut out: Vec<(&ObjKey, &RawObj)> = g
            .objects
            .iter()
            .filter(|(k, _)| k.group == self.resource.group && k.kind == self.resource.kind)
            .filter(|(k, _)| self.namespace.is_none() || k.namespace == self.namespace)
            .collect();
        out.sort_by(|a, b| a.0.cmp(b.0));
        Ok(out.into_iter().map(|(_, o)| o.clone()).collect())
    }
}
