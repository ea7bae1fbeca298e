//! kfold kubehub: discovery, OpenAPI and dynamic resource clients backed by kube-rs.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use kfold_core::{
    DeleteOptions, DeletePropagation, Discovery, PatchBody, RawObj, ResourceClient, ResourceClientFactory, ResourceKind,
    ServerVersion, StoreError,
};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, Preconditions, PropagationPolicy},
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{self, ApiCapabilities, Scope},
    Client, Config,
};
use serde_json::Value as Json;
use tracing::{debug, info};

/// Connect using the named kubeconfig context, or the ambient configuration
/// (in-cluster or current context) when none is given.
pub async fn connect(context: Option<&str>) -> Result<KubeClients> {
    let config = match context {
        Some(ctx) => {
            let opts = KubeConfigOptions { context: Some(ctx.to_string()), ..Default::default() };
            Config::from_kubeconfig(&opts).await.with_context(|| format!("loading kubeconfig context {ctx}"))?
        }
        None => Config::infer().await.context("inferring kube config")?,
    };
    info!(cluster = %config.cluster_url, context = ?context, "connecting");
    let client = Client::try_from(config).context("building kube client")?;
    Ok(KubeClients::new(client))
}

/// Namespace of the named context (or the current one) in the local kubeconfig.
pub fn context_namespace(context: Option<&str>) -> Option<String> {
    let kc = Kubeconfig::read().ok()?;
    let name = context.map(str::to_string).or(kc.current_context.clone())?;
    kc.contexts.iter().find(|c| c.name == name).and_then(|c| c.context.as_ref()).and_then(|c| c.namespace.clone())
}

fn map_err(e: kube::Error, what: &str) -> StoreError {
    match e {
        kube::Error::Api(resp) => match resp.code {
            404 => StoreError::NotFound(what.to_string()),
            409 if resp.reason == "AlreadyExists" => StoreError::AlreadyExists(what.to_string()),
            409 => StoreError::Conflict(format!("{what}: {}", resp.message)),
            code => StoreError::Api { code, message: resp.message },
        },
        other => StoreError::Transport(other.to_string()),
    }
}

fn to_raw(obj: DynamicObject) -> Result<RawObj, StoreError> {
    let v = serde_json::to_value(obj).map_err(|e| StoreError::Transport(e.to_string()))?;
    RawObj::from_value(v).map_err(|e| StoreError::Transport(e.to_string()))
}

/// Discovery and client factory over one kube `Client`.
#[derive(Clone)]
pub struct KubeClients {
    client: Client,
}

impl KubeClients {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn resource_kind(ar: &ApiResource, caps: &ApiCapabilities, preferred: bool) -> ResourceKind {
    ResourceKind {
        group: ar.group.clone(),
        version: ar.version.clone(),
        kind: ar.kind.clone(),
        plural: ar.plural.clone(),
        namespaced: matches!(caps.scope, Scope::Namespaced),
        verbs: caps.operations.iter().cloned().collect(),
        preferred,
    }
}

#[async_trait::async_trait]
impl Discovery for KubeClients {
    async fn resources(&self) -> Result<Vec<ResourceKind>, StoreError> {
        let discovery = discovery::Discovery::new(self.client.clone()).run().await.map_err(|e| map_err(e, "discovery"))?;
        let mut out = Vec::new();
        for group in discovery.groups() {
            let recommended: Vec<(String, String)> =
                group.recommended_resources().into_iter().map(|(ar, _)| (ar.kind, ar.version)).collect();
            for version in group.versions() {
                for (ar, caps) in group.versioned_resources(version) {
                    let preferred = recommended.iter().any(|(k, v)| *k == ar.kind && *v == ar.version);
                    out.push(resource_kind(&ar, &caps, preferred));
                }
            }
        }
        out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
        debug!(count = out.len(), "discovered resources");
        Ok(out)
    }

    async fn server_version(&self) -> Result<ServerVersion, StoreError> {
        let info = self.client.apiserver_version().await.map_err(|e| map_err(e, "version"))?;
        ServerVersion::parse(&info.major, &info.minor).ok_or_else(|| {
            StoreError::Transport(format!("unparseable server version {}.{}", info.major, info.minor))
        })
    }

    async fn openapi_v2(&self) -> Result<Option<Json>, StoreError> {
        let req = http::Request::get("/openapi/v2")
            .header(http::header::ACCEPT, "application/json")
            .body(Vec::new())
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        match self.client.request_text(req).await {
            Ok(text) => serde_json::from_str(&text).map(Some).map_err(|e| StoreError::Transport(format!("openapi document: {e}"))),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(None),
            Err(e) => Err(map_err(e, "openapi")),
        }
    }
}

impl ResourceClientFactory for KubeClients {
    fn client_for(&self, resource: &ResourceKind, namespace: Option<&str>) -> Result<Box<dyn ResourceClient>, StoreError> {
        let gvk = GroupVersionKind::gvk(&resource.group, &resource.version, &resource.kind);
        let ar = ApiResource::from_gvk_with_plural(&gvk, &resource.plural);
        let namespace = if resource.namespaced { namespace.map(str::to_string) } else { None };
        let api = match namespace.as_deref() {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        };
        Ok(Box::new(KubeResource { api, client: self.client.clone(), resource: resource.clone(), namespace }))
    }
}

struct KubeResource {
    api: Api<DynamicObject>,
    client: Client,
    resource: ResourceKind,
    namespace: Option<String>,
}

impl KubeResource {
    fn describe(&self, name: &str) -> String {
        match &self.namespace {
            Some(ns) => format!("{} {}/{}", self.resource.kind, ns, name),
            None => format!("{} {}", self.resource.kind, name),
        }
    }

    /// Pre-1.6 servers only understand `orphanDependents`, which kube's
    /// `DeleteParams` no longer carries, so the request is built by hand.
    async fn delete_legacy(&self, name: &str, opts: &DeleteOptions) -> Result<(), StoreError> {
        let mut body = serde_json::json!({ "kind": "DeleteOptions", "apiVersion": "v1", "orphanDependents": false });
        if let Some(uid) = &opts.precondition_uid {
            body["preconditions"] = serde_json::json!({ "uid": uid });
        }
        if let Some(g) = opts.grace_period_seconds {
            body["gracePeriodSeconds"] = Json::from(g);
        }
        let path = resource_path(&self.resource, self.namespace.as_deref(), name);
        let bytes = serde_json::to_vec(&body).map_err(|e| StoreError::Transport(e.to_string()))?;
        let req = http::Request::delete(path)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(bytes)
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        self.client.request_text(req).await.map(|_| ()).map_err(|e| map_err(e, &self.describe(name)))
    }
}

/// REST path of one object: `/api/v1/...` for the core group, `/apis/<group>/<version>/...` otherwise.
pub fn resource_path(rk: &ResourceKind, namespace: Option<&str>, name: &str) -> String {
    let mut path = if rk.group.is_empty() { format!("/api/{}", rk.version) } else { format!("/apis/{}/{}", rk.group, rk.version) };
    if let Some(ns) = namespace.filter(|_| rk.namespaced) {
        path.push_str("/namespaces/");
        path.push_str(ns);
    }
    path.push('/');
    path.push_str(&rk.plural);
    path.push('/');
    path.push_str(name);
    path
}

#[async_trait::async_trait]
impl ResourceClient for KubeResource {
    async fn get(&self, name: &str) -> Result<Option<RawObj>, StoreError> {
        match self.api.get_opt(name).await.map_err(|e| map_err(e, &self.describe(name)))? {
            Some(o) => to_raw(o).map(Some),
            None => Ok(None),
        }
    }

    async fn patch(&self, name: &str, body: &PatchBody) -> Result<RawObj, StoreError> {
        let pp = PatchParams::default();
        let res = match body {
            PatchBody::Merge(v) => self.api.patch(name, &pp, &Patch::Merge(v)).await,
            PatchBody::Strategic(v) => self.api.patch(name, &pp, &Patch::Strategic(v)).await,
        };
        to_raw(res.map_err(|e| map_err(e, &self.describe(name)))?)
    }

    async fn create(&self, obj: &RawObj) -> Result<RawObj, StoreError> {
        let dynamic: DynamicObject = serde_json::from_value(obj.as_value().clone()).map_err(|e| StoreError::Api { code: 422, message: e.to_string() })?;
        let created = self.api.create(&PostParams::default(), &dynamic).await.map_err(|e| map_err(e, &obj.describe()))?;
        to_raw(created)
    }

    async fn delete(&self, name: &str, opts: &DeleteOptions) -> Result<(), StoreError> {
        match opts.propagation {
            DeletePropagation::LegacyNoOrphan => self.delete_legacy(name, opts).await,
            DeletePropagation::Foreground => {
                let dp = DeleteParams {
                    propagation_policy: Some(PropagationPolicy::Foreground),
                    preconditions: opts.precondition_uid.clone().map(|uid| Preconditions { uid: Some(uid), resource_version: None }),
                    grace_period_seconds: opts.grace_period_seconds.and_then(|g| u32::try_from(g).ok()),
                    ..DeleteParams::default()
                };
                self.api.delete(name, &dp).await.map(|_| ()).map_err(|e| map_err(e, &self.describe(name)))
            }
        }
    }

    async fn list(&self) -> Result<Vec<RawObj>, StoreError> {
        let list = self.api.list(&ListParams::default()).await.map_err(|e| map_err(e, &self.resource.plural))?;
        list.items.into_iter().map(to_raw).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rk(group: &str, plural: &str, namespaced: bool) -> ResourceKind {
        ResourceKind {
            group: group.into(),
            version: "v1".into(),
            kind: "X".into(),
            plural: plural.into(),
            namespaced,
            verbs: Default::default(),
            preferred: true,
        }
    }

    #[test]
    fn served_versions_keep_scope_verbs_and_preference() {
        let gvk = GroupVersionKind::gvk("autoscaling", "v1", "HorizontalPodAutoscaler");
        let ar = ApiResource::from_gvk_with_plural(&gvk, "horizontalpodautoscalers");
        let caps = ApiCapabilities {
            scope: Scope::Namespaced,
            subresources: Vec::new(),
            operations: vec!["get".into(), "list".into(), "patch".into()],
        };
        let rk = resource_kind(&ar, &caps, false);
        assert_eq!(rk.gvk().key(), "autoscaling/v1/HorizontalPodAutoscaler");
        assert!(rk.namespaced);
        assert!(!rk.preferred);
        assert!(rk.supports("patch"));
        assert!(!rk.supports("create"));
    }

    #[test]
    fn paths_follow_group_and_scope() {
        assert_eq!(resource_path(&rk("", "configmaps", true), Some("ns"), "c"), "/api/v1/namespaces/ns/configmaps/c");
        assert_eq!(resource_path(&rk("apps", "deployments", true), Some("ns"), "d"), "/apis/apps/v1/namespaces/ns/deployments/d");
        assert_eq!(resource_path(&rk("", "namespaces", false), Some("ignored"), "n"), "/api/v1/namespaces/n");
    }

    #[test]
    fn api_errors_map_to_store_errors() {
        let resp = |code: u16, reason: &str| {
            kube::Error::Api(kube::core::ErrorResponse { status: "Failure".into(), message: "m".into(), reason: reason.into(), code })
        };
        assert!(map_err(resp(404, "NotFound"), "x").is_not_found());
        assert!(map_err(resp(409, "Conflict"), "x").is_conflict());
        assert_eq!(map_err(resp(409, "AlreadyExists"), "x"), StoreError::AlreadyExists("x".into()));
        assert_eq!(map_err(resp(403, "Forbidden"), "x"), StoreError::Api { code: 403, message: "m".into() });
    }
}
