#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use kfold_apply::{ApplyConfig, Clients, ObjectSource, RetryPolicy, Sleeper};
use kfold_core::annotations::COMPONENT;
use kfold_core::RawObj;
use kfold_store::MemStore;
use serde_json::{json, Value as Json};

pub struct VecSource(pub Vec<Json>);

#[async_trait::async_trait]
impl ObjectSource for VecSource {
    async fn objects(&self, _env: &str, components: &[String]) -> anyhow::Result<Vec<RawObj>> {
        let mut out = Vec::new();
        for v in &self.0 {
            let o = RawObj::from_value(v.clone())?;
            if components.is_empty() || o.annotation(COMPONENT).is_some_and(|c| components.iter().any(|w| w == c)) {
                out.push(o);
            }
        }
        Ok(out)
    }
}

#[derive(Default)]
pub struct RecordingSleeper {
    pub sleeps: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn count(&self) -> usize {
        self.sleeps.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, d: Duration) {
        self.sleeps.lock().unwrap().push(d);
    }
}

pub fn clients(store: &MemStore) -> Clients {
    Clients { discovery: Arc::new(store.clone()), factory: Arc::new(store.clone()), namespace: "default".into() }
}

pub fn config(gc_tag: &str) -> ApplyConfig {
    let mut c = ApplyConfig::new("test");
    c.gc_tag = gc_tag.into();
    c.retry = RetryPolicy { max_attempts: 5, backoff: Duration::from_millis(1000) };
    c
}

pub fn configmap(name: &str, data: Json) -> Json {
    json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": name, "namespace": "default" }, "data": data })
}

pub fn deployment(name: &str, containers: Json) -> Json {
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": { "name": name, "namespace": "default" },
        "spec": { "replicas": 1, "template": { "spec": { "containers": containers } } }
    })
}

pub fn openapi() -> Json {
    json!({
        "definitions": {
            "io.k8s.api.apps.v1.Deployment": {
                "properties": { "spec": { "$ref": "#/definitions/io.k8s.api.apps.v1.DeploymentSpec" } },
                "x-kubernetes-group-version-kind": [ { "group": "apps", "kind": "Deployment", "version": "v1" } ]
            },
            "io.k8s.api.apps.v1.DeploymentSpec": {
                "properties": { "template": { "$ref": "#/definitions/io.k8s.api.core.v1.PodTemplateSpec" } }
            },
            "io.k8s.api.core.v1.PodTemplateSpec": {
                "properties": { "spec": { "$ref": "#/definitions/io.k8s.api.core.v1.PodSpec" } }
            },
            "io.k8s.api.core.v1.PodSpec": {
                "properties": {
                    "containers": {
                        "type": "array",
                        "items": { "$ref": "#/definitions/io.k8s.api.core.v1.Container" },
                        "x-kubernetes-patch-merge-key": "name",
                        "x-kubernetes-patch-strategy": "merge"
                    }
                }
            },
            "io.k8s.api.core.v1.Container": {
                "properties": { "name": { "type": "string" }, "image": { "type": "string" } }
            },
            "com.example.v1.Widget": {
                "x-kubernetes-group-version-kind": [ { "group": "example.com", "kind": "Widget", "version": "v1" } ]
            }
        }
    })
}
