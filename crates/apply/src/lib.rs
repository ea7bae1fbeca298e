//! kfold apply: reconciles a batch of desired objects against the cluster.
//!
//! A run fetches the objects, orders them so prerequisites go first, records
//! each one's pristine snapshot, three-way merges it with the live object,
//! upserts the result and finally garbage-collects tagged objects that were
//! not produced by the run.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use kfold_core::annotations::GC_TAG;
use kfold_core::{Discovery, Gvk, RawObj, ResourceClientFactory};
use metrics::{counter, histogram};
use serde::Serialize;
use tracing::info;

mod catalog;
pub mod codec;
mod config;
mod delete;
mod error;
mod gc;
mod merger;
mod order;
mod upsert;

pub use catalog::{Catalog, FallbackReason, PatchStrategy};
pub use config::{ApplyConfig, DeleteConfig, RetryPolicy};
pub use delete::{Delete, DeleteReport};
pub use error::{ApplyError, Phase};
pub use gc::{gc_decision, GarbageCollector, GcDecision, GcReport};
pub use merger::{check_merge_preconditions, DefaultMerger, ObjectMerger};
pub use order::{DependencyOrderer, KindRanks};
pub use upsert::{DefaultUpserter, Sleeper, TokioSleeper, Upserter};

/// Produces the desired objects of an environment.
#[async_trait::async_trait]
pub trait ObjectSource: Send + Sync {
    /// Objects for `env`, limited to `components` unless empty.
    async fn objects(&self, env: &str, components: &[String]) -> anyhow::Result<Vec<RawObj>>;
}

/// Store access for one environment.
#[derive(Clone)]
pub struct Clients {
    pub discovery: Arc<dyn Discovery>,
    pub factory: Arc<dyn ResourceClientFactory>,
    /// Namespace given to namespaced objects that declare none.
    pub namespace: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AppliedObject {
    pub object: String,
    pub uid: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyReport {
    pub applied: Vec<AppliedObject>,
    pub gc: Option<GcReport>,
}

pub struct Apply {
    config: ApplyConfig,
    source: Arc<dyn ObjectSource>,
    clients: Clients,
    catalog: Arc<Catalog>,
    ranks: KindRanks,
    merger: Arc<dyn ObjectMerger>,
    upserter: Arc<dyn Upserter>,
}

impl Apply {
    pub fn new(config: ApplyConfig, source: Arc<dyn ObjectSource>, clients: Clients, sleeper: Arc<dyn Sleeper>) -> Self {
        let catalog = Arc::new(Catalog::new(Arc::clone(&clients.discovery)));
        let merger = Arc::new(DefaultMerger::new(Arc::clone(&catalog), Arc::clone(&clients.factory), config.dry_run));
        let upserter = Arc::new(
            DefaultUpserter::new(Arc::clone(&catalog), Arc::clone(&clients.factory), sleeper)
                .create(config.create)
                .dry_run(config.dry_run)
                .policy(config.retry),
        );
        Self { config, source, clients, catalog, ranks: KindRanks::default(), merger, upserter }
    }

    pub fn with_merger(mut self, merger: Arc<dyn ObjectMerger>) -> Self {
        self.merger = merger;
        self
    }

    pub fn with_upserter(mut self, upserter: Arc<dyn Upserter>) -> Self {
        self.upserter = upserter;
        self
    }

    pub async fn run(&self) -> Result<ApplyReport, ApplyError> {
        let cfg = &self.config;
        let mut objs = self
            .source
            .objects(&cfg.env, &cfg.components)
            .await
            .with_context(|| format!("reading objects for environment {}", cfg.env))?;
        DependencyOrderer::new(&self.ranks).sort(&mut objs);
        info!(env = %cfg.env, objects = objs.len(), dry_run = cfg.dry_run, "applying");

        let mut report = ApplyReport::default();
        let mut seen = BTreeSet::new();
        for obj in objs {
            let t0 = Instant::now();
            counter!("apply_objects_total", 1u64);
            let applied = self.apply_one(obj).await;
            histogram!("apply_object_ms", t0.elapsed().as_secs_f64() * 1000.0);
            let applied = applied.map_err(|e| {
                counter!("apply_err_total", 1u64);
                e
            })?;
            seen.insert(applied.uid.clone());
            report.applied.push(applied);
        }

        if cfg.gc_enabled() {
            let gc = GarbageCollector::new(Arc::clone(&self.catalog), Arc::clone(&self.clients.factory), cfg.dry_run);
            let res = gc.run(&cfg.gc_tag, &seen).await.map_err(|e| e.in_phase(Phase::Gc, format!("tag {}", cfg.gc_tag)))?;
            info!(tag = %cfg.gc_tag, considered = res.considered, deleted = res.deleted.len(), "garbage collection done");
            report.gc = Some(res);
        }
        Ok(report)
    }

    async fn apply_one(&self, mut obj: RawObj) -> Result<AppliedObject, ApplyError> {
        let rk = self.catalog.resolve(&obj.gvk()).await.map_err(|e| e.in_phase(Phase::Merge, obj.describe()))?;
        if rk.namespaced && obj.namespace().is_none() {
            obj.set_namespace(&self.clients.namespace);
        }
        let desc = obj.describe();
        codec::tag_managed(&mut obj).map_err(|e| e.in_phase(Phase::Annotate, &desc))?;

        let mut merged = self.merger.merge(obj.namespace(), &obj).await.map_err(|e| e.in_phase(Phase::Merge, &desc))?;
        if !self.config.gc_tag.is_empty() {
            merged.set_annotation(GC_TAG, &self.config.gc_tag);
        }
        let uid = self.upserter.upsert(&merged).await.map_err(|e| e.in_phase(Phase::Upsert, &desc))?;
        Ok(AppliedObject { object: desc, uid })
    }
}

/// The last-applied form of a live object, or `None` when it does not exist.
pub async fn last_applied(clients: &Clients, gvk: &Gvk, namespace: Option<&str>, name: &str) -> Result<Option<RawObj>, ApplyError> {
    let catalog = Catalog::new(Arc::clone(&clients.discovery));
    let rk = catalog.resolve(gvk).await?;
    let ns = if rk.namespaced { Some(namespace.unwrap_or(&clients.namespace)) } else { None };
    match clients.factory.client_for(&rk, ns)?.get(name).await? {
        Some(live) => codec::rebuild_object(&live).map(Some),
        None => Ok(None),
    }
}
