//! Patch-or-create of a single object with bounded conflict retry.

use std::sync::Arc;
use std::time::Duration;

use kfold_core::{PatchBody, RawObj, ResourceClient, ResourceClientFactory, StoreError};
use kfold_schema::three_way;
use metrics::counter;
use serde_json::Value as Json;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::config::RetryPolicy;
use crate::error::ApplyError;

#[async_trait::async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, d: Duration);
}

pub struct TokioSleeper;

#[async_trait::async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, d: Duration) {
        tokio::time::sleep(d).await;
    }
}

#[async_trait::async_trait]
pub trait Upserter: Send + Sync {
    /// Make the store hold `obj`; returns the store's identifier for it.
    async fn upsert(&self, obj: &RawObj) -> Result<String, ApplyError>;
}

pub struct DefaultUpserter {
    catalog: Arc<Catalog>,
    factory: Arc<dyn ResourceClientFactory>,
    create: bool,
    dry_run: bool,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl DefaultUpserter {
    pub fn new(catalog: Arc<Catalog>, factory: Arc<dyn ResourceClientFactory>, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { catalog, factory, create: true, dry_run: false, policy: RetryPolicy::default(), sleeper }
    }

    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    async fn create_new(&self, client: &dyn ResourceClient, obj: &RawObj) -> Result<String, ApplyError> {
        if !self.create {
            return Err(ApplyError::NotCreatable(obj.describe()));
        }
        let mut fresh = obj.clone();
        fresh.set_resource_version(None);
        let created = client.create(&fresh).await?;
        counter!("apply_created_total", 1u64);
        info!(obj = %created.describe(), "created");
        uid_of(&created)
    }

    async fn dry_run_upsert(&self, client: &dyn ResourceClient, obj: &RawObj) -> Result<String, ApplyError> {
        let live = match obj.name() {
            Some(name) => client.get(name).await?,
            None => None,
        };
        match live {
            Some(live) => {
                info!(obj = %obj.describe(), "updating (dry-run)");
                uid_of(&live)
            }
            None if self.create => {
                info!(obj = %obj.describe(), "creating (dry-run)");
                Ok(format!("dry-run:{}", obj.describe()))
            }
            None => Err(ApplyError::NotCreatable(obj.describe())),
        }
    }
}

fn uid_of(obj: &RawObj) -> Result<String, ApplyError> {
    obj.uid().map(str::to_string).ok_or_else(|| StoreError::Transport(format!("{} has no uid", obj.describe())).into())
}

/// Two-way merge patch from live to `obj`, carrying `obj`'s resourceVersion
/// as the optimistic-concurrency precondition. `None` when nothing differs.
fn update_patch(obj: &RawObj, live: &RawObj) -> Option<Json> {
    let mut desired = obj.clone();
    desired.set_resource_version(live.resource_version());
    let mut patch = three_way(None, desired.as_value(), live.as_value(), None);
    if patch.is_empty() {
        return None;
    }
    if let Some(rv) = obj.resource_version() {
        let meta = patch.entry("metadata").or_insert_with(|| Json::Object(Default::default()));
        meta["resourceVersion"] = Json::String(rv.to_string());
    }
    Some(Json::Object(patch))
}

#[async_trait::async_trait]
impl Upserter for DefaultUpserter {
    async fn upsert(&self, obj: &RawObj) -> Result<String, ApplyError> {
        let rk = self.catalog.resolve(&obj.gvk()).await?;
        let client = self.factory.client_for(&rk, obj.namespace())?;
        if self.dry_run {
            return self.dry_run_upsert(client.as_ref(), obj).await;
        }
        let Some(name) = obj.name() else {
            return self.create_new(client.as_ref(), obj).await;
        };
        let Some(mut live) = client.get(name).await? else {
            return self.create_new(client.as_ref(), obj).await;
        };

        let mut obj = obj.clone();
        let max = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let Some(patch) = update_patch(&obj, &live) else {
                counter!("apply_unchanged_total", 1u64);
                debug!(obj = %obj.describe(), "unchanged");
                return uid_of(&live);
            };
            debug!(obj = %obj.describe(), attempt, patch = %patch, "updating");
            match client.patch(name, &PatchBody::Merge(patch)).await {
                Ok(updated) => {
                    info!(obj = %updated.describe(), "updated");
                    return uid_of(&updated);
                }
                Err(e) if e.is_not_found() => return self.create_new(client.as_ref(), &obj).await,
                Err(e) if e.is_conflict() => {
                    counter!("apply_conflict_retries_total", 1u64);
                    if attempt >= max {
                        return Err(ApplyError::ApplyConflict { object: obj.describe(), attempts: attempt });
                    }
                    warn!(obj = %obj.describe(), attempt, max, "conflict; retrying");
                    live = match client.get(name).await? {
                        Some(l) => l,
                        None => return self.create_new(client.as_ref(), &obj).await,
                    };
                    obj.set_resource_version(live.resource_version());
                    self.sleeper.sleep(self.policy.backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
