//! Three-way merge of desired, last-applied and live state.

use std::sync::Arc;

use kfold_core::{PatchBody, RawObj, ResourceClientFactory};
use kfold_schema::three_way;
use serde_json::{Map, Value as Json};
use tracing::{debug, info};

use crate::catalog::{Catalog, PatchStrategy};
use crate::codec;
use crate::error::ApplyError;

#[async_trait::async_trait]
pub trait ObjectMerger: Send + Sync {
    /// Bring the live object in line with `desired` and return the result.
    /// When there is no live object yet, `desired` comes back unchanged.
    async fn merge(&self, namespace: Option<&str>, desired: &RawObj) -> Result<RawObj, ApplyError>;
}

pub struct DefaultMerger {
    catalog: Arc<Catalog>,
    factory: Arc<dyn ResourceClientFactory>,
    dry_run: bool,
}

impl DefaultMerger {
    pub fn new(catalog: Arc<Catalog>, factory: Arc<dyn ResourceClientFactory>, dry_run: bool) -> Self {
        Self { catalog, factory, dry_run }
    }
}

/// Identity fields a JSON merge patch may not touch.
fn identity<'a>(v: &'a Json, field: &str) -> Option<&'a Json> {
    match field {
        "metadata.name" => v.get("metadata").and_then(|m| m.get("name")),
        other => v.get(other),
    }
}

/// A JSON merge patch cannot express a rename or a kind change; refuse those
/// instead of producing a patch that rewrites another object.
pub fn check_merge_preconditions(original: Option<&Json>, modified: &Json, patch: &Map<String, Json>) -> Result<(), ApplyError> {
    let patch = Json::Object(patch.clone());
    for field in ["apiVersion", "kind", "metadata.name"] {
        if let Some(orig) = original {
            if identity(orig, field) != identity(modified, field) {
                return Err(ApplyError::MergePrecondition(field));
            }
        }
        if identity(&patch, field).is_some() {
            return Err(ApplyError::MergePrecondition(field));
        }
    }
    Ok(())
}

#[async_trait::async_trait]
impl ObjectMerger for DefaultMerger {
    async fn merge(&self, namespace: Option<&str>, desired: &RawObj) -> Result<RawObj, ApplyError> {
        let Some(name) = desired.name() else {
            // generateName objects are always new
            return Ok(desired.clone());
        };
        let rk = self.catalog.resolve(&desired.gvk()).await?;
        let client = self.factory.client_for(&rk, namespace)?;
        let Some(live) = client.get(name).await? else {
            debug!(obj = %desired.describe(), "not found; nothing to merge");
            return Ok(desired.clone());
        };

        let original = codec::pristine_of(&live)?;
        let strategy = self.catalog.patch_strategy(&rk.gvk()).await;
        debug!(obj = %desired.describe(), strategy = %strategy, "patch strategy");
        let patch = three_way(original.as_ref(), desired.as_value(), live.as_value(), strategy.meta());
        if let PatchStrategy::JsonMerge { .. } = strategy {
            check_merge_preconditions(original.as_ref(), desired.as_value(), &patch)?;
        }
        if patch.is_empty() {
            debug!(obj = %desired.describe(), "live object already matches");
            return Ok(live);
        }

        let body = match &strategy {
            PatchStrategy::Strategic { .. } => PatchBody::Strategic(Json::Object(patch)),
            PatchStrategy::JsonMerge { .. } => PatchBody::Merge(Json::Object(patch)),
        };
        debug!(obj = %desired.describe(), patch = %body.value(), "merge patch");
        if self.dry_run {
            info!(obj = %desired.describe(), "patching (dry-run)");
            let mut merged = live.into_value();
            kfold_schema::apply_patch(&mut merged, &body, strategy.meta());
            return Ok(RawObj::from_value(merged)?);
        }
        match client.patch(name, &body).await {
            Ok(merged) => Ok(merged),
            Err(e) if e.is_not_found() => {
                debug!(obj = %desired.describe(), "deleted while merging");
                Ok(desired.clone())
            }
            Err(e) => Err(ApplyError::Merge(e.to_string())),
        }
    }
}
