//! Per-run cache of discovery: served kinds and the patch schema.

use std::sync::Arc;

use kfold_core::{Discovery, Gvk, ResourceKind, StoreError};
use kfold_schema::{NoPatchMeta, PatchMeta, SchemaIndex};
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, warn};

use crate::error::ApplyError;

/// Why a kind is patched with a JSON merge patch instead of a strategic one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    /// The server publishes no OpenAPI document.
    SchemaNotPublished,
    /// Fetching or indexing the document failed.
    SchemaUnavailable,
    /// The document has no definition for this kind.
    KindNotInSchema,
    /// Strategic merge is not supported for custom resources.
    CustomResource,
}

impl FallbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackReason::SchemaNotPublished => "schema-not-published",
            FallbackReason::SchemaUnavailable => "schema-unavailable",
            FallbackReason::KindNotInSchema => "kind-not-in-schema",
            FallbackReason::CustomResource => "custom-resource",
        }
    }
}

#[derive(Debug, Clone)]
pub enum PatchStrategy {
    Strategic { meta: PatchMeta },
    JsonMerge { reason: FallbackReason },
}

impl PatchStrategy {
    pub fn meta(&self) -> Option<&PatchMeta> {
        match self {
            PatchStrategy::Strategic { meta } => Some(meta),
            PatchStrategy::JsonMerge { .. } => None,
        }
    }
}

impl std::fmt::Display for PatchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatchStrategy::Strategic { .. } => f.write_str("strategic"),
            PatchStrategy::JsonMerge { reason } => write!(f, "json-merge ({})", reason.as_str()),
        }
    }
}

enum SchemaState {
    Ready(SchemaIndex),
    Missing(FallbackReason),
}

pub struct Catalog {
    discovery: Arc<dyn Discovery>,
    resources: RwLock<Option<Arc<Vec<ResourceKind>>>>,
    schema: OnceCell<SchemaState>,
}

impl Catalog {
    pub fn new(discovery: Arc<dyn Discovery>) -> Self {
        Self { discovery, resources: RwLock::new(None), schema: OnceCell::new() }
    }

    pub fn discovery(&self) -> &Arc<dyn Discovery> {
        &self.discovery
    }

    /// Served kinds, fetched on first use.
    pub async fn resources(&self) -> Result<Arc<Vec<ResourceKind>>, StoreError> {
        if let Some(r) = self.resources.read().await.as_ref() {
            return Ok(Arc::clone(r));
        }
        self.refresh().await
    }

    pub async fn refresh(&self) -> Result<Arc<Vec<ResourceKind>>, StoreError> {
        let fresh = Arc::new(self.discovery.resources().await?);
        debug!(kinds = fresh.len(), "resource catalog loaded");
        *self.resources.write().await = Some(Arc::clone(&fresh));
        Ok(fresh)
    }

    /// Resolve a kind, refreshing once when the cached list does not have it
    /// (a CRD applied earlier in the run).
    pub async fn resolve(&self, gvk: &Gvk) -> Result<ResourceKind, ApplyError> {
        if let Some(rk) = self.resources().await?.iter().find(|r| r.matches(gvk)) {
            return Ok(rk.clone());
        }
        debug!(gvk = %gvk, "kind not in catalog; refreshing");
        self.refresh()
            .await?
            .iter()
            .find(|r| r.matches(gvk))
            .cloned()
            .ok_or_else(|| ApplyError::UnknownKind(gvk.key()))
    }

    async fn schema(&self) -> &SchemaState {
        self.schema
            .get_or_init(|| async {
                match self.discovery.openapi_v2().await {
                    Ok(Some(doc)) => match SchemaIndex::from_openapi_v2(&doc) {
                        Ok(idx) => SchemaState::Ready(idx),
                        Err(e) => {
                            warn!(error = %e, "openapi document unusable; falling back to json merge patches");
                            SchemaState::Missing(FallbackReason::SchemaUnavailable)
                        }
                    },
                    Ok(None) => SchemaState::Missing(FallbackReason::SchemaNotPublished),
                    Err(e) => {
                        warn!(error = %e, "openapi fetch failed; falling back to json merge patches");
                        SchemaState::Missing(FallbackReason::SchemaUnavailable)
                    }
                }
            })
            .await
    }

    pub async fn patch_strategy(&self, gvk: &Gvk) -> PatchStrategy {
        match self.schema().await {
            SchemaState::Missing(reason) => PatchStrategy::JsonMerge { reason: *reason },
            SchemaState::Ready(idx) => match idx.lookup(gvk) {
                Ok(meta) => PatchStrategy::Strategic { meta },
                Err(NoPatchMeta::NotPublished) => PatchStrategy::JsonMerge { reason: FallbackReason::KindNotInSchema },
                Err(NoPatchMeta::CustomResource) => PatchStrategy::JsonMerge { reason: FallbackReason::CustomResource },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kfold_store::{resource, MemStore};

    #[tokio::test]
    async fn resolve_refreshes_once_on_miss() {
        let store = MemStore::new();
        let catalog = Catalog::new(Arc::new(store.clone()));
        assert!(catalog.resolve(&Gvk::new("", "v1", "ConfigMap")).await.is_ok());
        assert_eq!(store.discovery_calls(), 1);

        store.serve(resource("example.com", "v1", "Widget", "widgets", true));
        let w = catalog.resolve(&Gvk::new("example.com", "v1", "Widget")).await.unwrap();
        assert!(w.namespaced);
        assert_eq!(store.discovery_calls(), 2);

        let err = catalog.resolve(&Gvk::new("example.com", "v2", "Widget")).await.unwrap_err();
        assert!(matches!(err, ApplyError::UnknownKind(k) if k == "example.com/v2/Widget"));
        assert_eq!(store.discovery_calls(), 3);
    }

    #[tokio::test]
    async fn resolves_versions_served_next_to_the_preferred_one() {
        let store = MemStore::new();
        let catalog = Catalog::new(Arc::new(store.clone()));
        let v1 = catalog.resolve(&Gvk::new("autoscaling", "v1", "HorizontalPodAutoscaler")).await.unwrap();
        let v2 = catalog.resolve(&Gvk::new("autoscaling", "v2", "HorizontalPodAutoscaler")).await.unwrap();
        assert!(!v1.preferred);
        assert!(v2.preferred);
        assert_eq!(store.discovery_calls(), 1);
    }

    #[tokio::test]
    async fn strategy_falls_back_with_a_reason() {
        let unpublished = Catalog::new(Arc::new(MemStore::new()));
        assert!(matches!(
            unpublished.patch_strategy(&Gvk::new("apps", "v1", "Deployment")).await,
            PatchStrategy::JsonMerge { reason: FallbackReason::SchemaNotPublished }
        ));
        let broken = Catalog::new(Arc::new(MemStore::new().with_broken_openapi()));
        assert!(matches!(
            broken.patch_strategy(&Gvk::new("apps", "v1", "Deployment")).await,
            PatchStrategy::JsonMerge { reason: FallbackReason::SchemaUnavailable }
        ));
    }
}
