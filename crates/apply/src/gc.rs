//! Tag-scoped garbage collection of objects no longer declared.

use std::collections::BTreeSet;
use std::sync::Arc;

use kfold_core::annotations::{GcStrategy, GC_STRATEGY, GC_TAG};
use kfold_core::{DeleteOptions, DeletePropagation, RawObj, ResourceClientFactory};
use metrics::counter;
use serde::Serialize;
use tracing::{debug, info};

use crate::catalog::Catalog;
use crate::error::ApplyError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GcDecision {
    Delete,
    /// Its controller prunes it.
    ControllerOwned,
    /// Tagged for another run, or not tagged at all.
    ForeignTag,
    /// Strategy annotation is `ignore` or unrecognised.
    Retained,
    /// Produced by the current run.
    Seen,
}

pub fn gc_decision(obj: &RawObj, tag: &str, seen: &BTreeSet<String>) -> GcDecision {
    if obj.has_controller_owner() {
        return GcDecision::ControllerOwned;
    }
    if obj.annotation(GC_TAG) != Some(tag) {
        return GcDecision::ForeignTag;
    }
    if GcStrategy::from_annotation(obj.annotation(GC_STRATEGY)) != GcStrategy::Auto {
        return GcDecision::Retained;
    }
    if obj.uid().is_some_and(|u| seen.contains(u)) {
        return GcDecision::Seen;
    }
    GcDecision::Delete
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GcReport {
    pub considered: usize,
    pub deleted: Vec<String>,
}

pub struct GarbageCollector {
    catalog: Arc<Catalog>,
    factory: Arc<dyn ResourceClientFactory>,
    dry_run: bool,
}

impl GarbageCollector {
    pub fn new(catalog: Arc<Catalog>, factory: Arc<dyn ResourceClientFactory>, dry_run: bool) -> Self {
        Self { catalog, factory, dry_run }
    }

    pub async fn run(&self, tag: &str, seen: &BTreeSet<String>) -> Result<GcReport, ApplyError> {
        let version = self.catalog.discovery().server_version().await?;
        let propagation = DeletePropagation::for_server(&version);
        // kinds created during the run must be visited too
        let resources = self.catalog.refresh().await?;
        let mut report = GcReport::default();
        let mut deleted_uids = BTreeSet::new();

        // every version lists the same objects
        for rk in resources.iter().filter(|r| r.preferred && r.supports("list")) {
            let objs = self.factory.client_for(rk, None)?.list().await?;
            for obj in objs {
                report.considered += 1;
                counter!("gc_considered_total", 1u64);
                let decision = gc_decision(&obj, tag, seen);
                if decision != GcDecision::Delete {
                    debug!(obj = %obj.describe(), ?decision, "gc skip");
                    continue;
                }
                let (Some(uid), Some(name)) = (obj.uid(), obj.name()) else { continue };
                // one object can be listed under several group/versions
                if !deleted_uids.insert(uid.to_string()) {
                    continue;
                }
                if self.dry_run {
                    info!(obj = %obj.describe(), "garbage collecting (dry-run)");
                    report.deleted.push(obj.describe());
                    continue;
                }
                info!(obj = %obj.describe(), "garbage collecting");
                let mut opts = DeleteOptions::new(propagation);
                opts.precondition_uid = Some(uid.to_string());
                let client = self.factory.client_for(rk, obj.namespace())?;
                match client.delete(name, &opts).await {
                    Ok(()) => {
                        counter!("gc_deleted_total", 1u64);
                        report.deleted.push(obj.describe());
                    }
                    Err(e) if e.is_not_found() || e.is_conflict() => {
                        debug!(obj = %obj.describe(), error = %e, "already gone or replaced");
                    }
                    Err(source) => return Err(ApplyError::GcDelete { object: obj.describe(), source }),
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(annotations: serde_json::Value, controller: bool) -> RawObj {
        RawObj::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "x",
                "namespace": "ns",
                "uid": "u-1",
                "annotations": annotations,
                "ownerReferences": [ { "kind": "Deployment", "name": "d", "controller": controller } ]
            }
        }))
        .unwrap()
    }

    #[test]
    fn eligibility() {
        let none = BTreeSet::new();
        assert_eq!(gc_decision(&obj(json!({ GC_TAG: "rel-7" }), false), "rel-7", &none), GcDecision::Delete);
        assert_eq!(gc_decision(&obj(json!({ GC_TAG: "rel-7" }), true), "rel-7", &none), GcDecision::ControllerOwned);
        assert_eq!(gc_decision(&obj(json!({ GC_TAG: "rel-7", GC_STRATEGY: "ignore" }), false), "rel-7", &none), GcDecision::Retained);
        assert_eq!(gc_decision(&obj(json!({ GC_TAG: "rel-7", GC_STRATEGY: "sometimes" }), false), "rel-7", &none), GcDecision::Retained);
        assert_eq!(gc_decision(&obj(json!({ GC_TAG: "rel-7", GC_STRATEGY: "auto" }), false), "rel-7", &none), GcDecision::Delete);
        assert_eq!(gc_decision(&obj(json!({ GC_TAG: "rel-6" }), false), "rel-7", &none), GcDecision::ForeignTag);
        assert_eq!(gc_decision(&obj(json!({}), false), "rel-7", &none), GcDecision::ForeignTag);
        let seen: BTreeSet<String> = ["u-1".to_string()].into();
        assert_eq!(gc_decision(&obj(json!({ GC_TAG: "rel-7" }), false), "rel-7", &seen), GcDecision::Seen);
    }
}
