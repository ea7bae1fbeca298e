//! Deleting the declared objects, dependents first.

use std::sync::Arc;

use kfold_core::{DeleteOptions, DeletePropagation};
use metrics::counter;
use serde::Serialize;
use tracing::{debug, info};

use crate::catalog::Catalog;
use crate::config::DeleteConfig;
use crate::error::{ApplyError, Phase};
use crate::order::{DependencyOrderer, KindRanks};
use crate::{Clients, ObjectSource};

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeleteReport {
    pub deleted: Vec<String>,
    /// Declared objects that did not exist.
    pub missing: Vec<String>,
}

pub struct Delete {
    config: DeleteConfig,
    source: Arc<dyn ObjectSource>,
    clients: Clients,
    catalog: Arc<Catalog>,
    ranks: KindRanks,
}

impl Delete {
    pub fn new(config: DeleteConfig, source: Arc<dyn ObjectSource>, clients: Clients) -> Self {
        let catalog = Arc::new(Catalog::new(Arc::clone(&clients.discovery)));
        Self { config, source, clients, catalog, ranks: KindRanks::default() }
    }

    pub async fn run(&self) -> Result<DeleteReport, ApplyError> {
        let mut objs = self.source.objects(&self.config.env, &self.config.components).await?;
        DependencyOrderer::new(&self.ranks).sort(&mut objs);
        objs.reverse();

        let version = self.clients.discovery.server_version().await?;
        let mut opts = DeleteOptions::new(DeletePropagation::for_server(&version));
        opts.grace_period_seconds = self.config.grace_period;
        let suffix = if self.config.dry_run { " (dry-run)" } else { "" };

        let mut report = DeleteReport::default();
        for mut obj in objs {
            let rk = self.catalog.resolve(&obj.gvk()).await.map_err(|e| e.in_phase(Phase::Delete, obj.describe()))?;
            if rk.namespaced && obj.namespace().is_none() {
                obj.set_namespace(&self.clients.namespace);
            }
            let desc = obj.describe();
            let Some(name) = obj.name() else {
                debug!(obj = %desc, "generateName object; nothing to delete");
                continue;
            };
            info!("deleting {desc}{suffix}");
            if self.config.dry_run {
                report.deleted.push(desc);
                continue;
            }
            let client = match self.clients.factory.client_for(&rk, obj.namespace()) {
                Ok(c) => c,
                Err(e) => return Err(ApplyError::from(e).in_phase(Phase::Delete, desc)),
            };
            match client.delete(name, &opts).await {
                Ok(()) => {
                    counter!("delete_objects_total", 1u64);
                    report.deleted.push(desc);
                }
                Err(e) if e.is_not_found() => {
                    debug!(obj = %desc, "already gone");
                    report.missing.push(desc);
                }
                Err(e) => return Err(ApplyError::from(e).in_phase(Phase::Delete, desc)),
            }
        }
        Ok(report)
    }
}
