//! Reconciliation of a node's datasource services with the registry.

use std::{collections::BTreeMap, sync::Arc};

use data_connector::DatasourceId;
use tracing::{debug, info, instrument, warn};

use super::{record::DatasourceRecord, service::DataSourceService};
use crate::{
    error::{DseError, DseResult},
    node::{DatasourceContext, DseNode},
};

/// One datasource that reconciliation could not bring in line.
#[derive(Debug)]
pub struct SyncFailure {
    pub ds_id: DatasourceId,
    pub name: String,
    pub error: DseError,
}

/// Per record outcome of one reconciliation pass.
#[derive(Debug, Default)]
pub struct SyncReport {
    failures: Vec<SyncFailure>,
}

impl SyncReport {
    fn fail(&mut self, ds_id: DatasourceId, name: &str, error: DseError) {
        self.failures.push(SyncFailure {
            ds_id,
            name: name.to_string(),
            error,
        });
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failures(&self) -> &[SyncFailure] {
        &self.failures
    }

    /// Split off the failure for `ds_id`, leaving the others in the report.
    pub fn take_failure(&mut self, ds_id: &DatasourceId) -> Option<SyncFailure> {
        let pos = self.failures.iter().position(|f| &f.ds_id == ds_id)?;
        Some(self.failures.remove(pos))
    }

    /// Fold every failure into one `DataServiceError`.
    pub fn into_result(self) -> DseResult<()> {
        if self.failures.is_empty() {
            return Ok(());
        }
        let detail: Vec<String> = self
            .failures
            .iter()
            .map(|f| format!("{}: {}", f.name, f.error.detail()))
            .collect();
        Err(DseError::DataServiceError(format!(
            "datasource synchronization failed for {}",
            detail.join("; ")
        )))
    }
}

/// Bring the node's datasource services in line with the registry.
///
/// Desired state is every enabled record whose driver is loaded. Services
/// for anything else, or whose datasource id changed under the same name,
/// are stopped and detached; missing ones are created and attached. Per
/// record failures do not stop the pass; they come back in the report.
/// Only a registry read failure fails the whole call.
///
/// Callers serialize invocations per node.
#[instrument(skip_all, fields(node_id = %node.node_id()))]
pub(crate) async fn synchronize(
    node: &Arc<DseNode>,
    ctx: &DatasourceContext,
) -> DseResult<SyncReport> {
    let rows = ctx.registry.get_datasources().await.map_err(|e| {
        DseError::DataServiceError(format!("failed to read datasources from registry: {e}"))
    })?;

    let mut report = SyncReport::default();
    let mut desired: BTreeMap<String, DatasourceRecord> = BTreeMap::new();
    for row in &rows {
        if !row.enabled {
            continue;
        }
        if ctx.catalog.get(&row.driver).is_none() {
            debug!(
                "Skipping datasource {}: driver {} not loaded",
                row.name, row.driver
            );
            continue;
        }
        match DatasourceRecord::from_row(row) {
            Ok(record) => {
                desired.insert(record.name.clone(), record);
            }
            Err(e) => report.fail(row.id.clone(), &row.name, e),
        }
    }

    let mut running = BTreeMap::new();
    for (name, ds_id) in node.datasource_services() {
        let keep = desired.get(&name).is_some_and(|r| r.ds_id() == ds_id);
        if keep {
            running.insert(name, ds_id);
            continue;
        }
        info!("Removing datasource service {} ({})", name, ds_id);
        if let Err(e) = node.detach_service(&name).await {
            warn!("Failed to stop datasource service {}: {}", name, e);
            report.fail(ds_id, &name, e);
        }
    }

    for (name, record) in &desired {
        if running.contains_key(name) {
            continue;
        }
        let created = DataSourceService::from_record(record, &ctx.catalog, ctx.registry.clone());
        let service = match created {
            Ok(Some(service)) => service,
            Ok(None) => continue,
            Err(e) => {
                warn!("Failed to create datasource service {}: {}", name, e);
                report.fail(record.ds_id(), name, e);
                continue;
            }
        };
        match node.attach_datasource_service(service).await {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => {
                debug!("Service {} already exists on this node", name);
            }
            Err(e) => {
                warn!("Failed to attach datasource service {}: {}", name, e);
                report.fail(record.ds_id(), name, e);
            }
        }
    }

    Ok(report)
}
