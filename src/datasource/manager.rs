//! Datasource manager service (`_ds_manager`).
//!
//! Validates and persists datasource records, then drives reconciliation on
//! this node and asks every peer to do the same. The registry is the source
//! of truth; running services are only a cache of it.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use data_connector::{DatasourceId, DatasourceRegistry, RegistryError};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use super::{
    driver::{DriverCatalog, DriverDescriptor},
    record::{DatasourceRecord, DatasourceRequest},
};
use crate::{
    error::{DseError, DseResult},
    logging::mask_secrets,
    node::DseNode,
    policy::ENGINE_SERVICE_ID,
    service::{Service, ServiceBase},
    transport::{arg, opt_arg, Endpoints, RpcContext, RpcEndpoint},
};

pub const DS_MANAGER_SERVICE_ID: &str = "_ds_manager";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DsManagerConfig {
    /// Period of the background reconciliation pass; zero disables it.
    pub resync_interval: Duration,
}

impl Default for DsManagerConfig {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Default)]
struct ResyncLoop {
    shutdown: Option<watch::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

pub struct DsManager {
    base: ServiceBase,
    registry: Arc<dyn DatasourceRegistry>,
    catalog: Arc<DriverCatalog>,
    config: DsManagerConfig,
    resync: Mutex<ResyncLoop>,
}

impl DsManager {
    pub fn new(
        registry: Arc<dyn DatasourceRegistry>,
        catalog: Arc<DriverCatalog>,
        config: DsManagerConfig,
    ) -> Self {
        Self {
            base: ServiceBase::new(DS_MANAGER_SERVICE_ID),
            registry,
            catalog,
            config,
            resync: Mutex::new(ResyncLoop::default()),
        }
    }

    pub fn catalog(&self) -> &Arc<DriverCatalog> {
        &self.catalog
    }

    /// Resolve `modules` and replace the loaded drivers.
    pub fn load_drivers(&self, modules: &[String]) -> DseResult<()> {
        self.catalog.load(modules)
    }

    pub fn get_driver_info(&self, driver: &str) -> DseResult<DriverDescriptor> {
        self.catalog.descriptor(driver)
    }

    pub fn get_drivers_info(&self) -> Vec<DriverDescriptor> {
        self.catalog.descriptors()
    }

    /// Table schema of `driver`, computed on the blocking pool.
    pub async fn get_driver_schema(&self, driver: &str) -> DseResult<Value> {
        let loaded = self
            .catalog
            .get(driver)
            .ok_or_else(|| DseError::DriverNotFound(driver.to_string()))?;
        tokio::task::spawn_blocking(move || loaded.driver.schema())
            .await
            .map_err(|e| DseError::DataServiceError(format!("schema of {driver} failed: {e}")))
    }

    /// Check a normalized record against its driver's declared options.
    pub fn validate_create_datasource(
        &self,
        record: &DatasourceRecord,
    ) -> DseResult<DriverDescriptor> {
        let descriptor = self
            .catalog
            .descriptor(&record.driver)
            .map_err(|_| DseError::InvalidDriver(record.driver.clone()))?;

        let invalid: Vec<&str> = record
            .config
            .keys()
            .map(String::as_str)
            .filter(|k| !descriptor.info.config.contains_key(*k))
            .collect();
        if !invalid.is_empty() {
            return Err(DseError::InvalidDriverOption(invalid.join(", ")));
        }

        let missing: Vec<&str> = descriptor
            .info
            .required_options()
            .filter(|k| !record.config.contains_key(*k))
            .collect();
        if !missing.is_empty() {
            return Err(DseError::MissingRequiredConfigOptions(missing.join(", ")));
        }
        Ok(descriptor)
    }

    fn node(&self) -> DseResult<Arc<DseNode>> {
        self.base.require_node()
    }

    /// Reconcile locally, nudge peers to do the same, then let a colocated
    /// policy engine resynchronize.
    ///
    /// Only a failure of `ds_id` itself is returned. Other records that do
    /// not reconcile on this node are logged and left to later passes.
    async fn synchronize_cluster(
        &self,
        node: &Arc<DseNode>,
        ds_id: &DatasourceId,
    ) -> DseResult<()> {
        let mut report = node.reconcile_datasources().await?;
        let own = report.take_failure(ds_id);
        for other in report.failures() {
            warn!(
                "Datasource {} ({}) is not in sync on this node: {}",
                other.name, other.ds_id, other.error
            );
        }
        if let Some(own) = own {
            return Err(own.error);
        }
        if let Err(e) = node
            .broadcast_node_rpc("synchronize_datasources", json!({}))
            .await
        {
            warn!("Failed to ask peers to synchronize datasources: {}", e);
        }
        let engine = node
            .service_object(ENGINE_SERVICE_ID)
            .and_then(|s| s.as_policy_engine());
        if let Some(engine) = engine {
            engine.synchronize_policies().await?;
        }
        Ok(())
    }

    /// Validate, persist and synchronize a new datasource.
    #[instrument(skip_all, fields(name = %item.name))]
    pub async fn add_datasource(
        &self,
        item: &DatasourceRequest,
        update_db: bool,
    ) -> DseResult<DatasourceRecord> {
        let record = DatasourceRecord::from_request(item)?;
        let descriptor = self.validate_create_datasource(&record)?;
        if record.name.is_empty() || record.name.starts_with('_') {
            return Err(DseError::InvalidDatasourceName(record.name));
        }
        let node = self.node()?;

        debug!(
            "Adding datasource {} with config {:?}",
            record.name,
            mask_secrets(&record.config, &descriptor.info.secret)
        );
        if update_db {
            match self.registry.add_datasource(record.to_row()?).await {
                Ok(_) => {}
                Err(RegistryError::DuplicateName(_)) => {
                    return Err(DseError::DatasourceNameInUse(record.name));
                }
                Err(RegistryError::DuplicateId(id)) => {
                    warn!("Datasource {} reuses existing id {}", record.name, id);
                    return Err(DseError::DatasourceCreationError(format!(
                        "datasource id {id} already exists"
                    )));
                }
                Err(e) => {
                    error!("Creating a new datasource failed: {}", e);
                    return Err(DseError::DatasourceCreationError(record.name));
                }
            }
        }

        match self.synchronize_cluster(&node, &record.ds_id()).await {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => {
                debug!(
                    "Datasource service {} already created on this node",
                    record.name
                );
            }
            Err(e) => {
                error!(
                    "Unexpected error while registering new datasource {}: {}",
                    record.name, e
                );
                if update_db {
                    if let Err(cleanup) = self
                        .registry
                        .delete_datasource_with_data(&record.ds_id())
                        .await
                    {
                        error!(
                            "Failed to remove datasource {} after creation failure: {}",
                            record.id, cleanup
                        );
                    }
                    // Drop the half-created service, if any.
                    match node.reconcile_datasources().await {
                        Ok(mut report) => {
                            if let Some(failure) = report.take_failure(&record.ds_id()) {
                                warn!("Cleanup synchronization failed: {}", failure.error);
                            }
                        }
                        Err(e) => warn!("Cleanup synchronization failed: {}", e),
                    }
                }
                return Err(DseError::DatasourceCreationError(format!(
                    "Datasource service: {} creation fails.",
                    record.name
                )));
            }
        }

        info!("Datasource {} ({}) created", record.name, record.id);
        Ok(record)
    }

    /// Delete a datasource and its table data, then synchronize. The delete
    /// is committed once the registry accepted it.
    #[instrument(skip(self))]
    pub async fn delete_datasource(&self, ds_id: &DatasourceId, update_db: bool) -> DseResult<()> {
        let node = self.node()?;
        if update_db {
            let deleted = self
                .registry
                .delete_datasource_with_data(ds_id)
                .await
                .map_err(|e| DseError::DataServiceError(e.to_string()))?;
            if !deleted {
                return Err(DseError::DatasourceNotFound(ds_id.to_string()));
            }
        }

        if let Err(e) = self.synchronize_cluster(&node, ds_id).await {
            let msg = format!("failed to synchronize_datasource after deleting datasource: {ds_id}");
            error!("{}: {}", msg, e);
            return Err(DseError::DataServiceError(msg));
        }
        info!("Datasource {} deleted", ds_id);
        Ok(())
    }

    fn filter_secrets(&self, record: &mut DatasourceRecord) {
        match self.catalog.get(&record.driver) {
            Some(loaded) => record.redact(&loaded.descriptor.info.secret),
            None => record.redact_all(),
        }
    }

    pub async fn get_datasource(
        &self,
        ds_id: &DatasourceId,
        filter_secret: bool,
    ) -> DseResult<DatasourceRecord> {
        let row = self
            .registry
            .get_datasource(ds_id)
            .await
            .map_err(|e| DseError::DataServiceError(e.to_string()))?
            .ok_or_else(|| DseError::DatasourceNotFound(ds_id.to_string()))?;
        let mut record = DatasourceRecord::from_row(&row)?;
        if filter_secret {
            self.filter_secrets(&mut record);
        }
        Ok(record)
    }

    /// Every persisted record, whether or not this node runs it.
    pub async fn get_datasources(&self, filter_secret: bool) -> DseResult<Vec<DatasourceRecord>> {
        let rows = self
            .registry
            .get_datasources()
            .await
            .map_err(|e| DseError::DataServiceError(e.to_string()))?;
        rows.iter()
            .map(|row| {
                let mut record = DatasourceRecord::from_row(row)?;
                if filter_secret {
                    self.filter_secrets(&mut record);
                }
                Ok(record)
            })
            .collect()
    }

    /// Remove every record whose driver is no longer loaded. Returns the
    /// number of records removed.
    pub async fn delete_missing_driver_datasources(&self) -> DseResult<usize> {
        let rows = self
            .registry
            .get_datasources()
            .await
            .map_err(|e| DseError::DataServiceError(e.to_string()))?;

        let mut removed = 0;
        for row in rows {
            if self.catalog.get(&row.driver).is_some() {
                continue;
            }
            match self.delete_datasource(&row.id, true).await {
                Ok(()) => removed += 1,
                Err(DseError::DatasourceNotFound(_)) => {}
                Err(e @ DseError::DataServiceError(_)) => {
                    // Row is gone; only the follow-up synchronization failed.
                    warn!("{}", e);
                    removed += 1;
                }
                Err(e) => return Err(e),
            }
            debug!(
                "Deleted datasource {} with missing driver {}",
                row.name, row.driver
            );
        }
        info!(
            "Datasource cleanup completed, removed {} datasources",
            removed
        );
        Ok(removed)
    }

    async fn resync_loop(
        node: std::sync::Weak<DseNode>,
        period: Duration,
        mut signal: watch::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = signal.changed() => break,
                _ = ticker.tick() => {
                    let Some(node) = node.upgrade() else { break };
                    if let Err(e) = node.synchronize_datasources().await {
                        warn!("Periodic datasource synchronization failed: {}", e);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Service for DsManager {
    fn base(&self) -> &ServiceBase {
        &self.base
    }

    fn rpc_endpoints(self: Arc<Self>) -> Endpoints {
        vec![self]
    }

    async fn start(&self) -> DseResult<()> {
        if self.config.resync_interval.is_zero() {
            return Ok(());
        }
        let node = self.node()?;
        let mut resync = self.resync.lock();
        if resync.handle.is_none() {
            let (tx, rx) = watch::channel(());
            resync.handle = Some(tokio::spawn(Self::resync_loop(
                Arc::downgrade(&node),
                self.config.resync_interval,
                rx,
            )));
            resync.shutdown = Some(tx);
        }
        Ok(())
    }

    async fn stop(&self) -> DseResult<()> {
        if let Some(tx) = self.resync.lock().shutdown.take() {
            let _ = tx.send(());
        }
        Ok(())
    }

    async fn wait(&self) {
        let handle = self.resync.lock().handle.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Resync loop panicked: {}", e);
            }
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> DseResult<Value> {
    serde_json::to_value(value).map_err(|e| DseError::DataServiceError(e.to_string()))
}

#[async_trait]
impl RpcEndpoint for DsManager {
    fn handles(&self, method: &str) -> bool {
        matches!(
            method,
            "add_datasource"
                | "delete_datasource"
                | "get_datasource"
                | "get_datasources"
                | "get_driver_info"
                | "get_drivers_info"
                | "get_driver_schema"
        )
    }

    async fn dispatch(&self, _ctx: &RpcContext, method: &str, args: Value) -> DseResult<Value> {
        match method {
            "add_datasource" => {
                let item: DatasourceRequest = arg(&args, "item")?;
                let update_db = opt_arg(&args, "update_db")?.unwrap_or(true);
                to_json(&self.add_datasource(&item, update_db).await?)
            }
            "delete_datasource" => {
                let ds_id: String = arg(&args, "ds_id")?;
                let update_db = opt_arg(&args, "update_db")?.unwrap_or(true);
                self.delete_datasource(&DatasourceId(ds_id), update_db).await?;
                Ok(Value::Null)
            }
            "get_datasource" => {
                let ds_id: String = arg(&args, "ds_id")?;
                let filter_secret = opt_arg(&args, "filter_secret")?.unwrap_or(false);
                to_json(&self.get_datasource(&DatasourceId(ds_id), filter_secret).await?)
            }
            "get_datasources" => {
                let filter_secret = opt_arg(&args, "filter_secret")?.unwrap_or(false);
                to_json(&self.get_datasources(filter_secret).await?)
            }
            "get_driver_info" => {
                let driver: String = arg(&args, "driver")?;
                to_json(&self.get_driver_info(&driver)?)
            }
            "get_drivers_info" => to_json(&self.get_drivers_info()),
            "get_driver_schema" => {
                let driver: String = arg(&args, "driver")?;
                self.get_driver_schema(&driver).await
            }
            other => Err(DseError::UnsupportedMethod(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use data_connector::MemoryDatasourceRegistry;

    use super::*;
    use crate::{
        datasource::DriverTable,
        drivers::{self, fake::FAKE_DRIVER_ID},
    };

    fn manager() -> (Arc<MemoryDatasourceRegistry>, DsManager) {
        let registry = Arc::new(MemoryDatasourceRegistry::new());
        let catalog = Arc::new(DriverCatalog::new(DriverTable::builtin()));
        let manager = DsManager::new(registry.clone(), catalog, DsManagerConfig::default());
        manager.load_drivers(&drivers::builtin_modules()).unwrap();
        (registry, manager)
    }

    fn fake_request(config: &[(&str, &str)]) -> DatasourceRequest {
        DatasourceRequest::new("glance", FAKE_DRIVER_ID).with_config(config.iter().copied())
    }

    const CREDENTIALS: &[(&str, &str)] = &[
        ("auth_url", "http://keystone"),
        ("username", "admin"),
        ("password", "pw"),
        ("tenant_name", "demo"),
    ];

    #[test]
    fn validation_checks_driver_then_unknown_then_missing() {
        let (_, manager) = manager();

        let record = DatasourceRecord::from_request(&DatasourceRequest::new("x", "nope")).unwrap();
        assert!(matches!(
            manager.validate_create_datasource(&record),
            Err(DseError::InvalidDriver(d)) if d == "nope"
        ));

        let record =
            DatasourceRecord::from_request(&fake_request(&[("bogus", "1"), ("zzz", "2")])).unwrap();
        assert!(matches!(
            manager.validate_create_datasource(&record),
            Err(DseError::InvalidDriverOption(o)) if o == "bogus, zzz"
        ));

        let record = DatasourceRecord::from_request(&fake_request(&[("username", "u")])).unwrap();
        assert!(matches!(
            manager.validate_create_datasource(&record),
            Err(DseError::MissingRequiredConfigOptions(o))
                if o == "auth_url, password, tenant_name"
        ));

        let record = DatasourceRecord::from_request(&fake_request(CREDENTIALS)).unwrap();
        let descriptor = manager.validate_create_datasource(&record).unwrap();
        assert_eq!(descriptor.module, drivers::FAKE_DRIVER_MODULE);
    }

    #[tokio::test]
    async fn driver_info_and_schema() {
        let (_, manager) = manager();
        assert_eq!(manager.get_drivers_info().len(), 2);
        let info = manager.get_driver_info(FAKE_DRIVER_ID).unwrap();
        assert_eq!(info.info.secret, vec!["password".to_string()]);

        let schema = manager.get_driver_schema(FAKE_DRIVER_ID).await.unwrap();
        assert!(schema["images"].is_array());
        assert!(matches!(
            manager.get_driver_schema("missing").await,
            Err(DseError::DriverNotFound(_))
        ));
    }

    #[tokio::test]
    async fn add_requires_a_node() {
        let (registry, manager) = manager();
        let err = manager
            .add_datasource(&fake_request(CREDENTIALS), true)
            .await
            .unwrap_err();
        assert!(matches!(err, DseError::Lifecycle(_)), "{err}");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn cleanup_without_orphans_removes_nothing() {
        let (_, manager) = manager();
        assert_eq!(manager.delete_missing_driver_datasources().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rpc_rejects_unknown_methods_and_bad_arguments() {
        let (_, manager) = manager();
        let ctx = RpcContext {
            node_id: "n1".into(),
            instance: "i".into(),
        };
        assert!(!manager.handles("drop_everything"));
        assert!(matches!(
            manager.dispatch(&ctx, "get_driver_info", json!({})).await,
            Err(DseError::InvalidArguments(_))
        ));
        let drivers = manager
            .dispatch(&ctx, "get_drivers_info", json!({}))
            .await
            .unwrap();
        assert_eq!(drivers.as_array().map(Vec::len), Some(2));
    }
}
