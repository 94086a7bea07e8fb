//! Driver-backed datasource service.
//!
//! Wraps one driver instance, polls it on `poll_time` and keeps the last
//! snapshot of every table. Snapshots are also written to the registry so
//! another node can serve them after a failover.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use data_connector::{ConfigMap, DatasourceId, DatasourceRegistry, TableDataRow};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::{
    sync::{watch, Notify},
    task::JoinHandle,
};
use tracing::{debug, info, warn, Instrument};

use super::{
    driver::{DataSourceDriver, DriverCatalog, TableSnapshot},
    record::DatasourceRecord,
};
use crate::{
    error::{DseError, DseResult},
    logging::mask_secrets,
    service::{Service, ServiceBase},
    transport::{arg, Endpoints, RpcContext, RpcEndpoint},
};

pub const DEFAULT_POLL_TIME: Duration = Duration::from_secs(10);

#[derive(Default)]
struct PollState {
    tables: RwLock<TableSnapshot>,
    last_updated: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
    polls: AtomicU64,
    refresh: Notify,
}

#[derive(Default)]
struct PollLoop {
    shutdown: Option<watch::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

pub struct DataSourceService {
    base: ServiceBase,
    ds_id: DatasourceId,
    driver_id: String,
    driver: Arc<dyn DataSourceDriver>,
    registry: Arc<dyn DatasourceRegistry>,
    poll_time: Duration,
    state: Arc<PollState>,
    poller: Mutex<PollLoop>,
}

impl DataSourceService {
    pub fn new(
        record: &DatasourceRecord,
        driver: Arc<dyn DataSourceDriver>,
        registry: Arc<dyn DatasourceRegistry>,
    ) -> Self {
        let poll_time = record
            .config
            .get("poll_time")
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_POLL_TIME);
        Self {
            base: ServiceBase::new(record.name.clone()),
            ds_id: record.ds_id(),
            driver_id: record.driver.clone(),
            driver,
            registry,
            poll_time,
            state: Arc::new(PollState::default()),
            poller: Mutex::new(PollLoop::default()),
        }
    }

    /// Instantiate the service for `record` through its driver. Disabled
    /// records yield `None`.
    pub fn from_record(
        record: &DatasourceRecord,
        catalog: &DriverCatalog,
        registry: Arc<dyn DatasourceRegistry>,
    ) -> DseResult<Option<Arc<Self>>> {
        if !record.enabled {
            info!("Datasource {} not enabled, skip loading", record.name);
            return Ok(None);
        }
        let loaded = catalog
            .get(&record.driver)
            .ok_or_else(|| DseError::DriverNotFound(record.driver.clone()))?;

        let mut args: ConfigMap = record.config.clone();
        args.insert("ds_id".to_string(), record.id.clone());
        info!(
            "Creating service {} with driver {} and args {:?}",
            record.name,
            loaded.descriptor.module,
            mask_secrets(&args, &loaded.descriptor.info.secret)
        );

        let driver = loaded.driver.create(&record.name, &args).map_err(|e| {
            DseError::DataServiceError(format!(
                "Error loading instance of module '{}': {}",
                loaded.descriptor.module,
                e.detail()
            ))
        })?;
        Ok(Some(Arc::new(Self::new(record, driver, registry))))
    }

    pub fn ds_id(&self) -> &DatasourceId {
        &self.ds_id
    }

    pub fn driver_id(&self) -> &str {
        &self.driver_id
    }

    pub fn poll_time(&self) -> Duration {
        self.poll_time
    }

    pub fn tables(&self) -> TableSnapshot {
        self.state.tables.read().clone()
    }

    pub fn request_refresh(&self) {
        self.state.refresh.notify_one();
    }

    pub fn status(&self) -> Value {
        let tables: Vec<String> = self.state.tables.read().keys().cloned().collect();
        json!({
            "ds_id": self.ds_id.0,
            "driver": self.driver_id,
            "initialized": self.state.polls.load(Ordering::SeqCst) > 0,
            "number_of_updates": self.state.polls.load(Ordering::SeqCst),
            "last_updated": *self.state.last_updated.read(),
            "last_error": *self.state.last_error.read(),
            "tables": tables,
        })
    }

    async fn poll_once(
        name: &str,
        ds_id: &DatasourceId,
        driver: &Arc<dyn DataSourceDriver>,
        registry: &Arc<dyn DatasourceRegistry>,
        state: &PollState,
    ) {
        let snapshot = match driver.update_from_datasource().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Datasource {} poll failed: {}", name, e);
                *state.last_error.write() = Some(e.to_string());
                return;
            }
        };

        for (table, rows) in &snapshot {
            let data = match serde_json::to_string(rows) {
                Ok(data) => data,
                Err(e) => {
                    warn!("Datasource {} table {} not serializable: {}", name, table, e);
                    continue;
                }
            };
            let row = TableDataRow {
                ds_id: ds_id.clone(),
                table_name: table.clone(),
                data,
            };
            if let Err(e) = registry.replace_table_data(row).await {
                warn!(
                    "Failed to persist table {} of datasource {}: {}",
                    table, name, e
                );
            }
        }

        *state.tables.write() = snapshot;
        *state.last_updated.write() = Some(Utc::now());
        *state.last_error.write() = None;
        state.polls.fetch_add(1, Ordering::SeqCst);
        debug!("Datasource {} updated", name);
    }
}

#[async_trait]
impl Service for DataSourceService {
    fn base(&self) -> &ServiceBase {
        &self.base
    }

    fn rpc_endpoints(self: Arc<Self>) -> Endpoints {
        vec![self]
    }

    async fn start(&self) -> DseResult<()> {
        let mut poller = self.poller.lock();
        if poller.handle.is_some() {
            return Ok(());
        }
        let (tx, mut rx) = watch::channel(());
        let name = self.service_id().to_string();
        let ds_id = self.ds_id.clone();
        let driver = self.driver.clone();
        let registry = self.registry.clone();
        let state = self.state.clone();
        let poll_time = self.poll_time;
        let span = tracing::info_span!("datasource", name = %name);

        poller.handle = Some(tokio::spawn(
            async move {
                loop {
                    Self::poll_once(&name, &ds_id, &driver, &registry, &state).await;
                    tokio::select! {
                        _ = rx.changed() => break,
                        _ = tokio::time::sleep(poll_time) => {}
                        _ = state.refresh.notified() => {
                            debug!("Refresh requested");
                        }
                    }
                }
            }
            .instrument(span),
        ));
        poller.shutdown = Some(tx);
        Ok(())
    }

    async fn stop(&self) -> DseResult<()> {
        if let Some(tx) = self.poller.lock().shutdown.take() {
            let _ = tx.send(());
        }
        Ok(())
    }

    async fn wait(&self) {
        let handle = self.poller.lock().handle.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Poll loop of {} panicked: {}", self.service_id(), e);
            }
        }
    }
}

#[async_trait]
impl RpcEndpoint for DataSourceService {
    fn handles(&self, method: &str) -> bool {
        matches!(method, "get_status" | "request_refresh" | "get_row_data")
    }

    async fn dispatch(&self, _ctx: &RpcContext, method: &str, args: Value) -> DseResult<Value> {
        match method {
            "get_status" => Ok(self.status()),
            "request_refresh" => {
                self.request_refresh();
                Ok(Value::Null)
            }
            "get_row_data" => {
                let table: String = arg(&args, "table")?;
                let tables = self.state.tables.read();
                let rows = tables.get(&table).ok_or_else(|| {
                    DseError::InvalidArguments(format!(
                        "datasource {} has no table '{table}'",
                        self.service_id()
                    ))
                })?;
                Ok(Value::Array(rows.clone()))
            }
            other => Err(DseError::UnsupportedMethod(other.to_string())),
        }
    }
}
