//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::{
    sync::{Arc, Once},
    time::Duration,
};

use async_trait::async_trait;
use data_connector::{ConfigMap, DatasourceRegistry, MemoryDatasourceRegistry};
use dse::{
    datasource::{DataSourceDriver, Driver, DriverInfo, DriverTable, TableSnapshot},
    launch_with,
    policy::PolicyEngine,
    DseConfig, DseHandle, DseResult, LaunchOptions, LocalTransport, Transport,
};
use serde_json::{json, Value};
use tracing_subscriber::{
    filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(fmt::layer().with_test_writer())
            .with(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .try_init();
    });
}

pub const AB_DRIVER_ID: &str = "fake";
pub const AB_DRIVER_MODULE: &str = "tests::common::AbDriver";

/// Declares `a` (required, secret) and `b` (optional).
pub struct AbDriver;

impl Driver for AbDriver {
    fn info(&self) -> DriverInfo {
        DriverInfo::new(AB_DRIVER_ID, "two option test driver")
            .required("a")
            .optional("b")
            .optional("poll_time")
            .secret("a")
    }

    fn schema(&self) -> Value {
        json!({"values": [{"name": "key", "desc": "option name"}]})
    }

    fn create(&self, _name: &str, args: &ConfigMap) -> DseResult<Arc<dyn DataSourceDriver>> {
        Ok(Arc::new(AbInstance { args: args.clone() }))
    }
}

struct AbInstance {
    args: ConfigMap,
}

#[async_trait]
impl DataSourceDriver for AbInstance {
    async fn update_from_datasource(&self) -> DseResult<TableSnapshot> {
        let rows = self
            .args
            .keys()
            .filter(|k| k.as_str() != "a")
            .map(|k| json!({ "key": k }))
            .collect();
        let mut snapshot = TableSnapshot::new();
        snapshot.insert("values".to_string(), rows);
        Ok(snapshot)
    }
}

pub fn test_driver_table() -> DriverTable {
    let mut table = DriverTable::builtin();
    table.register(AB_DRIVER_MODULE, Arc::new(AbDriver));
    table
}

pub fn test_config(node_id: &str) -> DseConfig {
    let mut config = DseConfig::new(node_id);
    config.drivers.push(AB_DRIVER_MODULE.to_string());
    config.transport.rpc_timeout_ms = 2000;
    config.control_bus.heartbeat_interval_ms = 50;
    config.control_bus.peer_timeout_ms = 500;
    config.datasources.resync_interval_secs = 0;
    config
}

/// Nodes sharing one in-process transport and one registry.
pub struct Cluster {
    pub transport: Arc<LocalTransport>,
    pub registry: Arc<MemoryDatasourceRegistry>,
    pub nodes: Vec<DseHandle>,
}

impl Cluster {
    pub fn new() -> Self {
        init_test_logging();
        Self {
            transport: Arc::new(LocalTransport::with_timeout(Duration::from_secs(2))),
            registry: Arc::new(MemoryDatasourceRegistry::new()),
            nodes: Vec::new(),
        }
    }

    pub async fn launch(&mut self, config: DseConfig) -> &DseHandle {
        self.launch_with_engine(config, None).await
    }

    pub async fn launch_with_engine(
        &mut self,
        config: DseConfig,
        policy_engine: Option<Arc<dyn PolicyEngine>>,
    ) -> &DseHandle {
        let transport: Arc<dyn Transport> = self.transport.clone();
        let registry: Arc<dyn DatasourceRegistry> = self.registry.clone();
        let handle = launch_with(
            config,
            LaunchOptions {
                transport: Some(transport),
                registry: Some(registry),
                driver_table: Some(test_driver_table()),
                policy_engine,
            },
        )
        .await
        .unwrap();
        self.nodes.push(handle);
        self.nodes.last().unwrap()
    }

    pub async fn launch_node(&mut self, node_id: &str) -> &DseHandle {
        self.launch(test_config(node_id)).await
    }

    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown().await.unwrap();
        }
    }
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
