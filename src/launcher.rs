//! Assembles a complete node from a [`DseConfig`].

use std::sync::Arc;

use data_connector::{create_registry, DatasourceRegistry};
use tracing::{info, warn};

use crate::{
    api::DatasourceModel,
    config::DseConfig,
    datasource::{DriverCatalog, DriverTable, DsManager},
    error::{DseError, DseResult},
    node::DseNode,
    policy::{PolicyEngine, PolicyEngineProxy},
    transport::{LocalTransport, Transport},
};

/// Everything a launched node is made of.
pub struct DseHandle {
    pub node: Arc<DseNode>,
    pub ds_manager: Arc<DsManager>,
    pub api: Arc<DatasourceModel>,
    pub registry: Arc<dyn DatasourceRegistry>,
    pub catalog: Arc<DriverCatalog>,
}

impl DseHandle {
    pub async fn shutdown(&self) -> DseResult<()> {
        let stopped = self.node.stop().await;
        self.node.wait().await;
        stopped
    }
}

/// Pieces a caller may supply instead of the defaults.
#[derive(Default)]
pub struct LaunchOptions {
    pub transport: Option<Arc<dyn Transport>>,
    pub registry: Option<Arc<dyn DatasourceRegistry>>,
    pub driver_table: Option<DriverTable>,
    pub policy_engine: Option<Arc<dyn PolicyEngine>>,
}

/// Single-process node with an in-process transport and the configured
/// registry.
pub async fn launch(config: DseConfig) -> DseResult<DseHandle> {
    launch_with(config, LaunchOptions::default()).await
}

pub async fn launch_with(config: DseConfig, options: LaunchOptions) -> DseResult<DseHandle> {
    config.validate()?;

    let transport: Arc<dyn Transport> = match options.transport {
        Some(transport) => transport,
        None => Arc::new(LocalTransport::with_timeout(config.rpc_timeout())),
    };
    let registry = match options.registry {
        Some(registry) => registry,
        None => create_registry(&config.registry_config()).map_err(DseError::BadConfig)?,
    };

    let catalog = Arc::new(DriverCatalog::new(
        options.driver_table.unwrap_or_else(DriverTable::builtin),
    ));
    let ds_manager = Arc::new(DsManager::new(
        registry.clone(),
        catalog.clone(),
        config.ds_manager_config(),
    ));
    ds_manager.load_drivers(&config.drivers)?;

    let node = DseNode::builder(config.node_id.clone(), transport)
        .rpc_timeout(config.rpc_timeout())
        .control_bus(config.control_bus_config())
        .datasources(registry.clone(), catalog.clone())
        .build()?;

    node.register_service(ds_manager.clone(), None)?;
    if let Some(engine) = options.policy_engine {
        node.register_service(Arc::new(PolicyEngineProxy::new(engine)), None)?;
    }
    let api = Arc::new(DatasourceModel::new());
    node.register_service(api.clone(), None)?;

    if config.datasources.delete_missing_driver_datasources {
        match ds_manager.delete_missing_driver_datasources().await {
            Ok(removed) => info!("Removed {} datasources with missing drivers", removed),
            Err(e) => warn!("Datasource cleanup failed: {}", e),
        }
    }

    node.start().await?;
    info!(
        "Node {} launched with {} drivers",
        node.node_id(),
        catalog.snapshot().len()
    );

    Ok(DseHandle {
        node,
        ds_manager,
        api,
        registry,
        catalog,
    })
}
