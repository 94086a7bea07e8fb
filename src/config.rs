//! Node configuration, loaded from YAML.

use std::{path::Path, time::Duration};

use data_connector::{RedisConfig, RegistryBackend, RegistryFactoryConfig};
use serde::{Deserialize, Serialize};

use crate::{
    control_bus::ControlBusConfig,
    datasource::DsManagerConfig,
    drivers,
    error::{DseError, DseResult},
    logging::LoggingConfig,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DseConfig {
    /// Cluster-unique id of this node.
    pub node_id: String,

    /// Driver module references to load at startup.
    #[serde(default = "drivers::builtin_modules")]
    pub drivers: Vec<String>,

    #[serde(default)]
    pub registry: RegistrySection,

    #[serde(default)]
    pub transport: TransportSection,

    #[serde(default)]
    pub control_bus: ControlBusSection,

    #[serde(default)]
    pub datasources: DatasourcesSection,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrySection {
    #[serde(default)]
    pub backend: RegistryBackend,
    #[serde(default)]
    pub redis: Option<RedisConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportSection {
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlBusSection {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_peer_timeout_ms")]
    pub peer_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasourcesSection {
    /// Zero disables periodic reconciliation.
    #[serde(default = "default_resync_interval_secs")]
    pub resync_interval_secs: u64,
    /// Remove records whose driver is not loaded when the node launches.
    #[serde(default)]
    pub delete_missing_driver_datasources: bool,
}

fn default_rpc_timeout_ms() -> u64 {
    5000
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_peer_timeout_ms() -> u64 {
    5000
}

fn default_resync_interval_secs() -> u64 {
    60
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            rpc_timeout_ms: default_rpc_timeout_ms(),
        }
    }
}

impl Default for ControlBusSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            peer_timeout_ms: default_peer_timeout_ms(),
        }
    }
}

impl Default for DatasourcesSection {
    fn default() -> Self {
        Self {
            resync_interval_secs: default_resync_interval_secs(),
            delete_missing_driver_datasources: false,
        }
    }
}

impl DseConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            drivers: drivers::builtin_modules(),
            registry: RegistrySection::default(),
            transport: TransportSection::default(),
            control_bus: ControlBusSection::default(),
            datasources: DatasourcesSection::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn from_yaml(text: &str) -> DseResult<Self> {
        serde_yaml::from_str(text).map_err(|e| DseError::BadConfig(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> DseResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| DseError::BadConfig(format!("cannot read {}: {e}", path.display())))?;
        Self::from_yaml(&text)
    }

    pub fn validate(&self) -> DseResult<()> {
        if self.node_id.trim().is_empty() {
            return Err(DseError::BadConfig("node_id must not be empty".into()));
        }
        if self.transport.rpc_timeout_ms == 0 {
            return Err(DseError::BadConfig(
                "transport.rpc_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.control_bus.heartbeat_interval_ms == 0 {
            return Err(DseError::BadConfig(
                "control_bus.heartbeat_interval_ms must be greater than 0".into(),
            ));
        }
        if self.control_bus.peer_timeout_ms < self.control_bus.heartbeat_interval_ms {
            return Err(DseError::BadConfig(
                "control_bus.peer_timeout_ms must not be shorter than the heartbeat interval"
                    .into(),
            ));
        }
        match (&self.registry.backend, &self.registry.redis) {
            (RegistryBackend::Redis, None) => {
                return Err(DseError::BadConfig(
                    "registry.redis is required for the redis backend".into(),
                ));
            }
            (RegistryBackend::Redis, Some(redis)) => {
                redis
                    .validate()
                    .map_err(|e| DseError::BadConfig(format!("registry.redis: {e}")))?;
            }
            (RegistryBackend::Memory, _) => {}
        }
        Ok(())
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.transport.rpc_timeout_ms)
    }

    pub fn control_bus_config(&self) -> ControlBusConfig {
        ControlBusConfig {
            heartbeat_interval: Duration::from_millis(self.control_bus.heartbeat_interval_ms),
            peer_timeout: Duration::from_millis(self.control_bus.peer_timeout_ms),
        }
    }

    pub fn ds_manager_config(&self) -> DsManagerConfig {
        DsManagerConfig {
            resync_interval: Duration::from_secs(self.datasources.resync_interval_secs),
        }
    }

    pub fn registry_config(&self) -> RegistryFactoryConfig {
        RegistryFactoryConfig {
            backend: self.registry.backend.clone(),
            redis: self.registry.redis.clone(),
        }
    }
}
