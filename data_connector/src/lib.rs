//! Datasource registry storage.
//!
//! The registry is the durable, cluster-shared source of truth for
//! datasource records. Every node reads and writes it through the
//! [`DatasourceRegistry`] trait.
//!
//! Supported backends:
//! - Memory (default, single process)
//! - Redis

mod common;
pub mod config;
mod core;
mod factory;
mod memory;
mod redis;

pub use common::{parse_config_text, serialize_config, ConfigMap};
pub use config::{RedisConfig, RegistryBackend};
pub use core::{
    DatasourceId, DatasourceRegistry, DatasourceRow, RegistryError, RegistryResult, TableDataRow,
};
pub use factory::{create_registry, RegistryFactoryConfig};
pub use memory::MemoryDatasourceRegistry;
