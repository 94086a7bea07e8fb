//! Registry factory: builds the configured backend behind a trait object.

use std::sync::Arc;

use tracing::info;

use crate::{
    config::{RedisConfig, RegistryBackend},
    core::DatasourceRegistry,
    memory::MemoryDatasourceRegistry,
    redis::{RedisDatasourceRegistry, RedisStore},
};

/// Inputs needed to build a registry backend.
#[derive(Debug, Clone, Default)]
pub struct RegistryFactoryConfig {
    pub backend: RegistryBackend,
    pub redis: Option<RedisConfig>,
}

pub fn create_registry(
    config: &RegistryFactoryConfig,
) -> Result<Arc<dyn DatasourceRegistry>, String> {
    match config.backend {
        RegistryBackend::Memory => {
            info!("Initializing in-memory datasource registry");
            Ok(Arc::new(MemoryDatasourceRegistry::new()))
        }
        RegistryBackend::Redis => {
            let redis_cfg = config
                .redis
                .clone()
                .ok_or("redis backend requires redis configuration")?;
            redis_cfg.validate()?;
            info!(
                "Initializing Redis datasource registry (key prefix '{}')",
                redis_cfg.key_prefix
            );
            let store = RedisStore::new(redis_cfg)?;
            Ok(Arc::new(RedisDatasourceRegistry::new(store)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_backend_is_default() {
        let registry = create_registry(&RegistryFactoryConfig::default()).unwrap();
        assert!(registry.get_datasources().await.unwrap().is_empty());
    }

    #[test]
    fn redis_backend_requires_config() {
        let config = RegistryFactoryConfig {
            backend: RegistryBackend::Redis,
            redis: None,
        };
        assert!(create_registry(&config).is_err());
    }

    #[test]
    fn redis_backend_validates_url() {
        let config = RegistryFactoryConfig {
            backend: RegistryBackend::Redis,
            redis: Some(RedisConfig::new("http://not-redis")),
        };
        assert!(create_registry(&config).is_err());
    }
}
