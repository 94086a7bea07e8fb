//! Driver contract and the catalog of loaded drivers.
//!
//! Drivers are not discovered at runtime: each one is registered in a
//! [`DriverTable`] under its module reference. Loading resolves the
//! configured references into an immutable [`DriverRegistry`]; a reload swaps
//! the whole registry at once.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use data_connector::ConfigMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::{DseError, DseResult};

/// Rows of every table a datasource publishes, keyed by table name.
pub type TableSnapshot = BTreeMap<String, Vec<Value>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionRequirement {
    #[serde(rename = "required")]
    Required,
    #[serde(rename = "(optional)")]
    Optional,
}

/// What a driver declares about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverInfo {
    pub id: String,
    pub description: String,
    pub config: BTreeMap<String, OptionRequirement>,
    #[serde(default)]
    pub secret: Vec<String>,
}

impl DriverInfo {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            config: BTreeMap::new(),
            secret: Vec::new(),
        }
    }

    pub fn required(mut self, option: &str) -> Self {
        self.config
            .insert(option.to_string(), OptionRequirement::Required);
        self
    }

    pub fn optional(mut self, option: &str) -> Self {
        self.config
            .insert(option.to_string(), OptionRequirement::Optional);
        self
    }

    pub fn secret(mut self, option: &str) -> Self {
        self.secret.push(option.to_string());
        self
    }

    pub fn required_options(&self) -> impl Iterator<Item = &str> {
        self.config
            .iter()
            .filter(|(_, r)| **r == OptionRequirement::Required)
            .map(|(k, _)| k.as_str())
    }
}

/// Descriptor of a loaded driver: its info plus the module it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverDescriptor {
    #[serde(flatten)]
    pub info: DriverInfo,
    pub module: String,
}

/// A running driver instance behind one datasource service.
#[async_trait]
pub trait DataSourceDriver: Send + Sync {
    /// Fetch the current state of the external system.
    async fn update_from_datasource(&self) -> DseResult<TableSnapshot>;
}

/// Driver class: describes itself and creates instances.
pub trait Driver: Send + Sync + 'static {
    fn info(&self) -> DriverInfo;

    /// Table schema; may be expensive, callers run it on the blocking pool.
    fn schema(&self) -> Value;

    /// `args` is the datasource config plus `ds_id`.
    fn create(&self, name: &str, args: &ConfigMap) -> DseResult<Arc<dyn DataSourceDriver>>;
}

/// Module reference → driver registration table.
#[derive(Clone, Default)]
pub struct DriverTable {
    drivers: HashMap<String, Arc<dyn Driver>>,
}

impl fmt::Debug for DriverTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut modules: Vec<&String> = self.drivers.keys().collect();
        modules.sort();
        f.debug_struct("DriverTable")
            .field("modules", &modules)
            .finish()
    }
}

impl DriverTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with every driver shipped in [`crate::drivers`].
    pub fn builtin() -> Self {
        let mut table = Self::new();
        crate::drivers::register_builtin(&mut table);
        table
    }

    pub fn register(&mut self, module: impl Into<String>, driver: Arc<dyn Driver>) -> &mut Self {
        self.drivers.insert(module.into(), driver);
        self
    }

    pub fn resolve(&self, module: &str) -> Option<Arc<dyn Driver>> {
        self.drivers.get(module).cloned()
    }

    pub fn modules(&self) -> Vec<String> {
        let mut modules: Vec<String> = self.drivers.keys().cloned().collect();
        modules.sort();
        modules
    }
}

#[derive(Clone)]
pub struct LoadedDriver {
    pub descriptor: DriverDescriptor,
    pub driver: Arc<dyn Driver>,
}

/// Immutable set of loaded drivers keyed by driver id.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: BTreeMap<String, LoadedDriver>,
}

impl DriverRegistry {
    /// Resolve every module reference; two drivers claiming one id is a
    /// configuration error.
    pub fn load(table: &DriverTable, modules: &[String]) -> DseResult<Self> {
        let mut drivers = BTreeMap::new();
        for module in modules {
            let driver = table
                .resolve(module)
                .ok_or_else(|| DseError::BadConfig(format!("unknown driver module '{module}'")))?;
            let info = driver.info();
            if drivers.contains_key(&info.id) {
                return Err(DseError::BadConfig(format!(
                    "There is a driver loaded already with the driver name of {}",
                    info.id
                )));
            }
            drivers.insert(
                info.id.clone(),
                LoadedDriver {
                    descriptor: DriverDescriptor {
                        info,
                        module: module.clone(),
                    },
                    driver,
                },
            );
        }
        Ok(Self { drivers })
    }

    pub fn get(&self, id: &str) -> Option<&LoadedDriver> {
        self.drivers.get(id)
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    pub fn descriptors(&self) -> Vec<DriverDescriptor> {
        self.drivers.values().map(|d| d.descriptor.clone()).collect()
    }
}

/// Shared handle to the currently loaded drivers.
pub struct DriverCatalog {
    table: DriverTable,
    current: ArcSwap<DriverRegistry>,
}

impl DriverCatalog {
    /// Catalog over `table` with nothing loaded yet.
    pub fn new(table: DriverTable) -> Self {
        Self {
            table,
            current: ArcSwap::from_pointee(DriverRegistry::default()),
        }
    }

    pub fn load(&self, modules: &[String]) -> DseResult<()> {
        let registry = DriverRegistry::load(&self.table, modules)?;
        info!("Loaded {} datasource drivers", registry.len());
        self.current.store(Arc::new(registry));
        Ok(())
    }

    pub fn snapshot(&self) -> Arc<DriverRegistry> {
        self.current.load_full()
    }

    pub fn get(&self, id: &str) -> Option<LoadedDriver> {
        self.current.load().get(id).cloned()
    }

    pub fn descriptor(&self, id: &str) -> DseResult<DriverDescriptor> {
        self.get(id)
            .map(|d| d.descriptor)
            .ok_or_else(|| DseError::DriverNotFound(id.to_string()))
    }

    pub fn descriptors(&self) -> Vec<DriverDescriptor> {
        self.current.load().descriptors()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl Driver for Named {
        fn info(&self) -> DriverInfo {
            DriverInfo::new(self.0, "test driver")
                .required("a")
                .optional("b")
        }

        fn schema(&self) -> Value {
            Value::Null
        }

        fn create(&self, _name: &str, _args: &ConfigMap) -> DseResult<Arc<dyn DataSourceDriver>> {
            Err(DseError::DataServiceError("not runnable".into()))
        }
    }

    fn table() -> DriverTable {
        let mut table = DriverTable::new();
        table
            .register("tests::Fake", Arc::new(Named("fake")))
            .register("tests::FakeAgain", Arc::new(Named("fake")))
            .register("tests::Other", Arc::new(Named("other")));
        table
    }

    #[test]
    fn descriptor_shape() {
        let registry = DriverRegistry::load(&table(), &["tests::Fake".to_string()]).unwrap();
        let descriptor = registry.get("fake").unwrap().descriptor.clone();
        let value = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(value["id"], "fake");
        assert_eq!(value["module"], "tests::Fake");
        assert_eq!(value["config"]["a"], "required");
        assert_eq!(value["config"]["b"], "(optional)");
        assert_eq!(value["secret"], serde_json::json!([]));
    }

    #[test]
    fn duplicate_ids_are_bad_config() {
        let err = DriverRegistry::load(
            &table(),
            &["tests::Fake".to_string(), "tests::FakeAgain".to_string()],
        )
        .err()
        .unwrap();
        assert!(matches!(err, DseError::BadConfig(_)));
    }

    #[test]
    fn unknown_module_is_bad_config() {
        let err = DriverRegistry::load(&table(), &["nope".to_string()])
            .err()
            .unwrap();
        assert!(matches!(err, DseError::BadConfig(_)));
    }

    #[test]
    fn reload_replaces_wholesale() {
        let catalog = DriverCatalog::new(table());
        catalog.load(&["tests::Fake".to_string()]).unwrap();
        let before = catalog.snapshot();
        assert!(catalog.get("fake").is_some());

        catalog.load(&["tests::Other".to_string()]).unwrap();
        assert!(catalog.get("fake").is_none());
        assert!(matches!(
            catalog.descriptor("fake"),
            Err(DseError::DriverNotFound(_))
        ));
        assert!(catalog.get("other").is_some());
        // Earlier snapshots stay intact.
        assert!(before.get("fake").is_some());
    }

    #[test]
    fn builtin_table_lists_shipped_drivers() {
        let modules = DriverTable::builtin().modules();
        assert!(modules.contains(&crate::drivers::FAKE_DRIVER_MODULE.to_string()));
        assert!(modules.contains(&crate::drivers::STATIC_ROWS_DRIVER_MODULE.to_string()));
    }
}
