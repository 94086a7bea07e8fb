//! Datasource management: drivers, records, driver-backed services and the
//! manager service that keeps them consistent with the registry.

mod driver;
mod manager;
mod record;
mod service;
pub(crate) mod sync;

pub use driver::{
    DataSourceDriver, Driver, DriverCatalog, DriverDescriptor, DriverInfo, DriverRegistry,
    DriverTable, LoadedDriver, OptionRequirement, TableSnapshot,
};
pub use manager::{DsManager, DsManagerConfig, DS_MANAGER_SERVICE_ID};
pub use record::{
    make_datasource_dict, ConfigValue, DatasourceRecord, DatasourceRequest, HIDDEN_PLACEHOLDER,
};
pub use service::{DataSourceService, DEFAULT_POLL_TIME};
pub use sync::{SyncFailure, SyncReport};
