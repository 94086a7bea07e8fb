//! Datasource serving rows given in its own config.
//!
//! The `rows` option holds a JSON object mapping table names to arrays of
//! rows, e.g. `{"flavors": [{"id": "m1.small", "vcpus": 1}]}`.

use std::sync::Arc;

use async_trait::async_trait;
use data_connector::ConfigMap;
use serde_json::{json, Value};

use crate::{
    datasource::{DataSourceDriver, Driver, DriverInfo, TableSnapshot},
    error::{DseError, DseResult},
};

pub const STATIC_ROWS_DRIVER_ID: &str = "static_rows";

pub struct StaticRowsDriver;

impl Driver for StaticRowsDriver {
    fn info(&self) -> DriverInfo {
        DriverInfo::new(STATIC_ROWS_DRIVER_ID, "Serves the rows listed in its config")
            .optional("rows")
            .optional("poll_time")
    }

    fn schema(&self) -> Value {
        // Tables are whatever the config declares.
        json!({})
    }

    fn create(&self, name: &str, args: &ConfigMap) -> DseResult<Arc<dyn DataSourceDriver>> {
        let tables = match args.get("rows") {
            None => TableSnapshot::new(),
            Some(text) => serde_json::from_str::<TableSnapshot>(text).map_err(|e| {
                DseError::BadConfig(format!("rows of datasource {name} are not valid: {e}"))
            })?,
        };
        Ok(Arc::new(StaticRows { tables }))
    }
}

struct StaticRows {
    tables: TableSnapshot,
}

#[async_trait]
impl DataSourceDriver for StaticRows {
    async fn update_from_datasource(&self) -> DseResult<TableSnapshot> {
        Ok(self.tables.clone())
    }
}
