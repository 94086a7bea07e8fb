//! Drivers shipped with the crate.

pub mod fake;
pub mod static_rows;

use std::sync::Arc;

use crate::datasource::DriverTable;

pub const FAKE_DRIVER_MODULE: &str = "dse::drivers::fake::FakeDataSourceDriver";
pub const STATIC_ROWS_DRIVER_MODULE: &str = "dse::drivers::static_rows::StaticRowsDriver";

pub(crate) fn register_builtin(table: &mut DriverTable) {
    table
        .register(FAKE_DRIVER_MODULE, Arc::new(fake::FakeDataSourceDriver))
        .register(STATIC_ROWS_DRIVER_MODULE, Arc::new(static_rows::StaticRowsDriver));
}

/// Module references of every built-in driver.
pub fn builtin_modules() -> Vec<String> {
    vec![
        FAKE_DRIVER_MODULE.to_string(),
        STATIC_ROWS_DRIVER_MODULE.to_string(),
    ]
}
