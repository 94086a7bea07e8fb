//! OpenStack-style image datasource that fabricates its rows.
//!
//! Accepts the usual keystone credentials but never contacts anything; each
//! poll produces the same image rows with an increasing revision, which is
//! enough to exercise the full datasource lifecycle.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use async_trait::async_trait;
use data_connector::ConfigMap;
use serde_json::{json, Value};

use crate::{
    datasource::{DataSourceDriver, Driver, DriverInfo, TableSnapshot},
    error::{DseError, DseResult},
};

pub const FAKE_DRIVER_ID: &str = "fake_datasource";

const IMAGE_FIELDS: &[(&str, &str)] = &[
    ("id", "UUID of image"),
    ("status", "The image status"),
    ("name", "Image name"),
    ("owner", "Owner of the image"),
    ("revision", "Poll counter of the datasource"),
];

pub struct FakeDataSourceDriver;

impl Driver for FakeDataSourceDriver {
    fn info(&self) -> DriverInfo {
        DriverInfo::new(FAKE_DRIVER_ID, "Datasource driver producing fake image data")
            .required("auth_url")
            .required("username")
            .required("password")
            .required("tenant_name")
            .optional("poll_time")
            .secret("password")
    }

    fn schema(&self) -> Value {
        let columns: Vec<Value> = IMAGE_FIELDS
            .iter()
            .map(|(name, desc)| json!({"name": name, "desc": desc}))
            .collect();
        json!({ "images": columns })
    }

    fn create(&self, name: &str, args: &ConfigMap) -> DseResult<Arc<dyn DataSourceDriver>> {
        let tenant = args
            .get("tenant_name")
            .ok_or_else(|| DseError::MissingRequiredConfigOptions("tenant_name".into()))?;
        Ok(Arc::new(FakeImages {
            name: name.to_string(),
            tenant: tenant.clone(),
            revision: AtomicU64::new(0),
        }))
    }
}

struct FakeImages {
    name: String,
    tenant: String,
    revision: AtomicU64,
}

#[async_trait]
impl DataSourceDriver for FakeImages {
    async fn update_from_datasource(&self) -> DseResult<TableSnapshot> {
        let revision = self.revision.fetch_add(1, Ordering::SeqCst);
        let rows = ["cirros", "ubuntu"]
            .iter()
            .enumerate()
            .map(|(i, image)| {
                json!({
                    "id": format!("{}-image-{i}", self.name),
                    "status": "active",
                    "name": image,
                    "owner": self.tenant,
                    "revision": revision,
                })
            })
            .collect();
        let mut snapshot = TableSnapshot::new();
        snapshot.insert("images".to_string(), rows);
        Ok(snapshot)
    }
}
