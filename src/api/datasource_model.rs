use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::{ApiError, ApiResult};
use crate::{
    datasource::{DatasourceRecord, DatasourceRequest, DS_MANAGER_SERVICE_ID},
    error::{DseError, DseResult},
    service::{Service, ServiceBase},
    transport::{arg, Endpoints, RpcContext, RpcEndpoint},
};

pub const DATASOURCE_MODEL_SERVICE_ID: &str = "api-datasource";

/// Datasource collection of the API. Reads never expose secrets.
pub struct DatasourceModel {
    base: ServiceBase,
}

impl Default for DatasourceModel {
    fn default() -> Self {
        Self::new()
    }
}

impl DatasourceModel {
    pub fn new() -> Self {
        Self {
            base: ServiceBase::new(DATASOURCE_MODEL_SERVICE_ID),
        }
    }

    async fn ds_manager(&self, method: &str, args: Value) -> ApiResult<Value> {
        let node = self.base.require_node()?;
        debug!("Forwarding {} to {}", method, DS_MANAGER_SERVICE_ID);
        Ok(node
            .invoke_service_rpc(DS_MANAGER_SERVICE_ID, method, args)
            .await?)
    }

    fn decode<T: serde::de::DeserializeOwned>(value: Value) -> ApiResult<T> {
        serde_json::from_value(value).map_err(|e| {
            ApiError::from(DseError::DataServiceError(format!(
                "malformed datasource manager reply: {e}"
            )))
        })
    }

    /// `{"results": [...]}` with every datasource in the registry.
    pub async fn get_items(&self) -> ApiResult<Value> {
        let results = self
            .ds_manager("get_datasources", json!({"filter_secret": true}))
            .await?;
        Ok(json!({ "results": results }))
    }

    pub async fn get_item(&self, ds_id: &str) -> ApiResult<DatasourceRecord> {
        let reply = self
            .ds_manager(
                "get_datasource",
                json!({"ds_id": ds_id, "filter_secret": true}),
            )
            .await?;
        Self::decode(reply)
    }

    /// Create a datasource; returns its id and the stored record.
    pub async fn add_item(
        &self,
        item: &DatasourceRequest,
    ) -> ApiResult<(String, DatasourceRecord)> {
        let reply = self
            .ds_manager("add_datasource", json!({ "item": item }))
            .await?;
        let mut record: DatasourceRecord = Self::decode(reply)?;
        // Echo the stored secrets back as placeholders.
        let driver = self
            .ds_manager("get_driver_info", json!({"driver": record.driver}))
            .await?;
        let secrets: Vec<String> = driver
            .get("secret")
            .cloned()
            .map(Self::decode::<Vec<String>>)
            .transpose()?
            .unwrap_or_default();
        record.redact(&secrets);
        Ok((record.id.clone(), record))
    }

    pub async fn delete_item(&self, ds_id: &str) -> ApiResult<()> {
        self.ds_manager("delete_datasource", json!({ "ds_id": ds_id }))
            .await?;
        Ok(())
    }

    /// Table schema of the driver behind `ds_id`.
    pub async fn get_schema(&self, ds_id: &str) -> ApiResult<Value> {
        let record = self.get_item(ds_id).await?;
        self.ds_manager("get_driver_schema", json!({"driver": record.driver}))
            .await
    }
}

impl From<ApiError> for DseError {
    fn from(e: ApiError) -> Self {
        DseError::from_remote(&e.error_code, e.message)
    }
}

#[async_trait]
impl Service for DatasourceModel {
    fn base(&self) -> &ServiceBase {
        &self.base
    }

    fn rpc_endpoints(self: Arc<Self>) -> Endpoints {
        vec![self]
    }
}

#[async_trait]
impl RpcEndpoint for DatasourceModel {
    fn handles(&self, method: &str) -> bool {
        matches!(
            method,
            "get_items" | "get_item" | "add_item" | "delete_item" | "get_schema"
        )
    }

    async fn dispatch(&self, _ctx: &RpcContext, method: &str, args: Value) -> DseResult<Value> {
        let encode = |v: DatasourceRecord| {
            serde_json::to_value(v).map_err(|e| DseError::DataServiceError(e.to_string()))
        };
        match method {
            "get_items" => Ok(self.get_items().await?),
            "get_item" => {
                let ds_id: String = arg(&args, "ds_id")?;
                encode(self.get_item(&ds_id).await?)
            }
            "add_item" => {
                let item: DatasourceRequest = arg(&args, "item")?;
                let (_, record) = self.add_item(&item).await?;
                encode(record)
            }
            "delete_item" => {
                let ds_id: String = arg(&args, "ds_id")?;
                self.delete_item(&ds_id).await?;
                Ok(Value::Null)
            }
            "get_schema" => {
                let ds_id: String = arg(&args, "ds_id")?;
                Ok(self.get_schema(&ds_id).await?)
            }
            other => Err(DseError::UnsupportedMethod(other.to_string())),
        }
    }
}
