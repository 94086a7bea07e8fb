//! Policy engine seam.
//!
//! The engine itself lives outside this crate. A node that hosts one
//! registers a [`PolicyEngineProxy`] under [`ENGINE_SERVICE_ID`], which the
//! datasource manager finds through [`Service::as_policy_engine`].

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    error::{DseError, DseResult},
    service::{Service, ServiceBase},
    transport::{Endpoints, RpcContext, RpcEndpoint},
};

pub const ENGINE_SERVICE_ID: &str = "engine";

#[async_trait]
pub trait PolicyEngine: Send + Sync + 'static {
    /// Reload policies so they match the current set of datasources.
    async fn synchronize_policies(&self) -> DseResult<()>;
}

pub struct PolicyEngineProxy {
    base: ServiceBase,
    engine: Arc<dyn PolicyEngine>,
}

impl PolicyEngineProxy {
    pub fn new(engine: Arc<dyn PolicyEngine>) -> Self {
        Self {
            base: ServiceBase::new(ENGINE_SERVICE_ID),
            engine,
        }
    }
}

#[async_trait]
impl Service for PolicyEngineProxy {
    fn base(&self) -> &ServiceBase {
        &self.base
    }

    fn rpc_endpoints(self: Arc<Self>) -> Endpoints {
        vec![self]
    }

    fn as_policy_engine(self: Arc<Self>) -> Option<Arc<dyn PolicyEngine>> {
        Some(self.engine.clone())
    }
}

#[async_trait]
impl RpcEndpoint for PolicyEngineProxy {
    fn handles(&self, method: &str) -> bool {
        method == "synchronize_policies"
    }

    async fn dispatch(&self, _ctx: &RpcContext, method: &str, _args: Value) -> DseResult<Value> {
        match method {
            "synchronize_policies" => {
                self.engine.synchronize_policies().await?;
                Ok(Value::Null)
            }
            other => Err(DseError::UnsupportedMethod(other.to_string())),
        }
    }
}
