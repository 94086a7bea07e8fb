//! RPC transport abstraction.
//!
//! The DSE addresses two families of topics:
//! - the control topic, one server per node (`server = node_id`);
//! - one topic per service id (`congress-service-<id>`), one server per
//!   hosting node, so several nodes may serve the same service id.
//!
//! A target with a server is unicast to that node; without a server a call or
//! cast lands on any one listener; a fanout target reaches every listener.

mod local;

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use local::LocalTransport;

use crate::error::{DseError, DseResult};

/// Protocol version carried on every target.
pub const RPC_VERSION: &str = "1.0";
pub const CONTROL_TOPIC: &str = "congress-control";
pub const SERVICE_TOPIC_PREFIX: &str = "congress-service-";

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Timed out after {timeout:?} calling '{method}' on {target}")]
    Timeout {
        target: String,
        method: String,
        timeout: Duration,
    },

    /// The remote handler failed; `code` names the remote error variant.
    #[error("Remote error {code}: {message}")]
    Remote { code: String, message: String },

    #[error("Message delivery failed: {0}")]
    DeliveryFailure(String),

    #[error("Incompatible RPC version: requested {requested}, server speaks {available}")]
    IncompatibleVersion { requested: String, available: String },
}

impl TransportError {
    pub fn code(&self) -> &str {
        match self {
            Self::Timeout { .. } => "MessagingTimeout",
            Self::Remote { code, .. } => code,
            Self::DeliveryFailure(_) => "MessageDeliveryFailure",
            Self::IncompatibleVersion { .. } => "UnsupportedVersion",
        }
    }
}

/// Address of an RPC server or group of servers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub topic: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default)]
    pub fanout: bool,
}

impl Target {
    /// Control-topic target; `server` selects one node.
    pub fn node(server: Option<&str>) -> Self {
        Self {
            topic: CONTROL_TOPIC.to_string(),
            version: RPC_VERSION.to_string(),
            namespace: None,
            server: server.map(str::to_string),
            fanout: false,
        }
    }

    pub fn node_fanout() -> Self {
        Self {
            fanout: true,
            ..Self::node(None)
        }
    }

    /// Service-topic target; `server` selects the hosting node.
    pub fn service(service_id: &str, server: Option<&str>) -> Self {
        Self {
            topic: format!("{SERVICE_TOPIC_PREFIX}{service_id}"),
            version: RPC_VERSION.to_string(),
            namespace: None,
            server: server.map(str::to_string),
            fanout: false,
        }
    }

    pub fn service_fanout(service_id: &str) -> Self {
        Self {
            fanout: true,
            ..Self::service(service_id, None)
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.topic)?;
        if let Some(server) = &self.server {
            write!(f, ".{server}")?;
        }
        if self.fanout {
            write!(f, " (fanout)")?;
        }
        write!(f, " v{}", self.version)
    }
}

/// A server speaking `available` accepts a request for `requested` when the
/// major versions match and the server minor is not older.
pub fn version_is_compatible(available: &str, requested: &str) -> bool {
    fn parse(v: &str) -> Option<(u32, u32)> {
        let mut parts = v.splitn(2, '.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().unwrap_or("0").parse().ok()?;
        Some((major, minor))
    }
    match (parse(available), parse(requested)) {
        (Some((a_major, a_minor)), Some((r_major, r_minor))) => {
            a_major == r_major && a_minor >= r_minor
        }
        _ => false,
    }
}

/// Caller identity attached to every message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcContext {
    pub node_id: String,
    pub instance: String,
}

/// An object exposing remotely invokable methods.
#[async_trait]
pub trait RpcEndpoint: Send + Sync + 'static {
    /// Only messages sent with the same namespace reach this endpoint.
    fn namespace(&self) -> Option<&str> {
        None
    }

    fn handles(&self, method: &str) -> bool;

    async fn dispatch(&self, ctx: &RpcContext, method: &str, args: Value) -> DseResult<Value>;
}

pub type Endpoints = Vec<Arc<dyn RpcEndpoint>>;

/// Route a message to the first endpoint that accepts it.
pub async fn dispatch(
    endpoints: &[Arc<dyn RpcEndpoint>],
    namespace: Option<&str>,
    ctx: &RpcContext,
    method: &str,
    args: Value,
) -> DseResult<Value> {
    let endpoint = endpoints
        .iter()
        .find(|e| e.namespace() == namespace && e.handles(method))
        .ok_or_else(|| DseError::UnsupportedMethod(method.to_string()))?;
    endpoint.dispatch(ctx, method, args).await
}

/// Extract a required keyword argument.
pub fn arg<T: DeserializeOwned>(args: &Value, name: &str) -> DseResult<T> {
    let value = args
        .get(name)
        .ok_or_else(|| DseError::InvalidArguments(format!("missing argument '{name}'")))?;
    serde_json::from_value(value.clone())
        .map_err(|e| DseError::InvalidArguments(format!("argument '{name}': {e}")))
}

/// Extract an optional keyword argument; `null` counts as absent.
pub fn opt_arg<T: DeserializeOwned>(args: &Value, name: &str) -> DseResult<Option<T>> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => arg(args, name).map(Some),
    }
}

/// Handle to a server listening on one target. Opened by
/// [`Transport::listen`], it receives nothing until started.
#[async_trait]
pub trait RpcServer: Send + Sync {
    fn target(&self) -> &Target;

    async fn start(&self) -> TransportResult<()>;

    /// Stop accepting messages. In-flight dispatches run to completion.
    async fn stop(&self);

    /// Wait until the server loop and every in-flight dispatch finished.
    async fn wait(&self);
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn listen(&self, target: Target, endpoints: Endpoints) -> TransportResult<Arc<dyn RpcServer>>;

    /// Request/response; `timeout = None` uses the transport default.
    async fn call(
        &self,
        target: &Target,
        ctx: &RpcContext,
        method: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> TransportResult<Value>;

    /// Fire-and-forget, unicast or fanout depending on the target.
    async fn cast(
        &self,
        target: &Target,
        ctx: &RpcContext,
        method: &str,
        args: Value,
    ) -> TransportResult<()>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn control_and_service_topics() {
        let node = Target::node(Some("node-1"));
        assert_eq!(node.topic, "congress-control");
        assert_eq!(node.server.as_deref(), Some("node-1"));
        assert!(!node.fanout);

        let fanout = Target::node_fanout();
        assert!(fanout.server.is_none());
        assert!(fanout.fanout);

        let svc = Target::service("nova", Some("node-2"));
        assert_eq!(svc.topic, "congress-service-nova");
        assert_eq!(svc.version, RPC_VERSION);
        assert_eq!(svc.to_string(), "congress-service-nova.node-2 v1.0");
    }

    #[test]
    fn version_compatibility() {
        assert!(version_is_compatible("1.0", "1.0"));
        assert!(version_is_compatible("1.2", "1.1"));
        assert!(!version_is_compatible("1.0", "1.1"));
        assert!(!version_is_compatible("2.0", "1.0"));
        assert!(!version_is_compatible("garbage", "1.0"));
    }

    #[test]
    fn argument_extraction() {
        let args = json!({"name": "nova", "flag": null});
        let name: String = arg(&args, "name").unwrap();
        assert_eq!(name, "nova");

        let flag: Option<bool> = opt_arg(&args, "flag").unwrap();
        assert!(flag.is_none());

        let err = arg::<String>(&args, "missing").unwrap_err();
        assert!(matches!(err, DseError::InvalidArguments(_)));

        let err = arg::<u32>(&args, "name").unwrap_err();
        assert!(matches!(err, DseError::InvalidArguments(_)));
    }
}
