//! Service contract shared by everything a node hosts.

use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;

use crate::{
    error::{DseError, DseResult},
    node::DseNode,
    policy::PolicyEngine,
    transport::Endpoints,
};

/// State every service carries: its id and the back-reference to the node
/// it was registered on.
pub struct ServiceBase {
    service_id: String,
    node: OnceLock<Weak<DseNode>>,
}

impl ServiceBase {
    pub fn new(service_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            node: OnceLock::new(),
        }
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Ids with a leading underscore are internal and left out of default
    /// listings.
    pub fn is_hidden(&self) -> bool {
        self.service_id.starts_with('_')
    }

    pub fn is_attached(&self) -> bool {
        self.node.get().is_some()
    }

    /// Set the owning node. A service belongs to at most one node, ever.
    pub(crate) fn attach(&self, node: &Arc<DseNode>) -> DseResult<()> {
        self.node.set(Arc::downgrade(node)).map_err(|_| {
            DseError::Lifecycle(format!(
                "service '{}' already belongs to a node",
                self.service_id
            ))
        })
    }

    /// Owning node, if attached and still alive.
    pub fn node(&self) -> Option<Arc<DseNode>> {
        self.node.get().and_then(Weak::upgrade)
    }

    pub(crate) fn require_node(&self) -> DseResult<Arc<DseNode>> {
        self.node().ok_or_else(|| {
            DseError::Lifecycle(format!(
                "service '{}' is not attached to a running node",
                self.service_id
            ))
        })
    }
}

impl std::fmt::Debug for ServiceBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceBase")
            .field("service_id", &self.service_id)
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// A named unit of functionality hosted by one node and addressable through
/// its own service topic.
///
/// All hooks default to no-ops. Implementations must be safe under
/// concurrent RPC dispatch.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    fn base(&self) -> &ServiceBase;

    fn service_id(&self) -> &str {
        self.base().service_id()
    }

    /// Endpoints served on this service's topic.
    fn rpc_endpoints(self: Arc<Self>) -> Endpoints;

    async fn start(&self) -> DseResult<()> {
        Ok(())
    }

    async fn stop(&self) -> DseResult<()> {
        Ok(())
    }

    async fn wait(&self) {}

    /// Set only by services that front a policy engine.
    fn as_policy_engine(self: Arc<Self>) -> Option<Arc<dyn PolicyEngine>> {
        None
    }
}
