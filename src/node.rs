//! DSE node: one addressable process hosting an ordered set of services.
//!
//! A node owns one control RPC server (`congress-control`, server =
//! `node_id`) plus one RPC server per hosted service
//! (`congress-service-<id>`, server = `node_id`). Services start in
//! registration order with the control bus always first, and servers are
//! stopped before the services they front.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock, Weak,
    },
    time::Duration,
};

use async_trait::async_trait;
use data_connector::{DatasourceId, DatasourceRegistry};
use futures::future::join_all;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::{
    control_bus::{ControlBus, ControlBusConfig, DseStatus},
    datasource::{sync, DataSourceService, DriverCatalog, SyncReport},
    error::{DseError, DseResult},
    service::Service,
    transport::{Endpoints, RpcContext, RpcEndpoint, RpcServer, Target, Transport},
};

/// How a hosted service got onto the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ServiceOrigin {
    /// Registered by the caller before start.
    Registered,
    /// Instantiated by datasource reconciliation.
    Datasource { ds_id: DatasourceId },
}

#[derive(Clone)]
struct ServiceEntry {
    service: Arc<dyn Service>,
    server: Arc<dyn RpcServer>,
    origin: ServiceOrigin,
}

/// Registry and driver catalog a node reconciles its datasource services
/// against.
#[derive(Clone)]
pub(crate) struct DatasourceContext {
    pub registry: Arc<dyn DatasourceRegistry>,
    pub catalog: Arc<DriverCatalog>,
}

pub struct DseNode {
    node_id: String,
    instance: String,
    transport: Arc<dyn Transport>,
    rpc_timeout: Option<Duration>,
    control_server: Arc<dyn RpcServer>,
    control_bus: Arc<ControlBus>,
    services: RwLock<Vec<ServiceEntry>>,
    // Serializes start/stop and dynamic attach/detach.
    lifecycle: Mutex<()>,
    // Serializes datasource reconciliation.
    sync_lock: Mutex<()>,
    started: AtomicBool,
    running: AtomicBool,
    datasources: Option<DatasourceContext>,
}

impl fmt::Debug for DseNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DseNode")
            .field("node_id", &self.node_id)
            .field("instance", &self.instance)
            .field("running", &self.is_running())
            .finish()
    }
}

pub struct DseNodeBuilder {
    node_id: String,
    transport: Arc<dyn Transport>,
    endpoints: Endpoints,
    rpc_timeout: Option<Duration>,
    control_bus: ControlBusConfig,
    datasources: Option<DatasourceContext>,
}

impl DseNodeBuilder {
    /// Extra node-level endpoints served on the control topic.
    pub fn endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = Some(timeout);
        self
    }

    pub fn control_bus(mut self, config: ControlBusConfig) -> Self {
        self.control_bus = config;
        self
    }

    /// Enable datasource reconciliation against `registry`.
    pub fn datasources(
        mut self,
        registry: Arc<dyn DatasourceRegistry>,
        catalog: Arc<DriverCatalog>,
    ) -> Self {
        self.datasources = Some(DatasourceContext { registry, catalog });
        self
    }

    pub fn build(self) -> DseResult<Arc<DseNode>> {
        if self.node_id.is_empty() {
            return Err(DseError::BadConfig("node_id must not be empty".into()));
        }

        let control = Arc::new(NodeControl {
            node: OnceLock::new(),
        });
        let mut endpoints: Endpoints = vec![control.clone()];
        endpoints.extend(self.endpoints);
        let control_server = self
            .transport
            .listen(Target::node(Some(&self.node_id)), endpoints)?;

        let control_bus = Arc::new(ControlBus::new(self.control_bus));
        let node = Arc::new(DseNode {
            instance: uuid::Uuid::new_v4().to_string(),
            node_id: self.node_id,
            transport: self.transport,
            rpc_timeout: self.rpc_timeout,
            control_server,
            control_bus: control_bus.clone(),
            services: RwLock::new(Vec::new()),
            lifecycle: Mutex::new(()),
            sync_lock: Mutex::new(()),
            started: AtomicBool::new(false),
            running: AtomicBool::new(false),
            datasources: self.datasources,
        });
        let _ = control.node.set(Arc::downgrade(&node));

        node.register_service(control_bus, None)?;
        debug!("Created node {:?}", node);
        Ok(node)
    }
}

impl DseNode {
    pub fn builder(node_id: impl Into<String>, transport: Arc<dyn Transport>) -> DseNodeBuilder {
        DseNodeBuilder {
            node_id: node_id.into(),
            transport,
            endpoints: Vec::new(),
            rpc_timeout: None,
            control_bus: ControlBusConfig::default(),
            datasources: None,
        }
    }

    /// Node with default settings and no datasource reconciliation.
    pub fn new(
        transport: Arc<dyn Transport>,
        node_id: impl Into<String>,
        endpoints: Endpoints,
    ) -> DseResult<Arc<Self>> {
        Self::builder(node_id, transport).endpoints(endpoints).build()
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Random id regenerated on every process start.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn control_bus(&self) -> &Arc<ControlBus> {
        &self.control_bus
    }

    fn rpc_context(&self) -> RpcContext {
        RpcContext {
            node_id: self.node_id.clone(),
            instance: self.instance.clone(),
        }
    }

    /// Attach `service` before the node starts, at `index` or appended.
    pub fn register_service(
        self: &Arc<Self>,
        service: Arc<dyn Service>,
        index: Option<usize>,
    ) -> DseResult<()> {
        let service_id = service.service_id().to_string();
        let mut services = self.services.write();
        if self.started.load(Ordering::SeqCst) {
            return Err(DseError::Lifecycle(format!(
                "cannot register service '{service_id}' on node '{}' after start",
                self.node_id
            )));
        }
        if service.base().is_attached() {
            return Err(DseError::Lifecycle(format!(
                "service '{service_id}' already belongs to a node"
            )));
        }
        if services.iter().any(|e| e.service.service_id() == service_id) {
            return Err(DseError::ServiceAlreadyExists(service_id));
        }

        let server = self.transport.listen(
            Target::service(&service_id, Some(&self.node_id)),
            service.clone().rpc_endpoints(),
        )?;
        service.base().attach(self)?;

        let entry = ServiceEntry {
            service,
            server,
            origin: ServiceOrigin::Registered,
        };
        // Nothing goes ahead of the control bus.
        let floor = usize::from(!services.is_empty());
        let index = index
            .unwrap_or(services.len())
            .clamp(floor, services.len());
        services.insert(index, entry);
        debug!("Registered service {} on node {}", service_id, self.node_id);
        Ok(())
    }

    /// Attached services in registration order; ids starting with `_` are
    /// left out unless `hidden`.
    pub fn get_services(&self, hidden: bool) -> Vec<Arc<dyn Service>> {
        self.services
            .read()
            .iter()
            .filter(|e| hidden || !e.service.base().is_hidden())
            .map(|e| e.service.clone())
            .collect()
    }

    pub fn service_object(&self, service_id: &str) -> Option<Arc<dyn Service>> {
        self.services
            .read()
            .iter()
            .find(|e| e.service.service_id() == service_id)
            .map(|e| e.service.clone())
    }

    /// Running datasource services as `(service id, datasource id)`.
    pub(crate) fn datasource_services(&self) -> Vec<(String, DatasourceId)> {
        self.services
            .read()
            .iter()
            .filter_map(|e| match &e.origin {
                ServiceOrigin::Datasource { ds_id } => {
                    Some((e.service.service_id().to_string(), ds_id.clone()))
                }
                ServiceOrigin::Registered => None,
            })
            .collect()
    }

    /// Start the control server, then every service followed by its server.
    ///
    /// If any step fails, whatever already started is stopped again before
    /// the error is returned. The node stays spent either way: a second
    /// `start` is a lifecycle error, and `wait` still joins cleanly.
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    pub async fn start(self: &Arc<Self>) -> DseResult<()> {
        {
            let _lifecycle = self.lifecycle.lock().await;
            let entries = {
                let services = self.services.write();
                if self.started.swap(true, Ordering::SeqCst) {
                    return Err(DseError::Lifecycle(format!(
                        "node '{}' already started",
                        self.node_id
                    )));
                }
                services.clone()
            };
            info!(
                "Node {} starting with {} services",
                self.node_id,
                entries.len()
            );

            let mut launched = 0;
            if let Err(e) = self.start_entries(&entries, &mut launched).await {
                error!("Node {} failed to start: {}", self.node_id, e);
                self.abort_start(&entries[..launched]).await;
                return Err(e);
            }
            self.running.store(true, Ordering::SeqCst);
            info!("Node {} started (instance {})", self.node_id, self.instance);
        }

        if self.datasources.is_some() {
            if let Err(e) = self.synchronize_datasources().await {
                warn!("Initial datasource synchronization failed: {}", e);
            }
        }
        Ok(())
    }

    async fn start_entries(&self, entries: &[ServiceEntry], launched: &mut usize) -> DseResult<()> {
        self.control_server.start().await?;
        for entry in entries {
            trace!("Starting service {}", entry.service.service_id());
            entry.service.start().await?;
            *launched += 1;
            entry.server.start().await?;
        }
        Ok(())
    }

    /// Undo a partial start. `launched` holds the services whose start hook
    /// succeeded.
    async fn abort_start(&self, launched: &[ServiceEntry]) {
        for entry in launched {
            entry.server.stop().await;
        }
        for entry in launched {
            if let Err(e) = entry.service.stop().await {
                warn!(
                    "Service {} failed to stop after aborted start: {}",
                    entry.service.service_id(),
                    e
                );
            }
        }
        self.control_server.stop().await;
    }

    /// Stop every service server, then every service, then the control
    /// server. All steps run even if a service stop hook fails; the first
    /// such failure is returned.
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    pub async fn stop(&self) -> DseResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let entries = self.services.read().clone();

        for entry in &entries {
            entry.server.stop().await;
        }
        let mut first_error = None;
        for entry in &entries {
            if let Err(e) = entry.service.stop().await {
                warn!(
                    "Service {} failed to stop: {}",
                    entry.service.service_id(),
                    e
                );
                first_error.get_or_insert(e);
            }
        }
        self.control_server.stop().await;
        self.running.store(false, Ordering::SeqCst);
        info!("Node {} stopped", self.node_id);

        first_error.map_or(Ok(()), Err)
    }

    /// Block until every service and the control server finished.
    pub async fn wait(&self) {
        let entries = self.services.read().clone();
        join_all(entries.iter().map(|entry| async move {
            entry.server.wait().await;
            entry.service.wait().await;
        }))
        .await;
        self.control_server.wait().await;
    }

    /// Last control bus snapshot; never blocks, may be stale.
    pub fn dse_status(&self) -> DseStatus {
        self.control_bus.status(&self.node_id, &self.instance)
    }

    /// Request/response on the control topic of `node_id`.
    pub async fn invoke_node_rpc(
        &self,
        node_id: &str,
        method: &str,
        kwargs: Value,
    ) -> DseResult<Value> {
        let target = Target::node(Some(node_id));
        trace!("<{}> call {} on {}", self.node_id, method, target);
        let reply = self
            .transport
            .call(&target, &self.rpc_context(), method, kwargs, self.rpc_timeout)
            .await?;
        Ok(reply)
    }

    /// Fanout cast on the control topic. Only delivery failures surface.
    pub async fn broadcast_node_rpc(&self, method: &str, kwargs: Value) -> DseResult<()> {
        let target = Target::node_fanout();
        trace!("<{}> broadcast {} on {}", self.node_id, method, target);
        self.transport
            .cast(&target, &self.rpc_context(), method, kwargs)
            .await?;
        Ok(())
    }

    /// Request/response on any one instance of `service_id`.
    pub async fn invoke_service_rpc(
        &self,
        service_id: &str,
        method: &str,
        kwargs: Value,
    ) -> DseResult<Value> {
        let target = Target::service(service_id, None);
        trace!("<{}> call {} on {}", self.node_id, method, target);
        let reply = self
            .transport
            .call(&target, &self.rpc_context(), method, kwargs, self.rpc_timeout)
            .await?;
        Ok(reply)
    }

    /// Fanout cast to every instance of `service_id`.
    pub async fn broadcast_service_rpc(
        &self,
        service_id: &str,
        method: &str,
        kwargs: Value,
    ) -> DseResult<()> {
        let target = Target::service_fanout(service_id);
        trace!("<{}> broadcast {} on {}", self.node_id, method, target);
        self.transport
            .cast(&target, &self.rpc_context(), method, kwargs)
            .await?;
        Ok(())
    }

    /// Reconcile local datasource services with the registry. A node built
    /// without a registry has nothing to reconcile.
    ///
    /// Any per record failure turns into one `DataServiceError`; use
    /// [`reconcile_datasources`](Self::reconcile_datasources) to tell them
    /// apart.
    pub async fn synchronize_datasources(self: &Arc<Self>) -> DseResult<()> {
        self.reconcile_datasources().await?.into_result()
    }

    /// Reconcile and report the outcome per datasource.
    pub async fn reconcile_datasources(self: &Arc<Self>) -> DseResult<SyncReport> {
        let Some(ctx) = self.datasources.clone() else {
            return Ok(SyncReport::default());
        };
        let _sync = self.sync_lock.lock().await;
        sync::synchronize(self, &ctx).await
    }

    /// Attach a datasource service created by reconciliation, starting it
    /// right away when the node is running.
    pub(crate) async fn attach_datasource_service(
        self: &Arc<Self>,
        service: Arc<DataSourceService>,
    ) -> DseResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let service_id = service.service_id().to_string();
        let entry = {
            let mut services = self.services.write();
            if let Some(existing) = services.iter().find(|e| e.service.service_id() == service_id) {
                return Err(match existing.origin {
                    ServiceOrigin::Datasource { .. } => DseError::ServiceAlreadyExists(service_id),
                    ServiceOrigin::Registered => DseError::DataServiceError(format!(
                        "service id '{service_id}' is taken by a node service"
                    )),
                });
            }
            let server = self.transport.listen(
                Target::service(&service_id, Some(&self.node_id)),
                service.clone().rpc_endpoints(),
            )?;
            service.base().attach(self)?;
            let entry = ServiceEntry {
                origin: ServiceOrigin::Datasource {
                    ds_id: service.ds_id().clone(),
                },
                service: service.clone(),
                server,
            };
            services.push(entry.clone());
            entry
        };

        if self.is_running() {
            let started = match entry.service.start().await {
                Ok(()) => entry.server.start().await.map_err(DseError::from),
                Err(e) => Err(e),
            };
            if let Err(e) = started {
                self.services
                    .write()
                    .retain(|e| e.service.service_id() != service_id);
                entry.server.stop().await;
                let _ = entry.service.stop().await;
                return Err(e);
            }
        }
        info!("Datasource service {} attached", service_id);
        Ok(())
    }

    /// Stop and remove a hosted service: its server first, then the
    /// service itself.
    pub(crate) async fn detach_service(&self, service_id: &str) -> DseResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let entry = {
            let mut services = self.services.write();
            let pos = services
                .iter()
                .position(|e| e.service.service_id() == service_id)
                .ok_or_else(|| {
                    DseError::DataServiceError(format!("service '{service_id}' is not hosted here"))
                })?;
            services.remove(pos)
        };

        entry.server.stop().await;
        entry.server.wait().await;
        let stopped = entry.service.stop().await;
        entry.service.wait().await;
        info!("Service {} detached", service_id);
        stopped
    }
}

/// Built-in endpoint on the control topic.
struct NodeControl {
    node: OnceLock<Weak<DseNode>>,
}

impl NodeControl {
    fn node(&self) -> DseResult<Arc<DseNode>> {
        self.node
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| DseError::Lifecycle("node is shutting down".into()))
    }
}

#[async_trait]
impl RpcEndpoint for NodeControl {
    fn handles(&self, method: &str) -> bool {
        matches!(method, "synchronize_datasources" | "get_status")
    }

    async fn dispatch(&self, ctx: &RpcContext, method: &str, _args: Value) -> DseResult<Value> {
        let node = self.node()?;
        match method {
            "synchronize_datasources" => {
                debug!(
                    "Node {} reconciling datasources at the request of {}",
                    node.node_id, ctx.node_id
                );
                node.synchronize_datasources().await?;
                Ok(Value::Null)
            }
            "get_status" => {
                let services: Vec<String> = node
                    .get_services(true)
                    .iter()
                    .map(|s| s.service_id().to_string())
                    .collect();
                Ok(json!({
                    "node_id": node.node_id,
                    "instance": node.instance,
                    "services": services,
                    "running": node.is_running(),
                }))
            }
            other => Err(DseError::UnsupportedMethod(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex as SyncMutex;

    use super::*;
    use crate::{control_bus::CONTROL_BUS_ID, service::ServiceBase, transport::LocalTransport};

    struct Recorder {
        base: ServiceBase,
        log: Arc<SyncMutex<Vec<String>>>,
    }

    impl Recorder {
        fn new(id: &str, log: &Arc<SyncMutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                base: ServiceBase::new(id),
                log: log.clone(),
            })
        }
    }

    #[async_trait]
    impl Service for Recorder {
        fn base(&self) -> &ServiceBase {
            &self.base
        }

        fn rpc_endpoints(self: Arc<Self>) -> Endpoints {
            Vec::new()
        }

        async fn start(&self) -> DseResult<()> {
            self.log.lock().push(format!("start:{}", self.service_id()));
            Ok(())
        }

        async fn stop(&self) -> DseResult<()> {
            self.log.lock().push(format!("stop:{}", self.service_id()));
            Ok(())
        }
    }

    struct Refuses {
        base: ServiceBase,
    }

    #[async_trait]
    impl Service for Refuses {
        fn base(&self) -> &ServiceBase {
            &self.base
        }

        fn rpc_endpoints(self: Arc<Self>) -> Endpoints {
            Vec::new()
        }

        async fn start(&self) -> DseResult<()> {
            Err(DseError::DataServiceError("refusing to start".into()))
        }
    }

    fn node(id: &str) -> Arc<DseNode> {
        DseNode::new(Arc::new(LocalTransport::new()), id, Vec::new()).unwrap()
    }

    #[tokio::test]
    async fn control_bus_is_registered_first_and_hidden() {
        let node = node("n1");
        let log = Arc::new(SyncMutex::new(Vec::new()));
        node.register_service(Recorder::new("a", &log), None).unwrap();

        let all: Vec<String> = node
            .get_services(true)
            .iter()
            .map(|s| s.service_id().to_string())
            .collect();
        assert_eq!(all, vec![CONTROL_BUS_ID.to_string(), "a".to_string()]);

        let visible: Vec<String> = node
            .get_services(false)
            .iter()
            .map(|s| s.service_id().to_string())
            .collect();
        assert_eq!(visible, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn index_inserts_and_clamps() {
        let node = node("n1");
        let log = Arc::new(SyncMutex::new(Vec::new()));
        node.register_service(Recorder::new("a", &log), None).unwrap();
        node.register_service(Recorder::new("b", &log), Some(1)).unwrap();
        node.register_service(Recorder::new("c", &log), Some(99)).unwrap();

        let ids: Vec<String> = node
            .get_services(false)
            .iter()
            .map(|s| s.service_id().to_string())
            .collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let node = node("n1");
        let log = Arc::new(SyncMutex::new(Vec::new()));
        node.register_service(Recorder::new("a", &log), None).unwrap();
        let err = node
            .register_service(Recorder::new("a", &log), None)
            .unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn start_twice_is_a_lifecycle_error() {
        let node = node("n1");
        node.start().await.unwrap();
        let err = node.start().await.unwrap_err();
        assert!(matches!(err, DseError::Lifecycle(_)));
        node.stop().await.unwrap();
        node.wait().await;
    }

    #[tokio::test]
    async fn stop_runs_hooks_and_clears_running() {
        let node = node("n1");
        let log = Arc::new(SyncMutex::new(Vec::new()));
        node.register_service(Recorder::new("a", &log), None).unwrap();
        node.start().await.unwrap();
        assert!(node.is_running());

        node.stop().await.unwrap();
        node.wait().await;
        assert!(!node.is_running());
        assert_eq!(*log.lock(), vec!["start:a", "stop:a"]);
    }

    #[tokio::test]
    async fn failed_start_stops_what_already_started() {
        let transport = Arc::new(LocalTransport::new());
        let node = DseNode::new(transport.clone(), "n1", Vec::new()).unwrap();
        let peer = DseNode::new(transport, "n2", Vec::new()).unwrap();
        let log = Arc::new(SyncMutex::new(Vec::new()));
        node.register_service(Recorder::new("a", &log), None).unwrap();
        node.register_service(
            Arc::new(Refuses {
                base: ServiceBase::new("refuses"),
            }),
            None,
        )
        .unwrap();
        node.register_service(Recorder::new("c", &log), None).unwrap();

        let err = node.start().await.unwrap_err();
        assert!(matches!(err, DseError::DataServiceError(_)), "{err}");
        assert!(!node.is_running());
        assert_eq!(*log.lock(), vec!["start:a", "stop:a"]);

        // Control server is down again and the heartbeat loop has ended.
        peer.start().await.unwrap();
        assert!(peer.invoke_node_rpc("n1", "get_status", json!({})).await.is_err());
        tokio::time::timeout(Duration::from_secs(2), node.wait())
            .await
            .unwrap();
        assert!(matches!(node.start().await, Err(DseError::Lifecycle(_))));

        peer.stop().await.unwrap();
        peer.wait().await;
    }

    #[tokio::test]
    async fn control_topic_reports_status() {
        let transport = Arc::new(LocalTransport::new());
        let n1 = DseNode::new(transport.clone(), "n1", Vec::new()).unwrap();
        let n2 = DseNode::new(transport, "n2", Vec::new()).unwrap();
        n1.start().await.unwrap();
        n2.start().await.unwrap();

        let status = n1.invoke_node_rpc("n2", "get_status", json!({})).await.unwrap();
        assert_eq!(status["node_id"], "n2");
        assert_eq!(status["instance"], n2.instance());
        assert_eq!(status["running"], true);

        for n in [&n1, &n2] {
            n.stop().await.unwrap();
            n.wait().await;
        }
    }

    #[tokio::test]
    async fn instance_ids_differ_per_node() {
        let a = node("n1");
        let b = node("n1");
        assert_ne!(a.instance(), b.instance());
    }
}
