//! Built-in liveness service.
//!
//! Every node runs one `_control_bus`. Its start hook spawns a heartbeat loop
//! that fanout-casts this node's identity to every control bus in the
//! cluster; incoming heartbeats refresh a peer table that
//! [`DseNode::dse_status`](crate::node::DseNode::dse_status) reads without
//! blocking.

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::{
    error::{DseError, DseResult},
    node::DseNode,
    service::{Service, ServiceBase},
    transport::{arg, Endpoints, RpcContext, RpcEndpoint},
};

pub const CONTROL_BUS_ID: &str = "_control_bus";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlBusConfig {
    pub heartbeat_interval: Duration,
    /// Alive becomes Suspected after this long without a heartbeat, Down
    /// after twice as long. Peers silent for [`PEER_EVICT_FACTOR`] times
    /// this long are forgotten.
    pub peer_timeout: Duration,
}

pub const PEER_EVICT_FACTOR: u32 = 10;

impl Default for ControlBusConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            peer_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    Alive,
    Suspected,
    Down,
}

impl PeerStatus {
    fn from_silence(silence: Duration, timeout: Duration) -> Self {
        if silence > timeout * 2 {
            Self::Down
        } else if silence > timeout {
            Self::Suspected
        } else {
            Self::Alive
        }
    }
}

/// Heartbeat payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_id: String,
    pub instance: String,
    pub services: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub node_id: String,
    pub instance: String,
    pub services: Vec<String>,
    pub last_seen: DateTime<Utc>,
    pub status: PeerStatus,
}

/// Last observed view of the cluster from one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DseStatus {
    pub node_id: String,
    pub instance: String,
    pub peers: BTreeMap<String, PeerInfo>,
    pub updated_at: DateTime<Utc>,
}

struct PeerEntry {
    instance: String,
    services: Vec<String>,
    received: Instant,
    received_at: DateTime<Utc>,
}

#[derive(Default)]
struct LoopHandle {
    shutdown: Option<watch::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

pub struct ControlBus {
    base: ServiceBase,
    config: ControlBusConfig,
    peers: DashMap<String, PeerEntry>,
    heartbeat: Mutex<LoopHandle>,
}

impl ControlBus {
    pub fn new(config: ControlBusConfig) -> Self {
        Self {
            base: ServiceBase::new(CONTROL_BUS_ID),
            config,
            peers: DashMap::new(),
            heartbeat: Mutex::new(LoopHandle::default()),
        }
    }

    /// Record a peer heartbeat. A new instance id for a known node means the
    /// peer process restarted. Every heartbeat also sweeps out long silent
    /// peers; a node hears its own heartbeat, so the sweep runs once per
    /// interval while the bus is up.
    pub fn accept_heartbeat(&self, heartbeat: Heartbeat) {
        self.evict_stale();
        let now = Instant::now();
        let now_at = Utc::now();
        match self.peers.get_mut(&heartbeat.node_id) {
            Some(mut entry) => {
                if entry.instance != heartbeat.instance {
                    info!(
                        "Node {} restarted (instance {} -> {})",
                        heartbeat.node_id, entry.instance, heartbeat.instance
                    );
                    entry.instance = heartbeat.instance;
                }
                entry.services = heartbeat.services;
                entry.received = now;
                entry.received_at = now_at;
            }
            None => {
                info!(
                    "Discovered node {} (instance {})",
                    heartbeat.node_id, heartbeat.instance
                );
                self.peers.insert(
                    heartbeat.node_id,
                    PeerEntry {
                        instance: heartbeat.instance,
                        services: heartbeat.services,
                        received: now,
                        received_at: now_at,
                    },
                );
            }
        }
    }

    /// Drop peers not heard from for `PEER_EVICT_FACTOR * peer_timeout`.
    pub fn evict_stale(&self) -> usize {
        let horizon = self.config.peer_timeout * PEER_EVICT_FACTOR;
        let before = self.peers.len();
        self.peers.retain(|node_id, entry| {
            let keep = entry.received.elapsed() <= horizon;
            if !keep {
                info!("Forgetting node {} (silent for over {:?})", node_id, horizon);
            }
            keep
        });
        before.saturating_sub(self.peers.len())
    }

    pub fn status(&self, node_id: &str, instance: &str) -> DseStatus {
        let peers = self
            .peers
            .iter()
            .map(|entry| {
                let info = PeerInfo {
                    node_id: entry.key().clone(),
                    instance: entry.instance.clone(),
                    services: entry.services.clone(),
                    last_seen: entry.received_at,
                    status: PeerStatus::from_silence(
                        entry.received.elapsed(),
                        self.config.peer_timeout,
                    ),
                };
                (entry.key().clone(), info)
            })
            .collect();
        DseStatus {
            node_id: node_id.to_string(),
            instance: instance.to_string(),
            peers,
            updated_at: Utc::now(),
        }
    }

    fn heartbeat_for(node: &DseNode) -> Heartbeat {
        Heartbeat {
            node_id: node.node_id().to_string(),
            instance: node.instance().to_string(),
            services: node
                .get_services(true)
                .iter()
                .map(|s| s.service_id().to_string())
                .collect(),
            timestamp: Utc::now(),
        }
    }

    #[instrument(skip_all, fields(node_id = %node_id))]
    async fn heartbeat_loop(
        node: std::sync::Weak<DseNode>,
        node_id: String,
        interval: Duration,
        mut signal: watch::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = signal.changed() => {
                    debug!("Heartbeat loop shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let Some(node) = node.upgrade() else { break };
                    let heartbeat = Self::heartbeat_for(&node);
                    let payload = match serde_json::to_value(&heartbeat) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!("Failed to encode heartbeat: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = node
                        .broadcast_service_rpc(CONTROL_BUS_ID, "accept_heartbeat", payload)
                        .await
                    {
                        warn!("Failed to publish heartbeat: {}", e);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Service for ControlBus {
    fn base(&self) -> &ServiceBase {
        &self.base
    }

    fn rpc_endpoints(self: Arc<Self>) -> Endpoints {
        vec![self]
    }

    async fn start(&self) -> DseResult<()> {
        let node = self.base.require_node()?;
        let mut heartbeat = self.heartbeat.lock();
        if heartbeat.handle.is_some() {
            return Err(DseError::Lifecycle("control bus already started".into()));
        }
        let (tx, rx) = watch::channel(());
        heartbeat.handle = Some(tokio::spawn(Self::heartbeat_loop(
            Arc::downgrade(&node),
            node.node_id().to_string(),
            self.config.heartbeat_interval,
            rx,
        )));
        heartbeat.shutdown = Some(tx);
        Ok(())
    }

    async fn stop(&self) -> DseResult<()> {
        if let Some(tx) = self.heartbeat.lock().shutdown.take() {
            let _ = tx.send(());
        }
        Ok(())
    }

    async fn wait(&self) {
        let handle = self.heartbeat.lock().handle.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Heartbeat loop panicked: {}", e);
            }
        }
    }
}

#[async_trait]
impl RpcEndpoint for ControlBus {
    fn handles(&self, method: &str) -> bool {
        matches!(method, "accept_heartbeat" | "get_status")
    }

    async fn dispatch(&self, _ctx: &RpcContext, method: &str, args: Value) -> DseResult<Value> {
        match method {
            "accept_heartbeat" => {
                let heartbeat: Heartbeat = serde_json::from_value(args)
                    .map_err(|e| DseError::InvalidArguments(format!("heartbeat: {e}")))?;
                self.accept_heartbeat(heartbeat);
                Ok(Value::Null)
            }
            "get_status" => {
                let node = self.base.require_node()?;
                let status = node.dse_status();
                let peer: Option<String> = arg(&args, "node_id").ok();
                match peer {
                    Some(peer) => Ok(json!(status.peers.get(&peer))),
                    None => serde_json::to_value(status)
                        .map_err(|e| DseError::DataServiceError(e.to_string())),
                }
            }
            other => Err(DseError::UnsupportedMethod(other.to_string())),
        }
    }
}
