//! In-process transport.
//!
//! Every node sharing one `LocalTransport` sees the same topics, which makes a
//! multi-node cluster inside a single process. Each started server owns a
//! dispatch loop; every message is handled on its own task so slow handlers
//! never block the loop.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::seq::IndexedRandom;
use serde_json::Value;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, trace, warn, Instrument};

use super::{
    dispatch, version_is_compatible, Endpoints, RpcContext, RpcServer, Target, Transport,
    TransportError, TransportResult,
};

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

struct Envelope {
    ctx: RpcContext,
    namespace: Option<String>,
    method: String,
    args: Value,
    reply: Option<oneshot::Sender<TransportResult<Value>>>,
}

#[derive(Clone)]
struct Subscription {
    id: u64,
    server: Option<String>,
    version: String,
    sender: mpsc::UnboundedSender<Envelope>,
}

#[derive(Default)]
struct Bus {
    topics: DashMap<String, Vec<Subscription>>,
    next_id: AtomicU64,
}

impl Bus {
    fn subscribe(&self, topic: &str, sub: Subscription) {
        self.topics.entry(topic.to_string()).or_default().push(sub);
    }

    fn unsubscribe(&self, topic: &str, id: u64) {
        if let Some(mut subs) = self.topics.get_mut(topic) {
            subs.retain(|s| s.id != id);
        }
        self.topics.remove_if(topic, |_, subs| subs.is_empty());
    }

    /// Listeners matching the target's topic and server, cloned out so no
    /// map guard is held across an await.
    fn listeners(&self, target: &Target) -> Vec<Subscription> {
        let Some(subs) = self.topics.get(&target.topic) else {
            return Vec::new();
        };
        subs.iter()
            .filter(|s| match &target.server {
                Some(server) => s.server.as_deref() == Some(server.as_str()),
                None => true,
            })
            .cloned()
            .collect()
    }
}

/// In-process implementation of [`Transport`].
#[derive(Clone)]
pub struct LocalTransport {
    bus: Arc<Bus>,
    default_timeout: Duration,
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_CALL_TIMEOUT)
    }

    pub fn with_timeout(default_timeout: Duration) -> Self {
        Self {
            bus: Arc::new(Bus::default()),
            default_timeout,
        }
    }

    /// Number of started servers currently listening on `topic`.
    pub fn listener_count(&self, topic: &str) -> usize {
        self.bus.topics.get(topic).map(|s| s.len()).unwrap_or(0)
    }

    fn pick_one(target: &Target, listeners: &[Subscription]) -> TransportResult<Subscription> {
        let compatible: Vec<&Subscription> = listeners
            .iter()
            .filter(|s| version_is_compatible(&s.version, &target.version))
            .collect();
        if compatible.is_empty() {
            return match listeners.first() {
                Some(s) => Err(TransportError::IncompatibleVersion {
                    requested: target.version.clone(),
                    available: s.version.clone(),
                }),
                None => Err(TransportError::DeliveryFailure(format!(
                    "no server listening on {target}"
                ))),
            };
        }
        compatible
            .choose(&mut rand::rng())
            .map(|s| (*s).clone())
            .ok_or_else(|| TransportError::DeliveryFailure(format!("no server for {target}")))
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn listen(&self, target: Target, endpoints: Endpoints) -> TransportResult<Arc<dyn RpcServer>> {
        if target.fanout {
            return Err(TransportError::DeliveryFailure(format!(
                "cannot listen on fanout target {target}"
            )));
        }
        let id = self.bus.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(LocalRpcServer {
            id,
            target,
            endpoints,
            bus: self.bus.clone(),
            state: Mutex::new(ServerState::default()),
        }))
    }

    async fn call(
        &self,
        target: &Target,
        ctx: &RpcContext,
        method: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> TransportResult<Value> {
        if target.fanout {
            return Err(TransportError::DeliveryFailure(format!(
                "fanout target {target} does not accept calls"
            )));
        }
        let sub = Self::pick_one(target, &self.bus.listeners(target))?;

        let (tx, rx) = oneshot::channel();
        sub.sender
            .send(Envelope {
                ctx: ctx.clone(),
                namespace: target.namespace.clone(),
                method: method.to_string(),
                args,
                reply: Some(tx),
            })
            .map_err(|_| TransportError::DeliveryFailure(format!("server for {target} is gone")))?;

        let timeout = timeout.unwrap_or(self.default_timeout);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::DeliveryFailure(format!(
                "server for {target} stopped before replying to '{method}'"
            ))),
            Err(_) => Err(TransportError::Timeout {
                target: target.to_string(),
                method: method.to_string(),
                timeout,
            }),
        }
    }

    async fn cast(
        &self,
        target: &Target,
        ctx: &RpcContext,
        method: &str,
        args: Value,
    ) -> TransportResult<()> {
        let listeners = self.bus.listeners(target);

        if !target.fanout {
            let sub = Self::pick_one(target, &listeners)?;
            return sub
                .sender
                .send(Envelope {
                    ctx: ctx.clone(),
                    namespace: target.namespace.clone(),
                    method: method.to_string(),
                    args,
                    reply: None,
                })
                .map_err(|_| {
                    TransportError::DeliveryFailure(format!("server for {target} is gone"))
                });
        }

        if listeners.is_empty() {
            trace!("Fanout cast '{}' on {} reached no listeners", method, target);
        }
        for sub in listeners {
            if !version_is_compatible(&sub.version, &target.version) {
                warn!(
                    "Dropping fanout '{}' for {:?}: version {} incompatible with {}",
                    method, sub.server, target.version, sub.version
                );
                continue;
            }
            // A listener stopping concurrently is not a delivery failure for a fanout.
            let _ = sub.sender.send(Envelope {
                ctx: ctx.clone(),
                namespace: target.namespace.clone(),
                method: method.to_string(),
                args: args.clone(),
                reply: None,
            });
        }
        Ok(())
    }
}

#[derive(Default)]
struct ServerState {
    started: bool,
    shutdown: Option<watch::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

struct LocalRpcServer {
    id: u64,
    target: Target,
    endpoints: Endpoints,
    bus: Arc<Bus>,
    state: Mutex<ServerState>,
}

async fn handle_envelope(endpoints: Endpoints, env: Envelope) {
    let Envelope {
        ctx,
        namespace,
        method,
        args,
        reply,
    } = env;

    let result = dispatch(&endpoints, namespace.as_deref(), &ctx, &method, args).await;
    match reply {
        Some(reply) => {
            let _ = reply.send(result.map_err(|e| TransportError::Remote {
                code: e.code().to_string(),
                message: e.detail(),
            }));
        }
        None => {
            if let Err(e) = result {
                debug!("Cast '{}' from {} failed: {}", method, ctx.node_id, e);
            }
        }
    }
}

#[async_trait]
impl RpcServer for LocalRpcServer {
    fn target(&self) -> &Target {
        &self.target
    }

    async fn start(&self) -> TransportResult<()> {
        let mut state = self.state.lock();
        if state.started {
            return Ok(());
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(());
        self.bus.subscribe(
            &self.target.topic,
            Subscription {
                id: self.id,
                server: self.target.server.clone(),
                version: self.target.version.clone(),
                sender: tx,
            },
        );

        let endpoints = self.endpoints.clone();
        let span = tracing::debug_span!("rpc_server", target = %self.target);
        let handle = tokio::spawn(
            async move {
                let mut inflight = JoinSet::new();
                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        msg = rx.recv() => match msg {
                            Some(env) => {
                                inflight.spawn(handle_envelope(endpoints.clone(), env));
                            }
                            None => break,
                        },
                        Some(_) = inflight.join_next(), if !inflight.is_empty() => {}
                    }
                }
                while inflight.join_next().await.is_some() {}
                trace!("RPC server loop finished");
            }
            .instrument(span),
        );

        state.started = true;
        state.shutdown = Some(shutdown_tx);
        state.handle = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        self.bus.unsubscribe(&self.target.topic, self.id);
        if let Some(shutdown) = self.state.lock().shutdown.take() {
            let _ = shutdown.send(());
        }
    }

    async fn wait(&self) {
        let handle = self.state.lock().handle.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("RPC server loop for {} panicked: {}", self.target, e);
            }
        }
    }
}
