//! # UDP Backend
//!
//! The production [`NetworkNode`]: one UDP socket carrying bincode
//! [`Envelope`]s, with the [`DhtNode`] and [`OverlayNode`] engines running on
//! top of it.
//!
//! ## Tasks
//!
//! | Task | Purpose |
//! |------|---------|
//! | receive loop | decode envelopes, answer DHT requests, complete pending requests, feed overlay and datagram queue |
//! | DHT maintenance | expire provider and value records |
//! | overlay heartbeat | learn peers from the routing table, re-announce subscriptions |
//!
//! Requests are correlated by a per-node `u64` id. A reply is matched to its
//! pending request through a oneshot channel; the pending entry is removed
//! when the caller gives up, whether by timeout or cancellation.
//!
//! The address a packet arrived from is trusted over the address a peer
//! claims for itself, so peers behind wildcard binds remain reachable.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::config::NodeConfig;
use crate::context::OpContext;
use crate::dht::{DhtNode, Key, ValueRecord};
use crate::error::{NetError, Result};
use crate::identity::{Identity, Keypair, PeerAddress};
use crate::messages::{
    DhtRequest, DhtResponse, Envelope, MAX_DATAGRAM_SIZE, OverlayMessage, decode_envelope,
    encode_envelope,
};
use crate::node::{
    DATAGRAM_QUEUE, Datagram, Lifecycle, NetworkNode, NodeTask, NodeTelemetry, TakeOnce,
    shutdown_requested,
};
use crate::overlay::{OverlayNode, Subscription};
use crate::protocols::{DhtRpc, OverlayRpc};

// ============================================================================
// Request Correlation
// ============================================================================

struct RpcShared {
    socket: Arc<UdpSocket>,
    local: PeerAddress,
    pending: StdMutex<HashMap<u64, oneshot::Sender<DhtResponse>>>,
    next_id: AtomicU64,
    request_timeout: Duration,
}

/// DHT and overlay RPC over the node's socket.
#[derive(Clone)]
pub struct UdpRpc {
    inner: Arc<RpcShared>,
}

/// Removes a pending request when the caller stops waiting.
struct PendingGuard<'a> {
    rpc: &'a UdpRpc,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.rpc.pending().remove(&self.id);
    }
}

impl UdpRpc {
    fn new(socket: Arc<UdpSocket>, local: PeerAddress, request_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(RpcShared {
                socket,
                local,
                pending: StdMutex::new(HashMap::new()),
                next_id: AtomicU64::new(rand::random()),
                request_timeout,
            }),
        }
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<DhtResponse>>> {
        self.inner.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn send_envelope(&self, to: &PeerAddress, envelope: &Envelope) -> Result<()> {
        let bytes = encode_envelope(envelope)?;
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(NetError::Transport(format!(
                "envelope of {} bytes exceeds datagram limit",
                bytes.len()
            )));
        }
        self.inner
            .socket
            .send_to(&bytes, to.address.as_str())
            .await
            .map_err(|e| NetError::Transport(format!("send to {}: {e}", to.address)))?;
        Ok(())
    }

    async fn request(&self, to: &PeerAddress, body: DhtRequest) -> Result<DhtResponse> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending().insert(id, tx);
        let _guard = PendingGuard { rpc: self, id };

        let envelope = Envelope::Request {
            id,
            from: self.inner.local.clone(),
            body,
        };
        self.send_envelope(to, &envelope).await?;

        match tokio::time::timeout(self.inner.request_timeout, rx).await {
            Ok(Ok(DhtResponse::Rejected(reason))) => {
                Err(NetError::Transport(format!("request rejected: {reason}")))
            }
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(NetError::Closed),
            Err(_) => Err(NetError::Timeout),
        }
    }

    fn complete(&self, id: u64, response: DhtResponse) {
        let waiter = self.pending().remove(&id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => trace!(id, "response for unknown or expired request"),
        }
    }

    /// Fail every outstanding request with `Closed`.
    fn fail_pending(&self) {
        self.pending().clear();
    }
}

fn unexpected(response: DhtResponse) -> NetError {
    NetError::Codec(format!("unexpected response {response:?}"))
}

#[async_trait]
impl DhtRpc for UdpRpc {
    async fn ping(&self, to: &PeerAddress) -> Result<()> {
        match self.request(to, DhtRequest::Ping).await? {
            DhtResponse::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn find_node(&self, to: &PeerAddress, target: Identity) -> Result<Vec<PeerAddress>> {
        match self.request(to, DhtRequest::FindNode { target }).await? {
            DhtResponse::Nodes(nodes) => Ok(nodes),
            other => Err(unexpected(other)),
        }
    }

    async fn find_value(
        &self,
        to: &PeerAddress,
        key: Key,
    ) -> Result<(Option<ValueRecord>, Vec<PeerAddress>)> {
        match self.request(to, DhtRequest::FindValue { key }).await? {
            DhtResponse::Value { record, closer } => Ok((record, closer)),
            other => Err(unexpected(other)),
        }
    }

    async fn store(&self, to: &PeerAddress, key: Key, record: ValueRecord) -> Result<()> {
        match self.request(to, DhtRequest::Store { key, record }).await? {
            DhtResponse::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn add_provider(&self, to: &PeerAddress, key: Key) -> Result<()> {
        match self.request(to, DhtRequest::AddProvider { key }).await? {
            DhtResponse::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn get_providers(
        &self,
        to: &PeerAddress,
        key: Key,
    ) -> Result<(Vec<PeerAddress>, Vec<PeerAddress>)> {
        match self.request(to, DhtRequest::GetProviders { key }).await? {
            DhtResponse::Providers { providers, closer } => Ok((providers, closer)),
            other => Err(unexpected(other)),
        }
    }
}

#[async_trait]
impl OverlayRpc for UdpRpc {
    async fn send_overlay(&self, to: &PeerAddress, message: OverlayMessage) -> Result<()> {
        let envelope = Envelope::Overlay {
            from: self.inner.local.clone(),
            body: message,
        };
        self.send_envelope(to, &envelope).await
    }
}

// ============================================================================
// Receive Loop
// ============================================================================

#[derive(Clone)]
struct Dispatcher {
    socket: Arc<UdpSocket>,
    rpc: UdpRpc,
    dht: DhtNode<UdpRpc>,
    overlay: OverlayNode<UdpRpc>,
    datagrams: mpsc::Sender<Datagram>,
}

impl Dispatcher {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, src) = tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(r) => r,
                    Err(e) => {
                        debug!(error = %e, "udp receive failed");
                        continue;
                    }
                },
            };
            match decode_envelope(&buf[..len]) {
                Ok(envelope) => self.dispatch(envelope, src).await,
                Err(e) => debug!(%src, error = %e, "dropping malformed packet"),
            }
        }
        trace!("udp receive loop stopped");
    }

    async fn dispatch(&self, envelope: Envelope, src: SocketAddr) {
        let from = PeerAddress::new(envelope.sender().peer_id, src.to_string());
        if !from.peer_id.is_valid() || from.peer_id == self.dht.identity() {
            debug!(%src, "dropping packet with invalid sender id");
            return;
        }

        match envelope {
            Envelope::Request { id, body, .. } => {
                let response = self.answer(&from, body).await;
                let reply = Envelope::Response {
                    id,
                    from: self.dht.self_addr().clone(),
                    body: response,
                };
                if let Err(e) = self.rpc.send_envelope(&from, &reply).await {
                    debug!(peer = %from, error = %e, "failed to send response");
                }
            }
            Envelope::Response { id, body, .. } => self.rpc.complete(id, body),
            Envelope::Overlay { body, .. } => {
                self.overlay.observe_peer(&from).await;
                self.overlay.handle_message(&from, body).await;
            }
            Envelope::Datagram { payload, .. } => {
                if self.datagrams.try_send(Datagram { from, payload }).is_err() {
                    trace!("datagram queue full, dropping");
                }
            }
        }
    }

    async fn answer(&self, from: &PeerAddress, request: DhtRequest) -> DhtResponse {
        match request {
            DhtRequest::Ping => {
                self.dht.handle_ping(from).await;
                DhtResponse::Pong
            }
            DhtRequest::FindNode { target } => {
                DhtResponse::Nodes(self.dht.handle_find_node(from, target).await)
            }
            DhtRequest::FindValue { key } => {
                let (record, closer) = self.dht.handle_find_value(from, key).await;
                DhtResponse::Value { record, closer }
            }
            DhtRequest::Store { key, record } => {
                match self.dht.handle_store(from, key, record).await {
                    Ok(()) => DhtResponse::Ack,
                    Err(e) => DhtResponse::Rejected(e.to_string()),
                }
            }
            DhtRequest::AddProvider { key } => {
                self.dht.handle_add_provider(from, key).await;
                DhtResponse::Ack
            }
            DhtRequest::GetProviders { key } => {
                let (providers, closer) = self.dht.handle_get_providers(from, key).await;
                DhtResponse::Providers { providers, closer }
            }
        }
    }
}

/// Introduce routing-table peers to the overlay.
async fn sync_overlay_peers(dht: &DhtNode<UdpRpc>, overlay: &OverlayNode<UdpRpc>) {
    for peer in dht.routing_peers().await {
        overlay.observe_peer(&peer).await;
    }
}

async fn overlay_heartbeat(
    dht: DhtNode<UdpRpc>,
    overlay: OverlayNode<UdpRpc>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            _ = ticker.tick() => {
                sync_overlay_peers(&dht, &overlay).await;
                overlay.announce_all().await;
            }
        }
    }
    trace!("overlay heartbeat stopped");
}

// ============================================================================
// Node
// ============================================================================

pub struct UdpNode {
    config: NodeConfig,
    local_addr: SocketAddr,
    rpc: UdpRpc,
    dht: DhtNode<UdpRpc>,
    overlay: OverlayNode<UdpRpc>,
    lifecycle: Lifecycle,
    datagram_tx: mpsc::Sender<Datagram>,
    datagrams: TakeOnce<Datagram>,
}

impl UdpNode {
    /// Bind the first listen address. The node does nothing until started.
    pub async fn bind(keypair: &Keypair, config: NodeConfig) -> Result<Self> {
        config.validate()?;
        let listen = config
            .listen_addrs
            .first()
            .ok_or_else(|| NetError::InvalidConfig("udp backend needs a listen address".into()))?;
        if config.listen_addrs.len() > 1 {
            warn!(
                extra = config.listen_addrs.len() - 1,
                "udp backend binds only the first listen address"
            );
        }

        let socket = Arc::new(UdpSocket::bind(listen.as_str()).await?);
        let local_addr = socket.local_addr()?;
        let local = PeerAddress::new(keypair.identity(), local_addr.to_string());

        let rpc = UdpRpc::new(socket, local.clone(), config.dht.query_timeout);
        let dht = DhtNode::new(local.clone(), rpc.clone(), config.dht.clone());
        let overlay = OverlayNode::new(local.clone(), rpc.clone(), &config.overlay);
        let (datagram_tx, datagram_rx) = mpsc::channel(DATAGRAM_QUEUE);

        debug!(addr = %local_addr, peer = %keypair.fingerprint(), "udp socket bound");
        Ok(Self {
            config,
            local_addr,
            rpc,
            dht,
            overlay,
            lifecycle: Lifecycle::new(),
            datagram_tx,
            datagrams: tokio::sync::Mutex::new(Some(datagram_rx)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn dht(&self) -> &DhtNode<UdpRpc> {
        &self.dht
    }

    pub fn overlay(&self) -> &OverlayNode<UdpRpc> {
        &self.overlay
    }

    /// Bound `ctx` by the configured request timeout.
    fn request_ctx(&self, ctx: &OpContext) -> OpContext {
        ctx.child_timeout(self.config.request_timeout)
    }

    fn spawn_background(&self) -> Result<()> {
        let shutdown = self.lifecycle.shutdown_signal();
        let dispatcher = Dispatcher {
            socket: self.rpc.inner.socket.clone(),
            rpc: self.rpc.clone(),
            dht: self.dht.clone(),
            overlay: self.overlay.clone(),
            datagrams: self.datagram_tx.clone(),
        };
        let tasks: [NodeTask; 3] = [
            Box::pin(dispatcher.run(shutdown.clone())),
            Box::pin(self.dht.clone().run_maintenance(shutdown.clone())),
            Box::pin(overlay_heartbeat(
                self.dht.clone(),
                self.overlay.clone(),
                self.config.overlay.announce_interval,
                shutdown,
            )),
        ];
        for task in tasks {
            self.lifecycle.spawn(task)?;
        }
        Ok(())
    }
}

impl fmt::Debug for UdpNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpNode")
            .field("local_addr", &self.local_addr)
            .field("phase", &self.lifecycle.phase())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl NetworkNode for UdpNode {
    async fn start(&self, ctx: &OpContext) -> Result<()> {
        ctx.check()?;
        if !self.lifecycle.begin_start()? {
            return Ok(());
        }
        self.spawn_background()?;
        info!(addr = %self.local_addr, peer = %self.peer_id().fingerprint(), "udp node started");

        if !self.config.bootstrap.is_empty() {
            let seeds: Vec<PeerAddress> = self
                .config
                .bootstrap
                .iter()
                .map(|b| b.peer_address())
                .collect();
            let boot_ctx = self.request_ctx(ctx);
            match self.dht.bootstrap(&boot_ctx, &seeds).await {
                Ok(peers) => debug!(routing_peers = peers, "bootstrapped"),
                Err(e) => warn!(error = %e, "bootstrap incomplete, continuing"),
            }
            sync_overlay_peers(&self.dht, &self.overlay).await;
        }
        Ok(())
    }

    async fn close(&self, ctx: &OpContext) -> Result<()> {
        if !self.lifecycle.begin_close() {
            return Ok(());
        }
        self.overlay.close().await;
        self.lifecycle.shutdown(ctx).await;
        self.rpc.fail_pending();
        info!(addr = %self.local_addr, "udp node closed");
        Ok(())
    }

    fn addr(&self) -> PeerAddress {
        self.dht.self_addr().clone()
    }

    fn peer_id(&self) -> Identity {
        self.dht.identity()
    }

    async fn publish(&self, ctx: &OpContext, topic: &str, data: Vec<u8>) -> Result<()> {
        self.lifecycle.ensure_running()?;
        let ctx = self.request_ctx(ctx);
        self.overlay.publish(&ctx, topic, data).await.map(|_| ())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        self.lifecycle.ensure_running()?;
        self.overlay.subscribe(topic).await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.overlay.unsubscribe(topic).await;
        Ok(())
    }

    async fn find_peer(&self, ctx: &OpContext, id: &Identity) -> Result<PeerAddress> {
        self.lifecycle.ensure_running()?;
        self.dht.find_peer(&self.request_ctx(ctx), id).await
    }

    async fn provide(&self, ctx: &OpContext, key: &[u8]) -> Result<()> {
        self.lifecycle.ensure_running()?;
        self.dht.provide(&self.request_ctx(ctx), key).await.map(|_| ())
    }

    async fn find_providers(
        &self,
        ctx: &OpContext,
        key: &[u8],
        limit: usize,
    ) -> Result<Vec<PeerAddress>> {
        self.lifecycle.ensure_running()?;
        self.dht.find_providers(&self.request_ctx(ctx), key, limit).await
    }

    async fn put_value(&self, ctx: &OpContext, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.lifecycle.ensure_running()?;
        self.dht.put(&self.request_ctx(ctx), key, value).await.map(|_| ())
    }

    async fn get_value(&self, ctx: &OpContext, key: &[u8]) -> Result<Vec<u8>> {
        self.lifecycle.ensure_running()?;
        self.dht.get(&self.request_ctx(ctx), key).await
    }

    async fn send_datagram(&self, to: &PeerAddress, payload: Vec<u8>) -> Result<()> {
        self.lifecycle.ensure_running()?;
        let envelope = Envelope::Datagram {
            from: self.dht.self_addr().clone(),
            payload,
        };
        self.rpc.send_envelope(to, &envelope).await
    }

    async fn take_datagrams(&self) -> Option<mpsc::Receiver<Datagram>> {
        self.datagrams.lock().await.take()
    }

    fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.lifecycle.shutdown_signal()
    }

    fn spawn(&self, task: NodeTask) -> Result<()> {
        self.lifecycle.spawn(task)
    }

    async fn telemetry(&self) -> NodeTelemetry {
        let dht = self.dht.telemetry().await;
        NodeTelemetry {
            routing_peers: dht.routing_peers,
            provider_keys: dht.provider_keys,
            stored_values: dht.stored_values,
            subscriptions: self.overlay.registry().topics().await.len(),
            overlay_peers: self.overlay.known_peers().await,
            background_tasks: self.lifecycle.task_count(),
        }
    }
}
