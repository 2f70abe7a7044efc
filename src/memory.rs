//! # In-Memory Backend
//!
//! A [`MemoryNetwork`] is a process-local hub that any number of
//! [`MemoryNode`]s join. It gives the exact [`NetworkNode`] contract without
//! sockets and deterministically:
//!
//! | Capability | Emulation |
//! |------------|-----------|
//! | `find_peer` | direct lookup among started nodes |
//! | provider records / values | one shared, fully replicated store |
//! | publish | fan-out to every node's subscription registry |
//! | datagrams | bounded per-node queues, filtered by the [`LinkFilter`] |
//!
//! A link filter decides the fate of each datagram, which is how stream
//! tests inject loss, corruption and reordering.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::time::Duration;
use tracing::{debug, info, trace};

use crate::config::{DhtConfig, NodeConfig};
use crate::context::OpContext;
use crate::dht::{ProviderStore, ValueRecord, ValueStore, VersionClock, hash_key};
use crate::error::{NetError, Result};
use crate::identity::{Identity, Keypair, PeerAddress};
use crate::node::{
    DATAGRAM_QUEUE, Datagram, Lifecycle, NetworkNode, NodeTask, NodeTelemetry, TakeOnce,
};
use crate::overlay::{Subscription, SubscriptionRegistry, TopicMessage};

/// What happens to one datagram on its way from `from` to `to`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkVerdict {
    Deliver,
    Drop,
    /// Deliver with one byte flipped.
    Corrupt,
    Delay(Duration),
}

/// `(from, to, payload) -> verdict`, consulted for every datagram.
pub type LinkFilter = Arc<dyn Fn(&Identity, &Identity, &[u8]) -> LinkVerdict + Send + Sync>;

#[derive(Clone)]
struct Endpoint {
    address: PeerAddress,
    datagrams: mpsc::Sender<Datagram>,
    registry: Arc<SubscriptionRegistry>,
}

struct NetworkShared {
    dht: DhtConfig,
    endpoints: RwLock<BTreeMap<Identity, Endpoint>>,
    providers: RwLock<ProviderStore>,
    values: RwLock<ValueStore>,
    versions: VersionClock,
    link_filter: StdRwLock<Option<LinkFilter>>,
}

#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkShared>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::with_config(DhtConfig::default())
    }

    /// Use `dht` for record lifetimes and value size limits.
    pub fn with_config(dht: DhtConfig) -> Self {
        Self {
            inner: Arc::new(NetworkShared {
                endpoints: RwLock::new(BTreeMap::new()),
                providers: RwLock::new(ProviderStore::new(dht.provider_ttl)),
                values: RwLock::new(ValueStore::new(dht.value_ttl)),
                versions: VersionClock::new(),
                link_filter: StdRwLock::new(None),
                dht,
            }),
        }
    }

    pub fn set_link_filter<F>(&self, filter: F)
    where
        F: Fn(&Identity, &Identity, &[u8]) -> LinkVerdict + Send + Sync + 'static,
    {
        let mut slot = self.inner.link_filter.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(Arc::new(filter));
    }

    pub fn clear_link_filter(&self) {
        let mut slot = self.inner.link_filter.write().unwrap_or_else(|e| e.into_inner());
        *slot = None;
    }

    fn verdict(&self, from: &Identity, to: &Identity, payload: &[u8]) -> LinkVerdict {
        let filter = self
            .inner
            .link_filter
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match filter {
            Some(f) => f(from, to, payload),
            None => LinkVerdict::Deliver,
        }
    }

    /// Number of started, not yet closed nodes.
    pub async fn node_count(&self) -> usize {
        self.inner.endpoints.read().await.len()
    }

    /// Expire provider and value records now.
    pub async fn expire(&self) -> (usize, usize) {
        let providers = self.inner.providers.write().await.expire();
        let values = self.inner.values.write().await.expire();
        (providers, values)
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryNetwork").finish_non_exhaustive()
    }
}

pub struct MemoryNode {
    network: MemoryNetwork,
    local: PeerAddress,
    lifecycle: Lifecycle,
    registry: Arc<SubscriptionRegistry>,
    datagram_tx: StdMutex<Option<mpsc::Sender<Datagram>>>,
    datagrams: TakeOnce<Datagram>,
    seqno: std::sync::atomic::AtomicU64,
}

impl MemoryNode {
    pub fn new(network: &MemoryNetwork, keypair: &Keypair, config: &NodeConfig) -> Self {
        let identity = keypair.identity();
        let (tx, rx) = mpsc::channel(DATAGRAM_QUEUE);
        Self {
            network: network.clone(),
            local: PeerAddress::new(identity, format!("memory://{}", identity.fingerprint())),
            lifecycle: Lifecycle::new(),
            registry: Arc::new(SubscriptionRegistry::new(config.overlay.delivery_queue)),
            datagram_tx: StdMutex::new(Some(tx)),
            datagrams: tokio::sync::Mutex::new(Some(rx)),
            seqno: std::sync::atomic::AtomicU64::new(0),
        }
    }

    fn deliver_datagram(&self, to: &Endpoint, payload: Vec<u8>) {
        let verdict = self
            .network
            .verdict(&self.local.peer_id, &to.address.peer_id, &payload);
        let datagram = |payload: Vec<u8>| Datagram {
            from: self.local.clone(),
            payload,
        };
        match verdict {
            LinkVerdict::Deliver => {
                if to.datagrams.try_send(datagram(payload)).is_err() {
                    trace!(to = %to.address, "datagram queue full, dropping");
                }
            }
            LinkVerdict::Drop => trace!(to = %to.address, "link filter dropped datagram"),
            LinkVerdict::Corrupt => {
                let mut payload = payload;
                if !payload.is_empty() {
                    let idx = payload.len() / 2;
                    payload[idx] ^= 0xff;
                }
                let _ = to.datagrams.try_send(datagram(payload));
            }
            LinkVerdict::Delay(delay) => {
                let queue = to.datagrams.clone();
                let datagram = datagram(payload);
                let delayed: NodeTask = Box::pin(async move {
                    tokio::time::sleep(delay).await;
                    let _ = queue.try_send(datagram);
                });
                if let Err(e) = self.lifecycle.spawn(delayed) {
                    trace!(error = %e, "delayed datagram discarded");
                }
            }
        }
    }
}

impl fmt::Debug for MemoryNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryNode")
            .field("addr", &self.local.address)
            .field("phase", &self.lifecycle.phase())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl NetworkNode for MemoryNode {
    async fn start(&self, ctx: &OpContext) -> Result<()> {
        ctx.check()?;
        if !self.lifecycle.begin_start()? {
            return Ok(());
        }

        let queue = self
            .datagram_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(datagrams) = queue else {
            self.lifecycle.abort_start();
            return Err(NetError::Closed);
        };

        let mut endpoints = self.network.inner.endpoints.write().await;
        if endpoints.contains_key(&self.local.peer_id) {
            drop(endpoints);
            self.lifecycle.abort_start();
            return Err(NetError::AlreadyExists(self.local.peer_id.fingerprint()));
        }
        endpoints.insert(
            self.local.peer_id,
            Endpoint {
                address: self.local.clone(),
                datagrams,
                registry: self.registry.clone(),
            },
        );
        drop(endpoints);

        info!(addr = %self.local.address, "memory node started");
        Ok(())
    }

    async fn close(&self, ctx: &OpContext) -> Result<()> {
        if !self.lifecycle.begin_close() {
            return Ok(());
        }
        {
            let mut endpoints = self.network.inner.endpoints.write().await;
            let ours = endpoints
                .get(&self.local.peer_id)
                .is_some_and(|e| Arc::ptr_eq(&e.registry, &self.registry));
            if ours {
                endpoints.remove(&self.local.peer_id);
            }
        }
        self.datagram_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.registry.close().await;
        self.lifecycle.shutdown(ctx).await;
        info!(addr = %self.local.address, "memory node closed");
        Ok(())
    }

    fn addr(&self) -> PeerAddress {
        self.local.clone()
    }

    fn peer_id(&self) -> Identity {
        self.local.peer_id
    }

    async fn publish(&self, ctx: &OpContext, topic: &str, data: Vec<u8>) -> Result<()> {
        ctx.check()?;
        self.lifecycle.ensure_running()?;

        let msg = TopicMessage {
            topic: topic.to_string(),
            source: self.local.peer_id,
            seqno: self.seqno.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            data,
        };
        let registries: Vec<Arc<SubscriptionRegistry>> = self
            .network
            .inner
            .endpoints
            .read()
            .await
            .values()
            .map(|e| e.registry.clone())
            .collect();

        let mut delivered = 0usize;
        for registry in registries {
            if registry.deliver(msg.clone()).await {
                delivered += 1;
            }
        }
        if delivered == 0 {
            return Err(NetError::NoSubscribers(topic.to_string()));
        }
        trace!(topic, delivered, "published");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        self.lifecycle.ensure_running()?;
        self.registry.subscribe(topic).await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.registry.unsubscribe(topic).await;
        Ok(())
    }

    async fn find_peer(&self, ctx: &OpContext, id: &Identity) -> Result<PeerAddress> {
        ctx.check()?;
        self.lifecycle.ensure_running()?;
        self.network
            .inner
            .endpoints
            .read()
            .await
            .get(id)
            .map(|e| e.address.clone())
            .ok_or(NetError::PeerNotFound(*id))
    }

    async fn provide(&self, ctx: &OpContext, key: &[u8]) -> Result<()> {
        ctx.check()?;
        self.lifecycle.ensure_running()?;
        self.network
            .inner
            .providers
            .write()
            .await
            .add(hash_key(key), self.local.clone());
        Ok(())
    }

    async fn find_providers(
        &self,
        ctx: &OpContext,
        key: &[u8],
        limit: usize,
    ) -> Result<Vec<PeerAddress>> {
        ctx.check()?;
        self.lifecycle.ensure_running()?;
        let mut providers = self
            .network
            .inner
            .providers
            .read()
            .await
            .providers(&hash_key(key));
        if providers.is_empty() {
            return Err(NetError::NoProviders);
        }
        if limit > 0 {
            providers.truncate(limit);
        }
        Ok(providers)
    }

    async fn put_value(&self, ctx: &OpContext, key: &[u8], value: Vec<u8>) -> Result<()> {
        ctx.check()?;
        self.lifecycle.ensure_running()?;
        let max = self.network.inner.dht.max_value_size;
        if value.len() > max {
            return Err(NetError::ValueTooLarge {
                size: value.len(),
                max,
            });
        }
        let key = hash_key(key);
        let shared = &self.network.inner;
        let mut values = shared.values.write().await;
        if let Some(current) = values.get(&key) {
            shared.versions.observe(current.version);
        }
        let record = ValueRecord {
            value,
            version: shared.versions.next(),
            publisher: self.local.peer_id,
        };
        let outcome = values.put(key, record);
        trace!(?outcome, "value stored");
        Ok(())
    }

    async fn get_value(&self, ctx: &OpContext, key: &[u8]) -> Result<Vec<u8>> {
        ctx.check()?;
        self.lifecycle.ensure_running()?;
        self.network
            .inner
            .values
            .read()
            .await
            .get(&hash_key(key))
            .map(|r| r.value)
            .ok_or(NetError::KeyNotFound)
    }

    async fn send_datagram(&self, to: &PeerAddress, payload: Vec<u8>) -> Result<()> {
        self.lifecycle.ensure_running()?;
        let endpoint = self
            .network
            .inner
            .endpoints
            .read()
            .await
            .get(&to.peer_id)
            .cloned();
        match endpoint {
            Some(endpoint) => {
                self.deliver_datagram(&endpoint, payload);
                Ok(())
            }
            None => {
                debug!(to = %to, "datagram to unknown peer");
                Err(NetError::PeerNotFound(to.peer_id))
            }
        }
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
        let peers = self.network.inner.endpoints.read().await.len();
        NodeTelemetry {
            routing_peers: peers.saturating_sub(1),
            provider_keys: self.network.inner.providers.read().await.key_count(),
            stored_values: self.network.inner.values.read().await.len(),
            subscriptions: self.registry.topics().await.len(),
            overlay_peers: peers.saturating_sub(1),
            background_tasks: self.lifecycle.task_count(),
        }
    }
}
