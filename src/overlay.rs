//! # Overlay Broadcast
//!
//! Topic-based publish/subscribe.
//!
//! ## Components
//!
//! | Type | Role |
//! |------|------|
//! | [`SubscriptionRegistry`] | Local subscriptions and their delivery pumps, shared by every backend |
//! | [`Subscription`] | Receiving end handed to the subscriber |
//! | [`OverlayNode`] | Gossip engine for networked backends: announcements, dedup, flooding |
//!
//! ## Delivery
//!
//! Each subscription owns a bounded inbox drained by one pump task into the
//! subscriber's channel. Publishes enter the inbox in the order the backend
//! sees them and leave it in the same order. When the inbox is full the
//! newest message is dropped and a warning logged; the publisher never
//! blocks on a slow subscriber.
//!
//! | Event | Effect on the delivery channel |
//! |-------|--------------------------------|
//! | `unsubscribe` | queued messages are delivered, then the channel ends |
//! | node close | queued messages are dropped, the channel ends |
//! | subscriber dropped | the pump exits and the topic slot is released |
//!
//! ## Gossip
//!
//! Peers announce their complete topic set to every known peer and again on
//! each heartbeat. A publish is sent to every known subscriber of its topic.
//! Receivers deduplicate by message id (`blake3(source || seqno || topic ||
//! data)`) in a bounded LRU cache and forward first sightings to the other
//! subscribers they know, so delivery survives partial membership views.
//!
//! Publishing to a topic with no local and no known remote subscriber fails
//! with [`NetError::NoSubscribers`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use lru::LruCache;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::OverlayConfig;
use crate::context::OpContext;
use crate::error::{NetError, Result};
use crate::identity::{Identity, PeerAddress, now_ms};
use crate::messages::{GossipPublish, MessageId, OverlayMessage};
use crate::node::shutdown_requested;
use crate::protocols::OverlayRpc;

/// Longest accepted topic name in bytes.
pub const MAX_TOPIC_LEN: usize = 256;

/// Separator between an overlay id and a topic name.
pub const OVERLAY_SEPARATOR: char = '/';

pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty() && topic.len() <= MAX_TOPIC_LEN && !topic.chars().any(char::is_control)
}

fn check_topic(topic: &str) -> Result<()> {
    if is_valid_topic(topic) {
        Ok(())
    } else {
        Err(NetError::InvalidConfig(format!("invalid topic name {topic:?}")))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(String);

impl Topic {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        check_topic(&name)?;
        Ok(Self(name))
    }

    /// `overlay/name`.
    pub fn scoped(overlay: &str, name: &str) -> Result<Self> {
        Self::new(format!("{overlay}{OVERLAY_SEPARATOR}{name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The overlay namespace of a scoped topic.
    pub fn overlay(&self) -> Option<&str> {
        self.0.split_once(OVERLAY_SEPARATOR).map(|(overlay, _)| overlay)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Topic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A message as seen by a subscriber.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicMessage {
    pub topic: String,
    pub source: Identity,
    pub seqno: u64,
    pub data: Vec<u8>,
}

impl From<GossipPublish> for TopicMessage {
    fn from(msg: GossipPublish) -> Self {
        Self {
            topic: msg.topic,
            source: msg.source,
            seqno: msg.seqno,
            data: msg.data,
        }
    }
}

// ============================================================================
// Subscriptions
// ============================================================================

#[derive(Debug)]
pub struct Subscription {
    topic: String,
    rx: mpsc::Receiver<TopicMessage>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next message, or `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<TopicMessage> {
        self.rx.recv().await
    }

    /// Like [`recv`](Self::recv) but bounded by `ctx`.
    pub async fn recv_ctx(&mut self, ctx: &OpContext) -> Result<Option<TopicMessage>> {
        let rx = &mut self.rx;
        ctx.run(async { Ok(rx.recv().await) }).await
    }

    pub fn try_recv(&mut self) -> Option<TopicMessage> {
        self.rx.try_recv().ok()
    }
}

struct SubscriptionSlot {
    inbox: mpsc::Sender<TopicMessage>,
}

impl SubscriptionSlot {
    fn is_live(&self) -> bool {
        !self.inbox.is_closed()
    }
}

/// Local subscriptions of one node.
pub struct SubscriptionRegistry {
    queue_depth: usize,
    slots: RwLock<HashMap<String, SubscriptionSlot>>,
    shutdown: watch::Sender<bool>,
    pumps: StdMutex<Vec<JoinHandle<()>>>,
}

impl SubscriptionRegistry {
    pub fn new(queue_depth: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            queue_depth: queue_depth.max(1),
            slots: RwLock::new(HashMap::new()),
            shutdown,
            pumps: StdMutex::new(Vec::new()),
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        check_topic(topic)?;
        let mut slots = self.slots.write().await;
        if self.is_closed() {
            return Err(NetError::Closed);
        }
        if slots.get(topic).is_some_and(SubscriptionSlot::is_live) {
            return Err(NetError::AlreadySubscribed(topic.to_string()));
        }

        let (inbox_tx, inbox_rx) = mpsc::channel(self.queue_depth);
        let (outlet_tx, outlet_rx) = mpsc::channel(1);
        let pump = tokio::spawn(delivery_pump(
            topic.to_string(),
            inbox_rx,
            outlet_tx,
            self.shutdown.subscribe(),
        ));
        self.track(pump);
        slots.insert(topic.to_string(), SubscriptionSlot { inbox: inbox_tx });
        debug!(topic, "subscribed");

        Ok(Subscription {
            topic: topic.to_string(),
            rx: outlet_rx,
        })
    }

    /// Returns true if a subscription was removed. Removing an absent topic
    /// is not an error.
    pub async fn unsubscribe(&self, topic: &str) -> bool {
        let removed = self.slots.write().await.remove(topic).is_some();
        if removed {
            debug!(topic, "unsubscribed");
        }
        removed
    }

    /// Hand `msg` to the local subscriber of its topic. Returns false if
    /// there is none.
    pub async fn deliver(&self, msg: TopicMessage) -> bool {
        let outcome = {
            let slots = self.slots.read().await;
            match slots.get(&msg.topic) {
                Some(slot) => slot.inbox.try_send(msg),
                None => return false,
            }
        };
        match outcome {
            Ok(()) => true,
            Err(TrySendError::Full(msg)) => {
                warn!(
                    topic = %msg.topic,
                    source = %msg.source.fingerprint(),
                    seqno = msg.seqno,
                    "delivery queue full, dropping message"
                );
                true
            }
            Err(TrySendError::Closed(msg)) => {
                self.release_dead(&msg.topic).await;
                false
            }
        }
    }

    async fn release_dead(&self, topic: &str) {
        let mut slots = self.slots.write().await;
        if slots.get(topic).is_some_and(|s| !s.is_live()) {
            slots.remove(topic);
            trace!(topic, "released abandoned subscription");
        }
    }

    pub async fn has(&self, topic: &str) -> bool {
        self.slots
            .read()
            .await
            .get(topic)
            .is_some_and(SubscriptionSlot::is_live)
    }

    /// Live topics, sorted.
    pub async fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .slots
            .read()
            .await
            .iter()
            .filter(|(_, slot)| slot.is_live())
            .map(|(topic, _)| topic.clone())
            .collect();
        topics.sort();
        topics
    }

    /// End every subscription and wait for the pumps to exit. Idempotent.
    pub async fn close(&self) {
        self.shutdown.send_replace(true);
        self.slots.write().await.clear();
        let pumps = {
            let mut guard = self.pumps.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        for pump in pumps {
            let _ = pump.await;
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut pumps = self.pumps.lock().unwrap_or_else(|e| e.into_inner());
        pumps.retain(|h| !h.is_finished());
        pumps.push(handle);
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("queue_depth", &self.queue_depth)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

async fn delivery_pump(
    topic: String,
    mut inbox: mpsc::Receiver<TopicMessage>,
    outlet: mpsc::Sender<TopicMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let msg = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break,
            msg = inbox.recv() => match msg {
                Some(msg) => msg,
                // Unsubscribed and drained.
                None => break,
            },
        };
        tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break,
            sent = outlet.send(msg) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    trace!(topic = %topic, "delivery pump stopped");
}

// ============================================================================
// Gossip Engine
// ============================================================================

#[derive(Debug)]
struct RemotePeer {
    address: PeerAddress,
    topics: HashSet<String>,
}

#[derive(Debug, Default)]
struct Membership {
    peers: HashMap<Identity, RemotePeer>,
}

impl Membership {
    /// Replace `peer`'s topic set. Returns true if the peer was unknown.
    fn replace(&mut self, peer: &PeerAddress, topics: Vec<String>) -> bool {
        let topics: HashSet<String> = topics.into_iter().filter(|t| is_valid_topic(t)).collect();
        match self.peers.get_mut(&peer.peer_id) {
            Some(state) => {
                state.address = peer.clone();
                state.topics = topics;
                false
            }
            None => {
                self.peers.insert(
                    peer.peer_id,
                    RemotePeer {
                        address: peer.clone(),
                        topics,
                    },
                );
                true
            }
        }
    }

    /// Known subscribers of `topic`, ordered by peer id.
    fn subscribers(&self, topic: &str) -> Vec<PeerAddress> {
        let mut subs: Vec<PeerAddress> = self
            .peers
            .values()
            .filter(|p| p.topics.contains(topic))
            .map(|p| p.address.clone())
            .collect();
        subs.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        subs
    }
}

pub struct OverlayNode<N: OverlayRpc> {
    inner: Arc<OverlayShared<N>>,
}

impl<N: OverlayRpc> Clone for OverlayNode<N> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct OverlayShared<N: OverlayRpc> {
    local: PeerAddress,
    network: Arc<N>,
    registry: Arc<SubscriptionRegistry>,
    membership: RwLock<Membership>,
    seen: Mutex<LruCache<MessageId, ()>>,
    seqno: AtomicU64,
}

impl<N: OverlayRpc> OverlayNode<N> {
    pub fn new(local: PeerAddress, network: N, config: &OverlayConfig) -> Self {
        let seen_cap = NonZeroUsize::new(config.seen_cache).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(OverlayShared {
                local,
                network: Arc::new(network),
                registry: Arc::new(SubscriptionRegistry::new(config.delivery_queue)),
                membership: RwLock::new(Membership::default()),
                seen: Mutex::new(LruCache::new(seen_cap)),
                seqno: AtomicU64::new(now_ms()),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.inner.registry
    }

    pub async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let sub = self.inner.registry.subscribe(topic).await?;
        self.announce_all().await;
        Ok(sub)
    }

    pub async fn unsubscribe(&self, topic: &str) {
        if self.inner.registry.unsubscribe(topic).await {
            self.announce_all().await;
        }
    }

    /// Publish to local and known remote subscribers. Returns the number of
    /// recipients the message was handed to.
    pub async fn publish(&self, ctx: &OpContext, topic: &str, data: Vec<u8>) -> Result<usize> {
        ctx.check()?;
        check_topic(topic)?;
        if self.inner.registry.is_closed() {
            return Err(NetError::Closed);
        }

        let msg = GossipPublish {
            source: self.inner.local.peer_id,
            seqno: self.inner.seqno.fetch_add(1, Ordering::Relaxed),
            topic: topic.to_string(),
            data,
        };
        self.mark_seen(msg.id()).await;

        let remote = self.inner.membership.read().await.subscribers(topic);
        let local = self.inner.registry.deliver(msg.clone().into()).await;
        if !local && remote.is_empty() {
            return Err(NetError::NoSubscribers(topic.to_string()));
        }

        let sent = ctx.run(async { Ok(self.send_to_all(&remote, &msg).await) }).await?;
        trace!(topic, local, remote = sent, "published");
        Ok(usize::from(local) + sent)
    }

    async fn send_to_all(&self, peers: &[PeerAddress], msg: &GossipPublish) -> usize {
        let mut sent = 0;
        for peer in peers {
            match self
                .inner
                .network
                .send_overlay(peer, OverlayMessage::Publish(msg.clone()))
                .await
            {
                Ok(()) => sent += 1,
                Err(e) => debug!(peer = %peer, error = %e, "overlay send failed"),
            }
        }
        sent
    }

    async fn mark_seen(&self, id: MessageId) -> bool {
        self.inner.seen.lock().await.put(id, ()).is_none()
    }

    /// Process an overlay message received from `from`.
    pub async fn handle_message(&self, from: &PeerAddress, message: OverlayMessage) {
        match message {
            OverlayMessage::Announce { topics } => {
                let count = topics.len();
                let is_new = self.inner.membership.write().await.replace(from, topics);
                trace!(peer = %from.peer_id.fingerprint(), topics = count, "subscription announcement");
                if is_new {
                    self.announce_to(from).await;
                }
            }
            OverlayMessage::Publish(msg) => {
                if !is_valid_topic(&msg.topic) {
                    debug!(peer = %from.peer_id.fingerprint(), "dropping publish with invalid topic");
                    return;
                }
                if !self.mark_seen(msg.id()).await {
                    trace!(topic = %msg.topic, seqno = msg.seqno, "duplicate publish");
                    return;
                }
                let forward: Vec<PeerAddress> = self
                    .inner
                    .membership
                    .read()
                    .await
                    .subscribers(&msg.topic)
                    .into_iter()
                    .filter(|p| p.peer_id != from.peer_id && p.peer_id != msg.source)
                    .collect();
                self.inner.registry.deliver(msg.clone().into()).await;
                if !forward.is_empty() {
                    self.send_to_all(&forward, &msg).await;
                }
            }
        }
    }

    /// Start tracking `peer` and tell it our topics if it was unknown.
    pub async fn observe_peer(&self, peer: &PeerAddress) {
        if peer.peer_id == self.inner.local.peer_id {
            return;
        }
        let known = self.inner.membership.read().await.peers.contains_key(&peer.peer_id);
        if known {
            return;
        }
        let inserted = self.inner.membership.write().await.replace(peer, Vec::new());
        if inserted {
            self.announce_to(peer).await;
        }
    }

    pub async fn forget_peer(&self, id: &Identity) {
        self.inner.membership.write().await.peers.remove(id);
    }

    async fn announce_to(&self, peer: &PeerAddress) {
        let topics = self.inner.registry.topics().await;
        if let Err(e) = self
            .inner
            .network
            .send_overlay(peer, OverlayMessage::Announce { topics })
            .await
        {
            debug!(peer = %peer, error = %e, "announce failed");
        }
    }

    /// Send our current topic set to every known peer.
    pub async fn announce_all(&self) {
        let peers: Vec<PeerAddress> = self
            .inner
            .membership
            .read()
            .await
            .peers
            .values()
            .map(|p| p.address.clone())
            .collect();
        let topics = self.inner.registry.topics().await;
        for peer in peers {
            let message = OverlayMessage::Announce {
                topics: topics.clone(),
            };
            if let Err(e) = self.inner.network.send_overlay(&peer, message).await {
                debug!(peer = %peer, error = %e, "announce failed");
            }
        }
    }

    pub async fn known_peers(&self) -> usize {
        self.inner.membership.read().await.peers.len()
    }

    pub async fn remote_subscribers(&self, topic: &str) -> Vec<PeerAddress> {
        self.inner.membership.read().await.subscribers(topic)
    }

    pub async fn close(&self) {
        self.inner.registry.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::identity::Keypair;

    fn message(topic: &str, seqno: u64) -> TopicMessage {
        TopicMessage {
            topic: topic.into(),
            source: Keypair::generate().identity(),
            seqno,
            data: seqno.to_be_bytes().to_vec(),
        }
    }

    #[test]
    fn topic_names_are_validated() {
        assert!(Topic::new("blocks").is_ok());
        assert!(Topic::new("").is_err());
        assert!(Topic::new("a\nb").is_err());
        assert!(Topic::new("x".repeat(MAX_TOPIC_LEN + 1)).is_err());

        let scoped = Topic::scoped("shard-0", "votes").unwrap();
        assert_eq!(scoped.as_str(), "shard-0/votes");
        assert_eq!(scoped.overlay(), Some("shard-0"));
    }

    #[tokio::test]
    async fn second_subscribe_is_rejected() {
        let registry = SubscriptionRegistry::new(8);
        let _sub = registry.subscribe("t1").await.unwrap();
        assert!(matches!(
            registry.subscribe("t1").await,
            Err(NetError::AlreadySubscribed(t)) if t == "t1"
        ));
    }

    #[tokio::test]
    async fn deliveries_keep_publish_order() {
        let registry = SubscriptionRegistry::new(64);
        let mut sub = registry.subscribe("t1").await.unwrap();
        for i in 0..32 {
            assert!(registry.deliver(message("t1", i)).await);
        }
        for i in 0..32 {
            assert_eq!(sub.recv().await.unwrap().seqno, i);
        }
    }

    #[tokio::test]
    async fn unsubscribe_drains_then_ends_and_is_idempotent() {
        let registry = SubscriptionRegistry::new(8);
        let mut sub = registry.subscribe("t1").await.unwrap();
        registry.deliver(message("t1", 1)).await;
        registry.deliver(message("t1", 2)).await;

        assert!(registry.unsubscribe("t1").await);
        assert!(!registry.unsubscribe("t1").await);
        assert!(!registry.deliver(message("t1", 3)).await);

        assert_eq!(sub.recv().await.unwrap().seqno, 1);
        assert_eq!(sub.recv().await.unwrap().seqno, 2);
        assert!(sub.recv().await.is_none());

        // The topic can be subscribed again.
        registry.subscribe("t1").await.unwrap();
    }

    #[tokio::test]
    async fn full_queue_drops_newest() {
        let registry = SubscriptionRegistry::new(4);
        let mut sub = registry.subscribe("t1").await.unwrap();
        for i in 0..100 {
            assert!(registry.deliver(message("t1", i)).await);
        }
        registry.unsubscribe("t1").await;

        let mut received = Vec::new();
        while let Some(msg) = sub.recv().await {
            received.push(msg.seqno);
        }
        assert!(received.len() >= 4 && received.len() < 100, "got {}", received.len());
        assert_eq!(&received[..4], &[0, 1, 2, 3]);
        assert!(received.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn close_ends_every_subscription() {
        let registry = SubscriptionRegistry::new(8);
        let mut a = registry.subscribe("a").await.unwrap();
        let mut b = registry.subscribe("b").await.unwrap();
        registry.close().await;
        registry.close().await;

        assert!(a.recv().await.is_none());
        assert!(b.recv().await.is_none());
        assert!(matches!(registry.subscribe("c").await, Err(NetError::Closed)));
        assert!(registry.topics().await.is_empty());
    }

    #[tokio::test]
    async fn dropped_subscription_releases_topic() {
        let registry = SubscriptionRegistry::new(8);
        let sub = registry.subscribe("t1").await.unwrap();
        drop(sub);

        // The pump notices on its next send attempt.
        registry.deliver(message("t1", 0)).await;
        tokio::time::timeout(Duration::from_secs(1), async {
            while registry.has("t1").await {
                registry.deliver(message("t1", 1)).await;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        registry.subscribe("t1").await.unwrap();
    }

    #[tokio::test]
    async fn recv_ctx_times_out() {
        let registry = SubscriptionRegistry::new(8);
        let mut sub = registry.subscribe("quiet").await.unwrap();
        let ctx = OpContext::with_timeout(Duration::from_millis(20));
        assert!(matches!(sub.recv_ctx(&ctx).await, Err(NetError::Timeout)));
    }

    // ------------------------------------------------------------------------
    // Gossip engine over an in-process network
    // ------------------------------------------------------------------------

    type Peers = Arc<RwLock<HashMap<Identity, OverlayNode<LoopbackNet>>>>;

    #[derive(Clone)]
    struct LoopbackNet {
        peers: Peers,
        from: PeerAddress,
    }

    #[async_trait::async_trait]
    impl OverlayRpc for LoopbackNet {
        async fn send_overlay(&self, to: &PeerAddress, message: OverlayMessage) -> Result<()> {
            let target = self.peers.read().await.get(&to.peer_id).cloned();
            let target = target.ok_or_else(|| NetError::Transport("unreachable".into()))?;
            target.handle_message(&self.from, message).await;
            Ok(())
        }
    }

    async fn mesh(count: usize) -> Vec<OverlayNode<LoopbackNet>> {
        let peers: Peers = Arc::new(RwLock::new(HashMap::new()));
        let mut nodes = Vec::new();
        for i in 0..count {
            let addr = PeerAddress::new(Keypair::generate().identity(), format!("10.0.0.{i}:5000"));
            let net = LoopbackNet {
                peers: peers.clone(),
                from: addr.clone(),
            };
            let node = OverlayNode::new(addr.clone(), net, &OverlayConfig::default());
            peers.write().await.insert(addr.peer_id, node.clone());
            nodes.push((addr, node));
        }
        // Full mesh of acquaintances.
        for (_, node) in &nodes {
            for (addr, _) in &nodes {
                node.observe_peer(addr).await;
            }
        }
        nodes.into_iter().map(|(_, n)| n).collect()
    }

    #[tokio::test]
    async fn remote_subscriber_receives_publish() {
        let nodes = mesh(3).await;
        let mut sub = nodes[2].subscribe("blocks").await.unwrap();

        let ctx = OpContext::with_timeout(Duration::from_secs(1));
        let recipients = nodes[0].publish(&ctx, "blocks", b"b1".to_vec()).await.unwrap();
        assert_eq!(recipients, 1);

        let msg = sub.recv_ctx(&ctx).await.unwrap().unwrap();
        assert_eq!(msg.data, b"b1");
        assert_eq!(msg.topic, "blocks");
    }

    #[tokio::test]
    async fn forwarded_copies_are_deduplicated() {
        let nodes = mesh(4).await;
        let mut subs = Vec::new();
        for node in &nodes[1..] {
            subs.push(node.subscribe("votes").await.unwrap());
        }

        let ctx = OpContext::with_timeout(Duration::from_secs(1));
        nodes[0].publish(&ctx, "votes", b"v".to_vec()).await.unwrap();
        nodes[0].publish(&ctx, "votes", b"w".to_vec()).await.unwrap();

        for sub in &mut subs {
            assert_eq!(sub.recv().await.unwrap().data, b"v");
            assert_eq!(sub.recv().await.unwrap().data, b"w");
            assert!(sub.try_recv().is_none());
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_fails_consistently() {
        let nodes = mesh(2).await;
        let ctx = OpContext::with_timeout(Duration::from_secs(1));
        for _ in 0..2 {
            assert!(matches!(
                nodes[0].publish(&ctx, "t1", b"hello".to_vec()).await,
                Err(NetError::NoSubscribers(t)) if t == "t1"
            ));
        }
    }

    #[tokio::test]
    async fn unsubscribe_is_announced() {
        let nodes = mesh(2).await;
        let _sub = nodes[1].subscribe("blocks").await.unwrap();
        assert_eq!(nodes[0].remote_subscribers("blocks").await.len(), 1);

        nodes[1].unsubscribe("blocks").await;
        nodes[1].unsubscribe("blocks").await;
        assert!(nodes[0].remote_subscribers("blocks").await.is_empty());
    }

    #[tokio::test]
    async fn late_peer_learns_existing_subscriptions() {
        let nodes = mesh(1).await;
        let _sub = nodes[0].subscribe("blocks").await.unwrap();

        let peers = nodes[0].inner.network.peers.clone();
        let addr = PeerAddress::new(Keypair::generate().identity(), "10.0.0.9:5000");
        let late = OverlayNode::new(
            addr.clone(),
            LoopbackNet {
                peers: peers.clone(),
                from: addr.clone(),
            },
            &OverlayConfig::default(),
        );
        peers.write().await.insert(addr.peer_id, late.clone());

        // The announcement reply tells the newcomer about "blocks".
        late.observe_peer(&nodes[0].inner.local).await;
        assert_eq!(late.remote_subscribers("blocks").await.len(), 1);
    }
}
