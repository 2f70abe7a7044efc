//! Backend-agnostic DHT and overlay contracts.
//!
//! Upper layers depend on [`DhtTable`] and [`OverlayManager`], never on a
//! concrete backend. The adapters translate both onto any
//! `Arc<dyn NetworkNode>`.
//!
//! Adapters borrow the node, they do not own it: `start` brings the node up
//! if needed, while adapter `close` releases only what the adapter itself
//! acquired. The node is closed by whoever built it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::context::OpContext;
use crate::error::{NetError, Result};
use crate::identity::{Identity, PeerAddress};
use crate::node::NetworkNode;
use crate::overlay::{Subscription, Topic};

// ============================================================================
// DHT
// ============================================================================

#[async_trait]
pub trait DhtTable: Send + Sync {
    async fn start(&self, ctx: &OpContext) -> Result<()>;
    async fn close(&self, ctx: &OpContext) -> Result<()>;
    fn self_peer(&self) -> PeerAddress;
    async fn find_peer(&self, ctx: &OpContext, id: &Identity) -> Result<PeerAddress>;
    async fn find_providers(
        &self,
        ctx: &OpContext,
        key: &[u8],
        limit: usize,
    ) -> Result<Vec<PeerAddress>>;
    async fn provide(&self, ctx: &OpContext, key: &[u8]) -> Result<()>;
    async fn get(&self, ctx: &OpContext, key: &[u8]) -> Result<Vec<u8>>;
    async fn put(&self, ctx: &OpContext, key: &[u8], value: Vec<u8>) -> Result<()>;
}

pub struct DhtAdapter {
    node: Arc<dyn NetworkNode>,
    closed: AtomicBool,
}

impl DhtAdapter {
    pub fn new(node: Arc<dyn NetworkNode>) -> Self {
        Self {
            node,
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(NetError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DhtTable for DhtAdapter {
    async fn start(&self, ctx: &OpContext) -> Result<()> {
        self.check_open()?;
        self.node.start(ctx).await
    }

    async fn close(&self, _ctx: &OpContext) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn self_peer(&self) -> PeerAddress {
        self.node.addr()
    }

    async fn find_peer(&self, ctx: &OpContext, id: &Identity) -> Result<PeerAddress> {
        self.check_open()?;
        self.node.find_peer(ctx, id).await
    }

    async fn find_providers(
        &self,
        ctx: &OpContext,
        key: &[u8],
        limit: usize,
    ) -> Result<Vec<PeerAddress>> {
        self.check_open()?;
        self.node.find_providers(ctx, key, limit).await
    }

    async fn provide(&self, ctx: &OpContext, key: &[u8]) -> Result<()> {
        self.check_open()?;
        self.node.provide(ctx, key).await
    }

    async fn get(&self, ctx: &OpContext, key: &[u8]) -> Result<Vec<u8>> {
        self.check_open()?;
        self.node.get_value(ctx, key).await
    }

    async fn put(&self, ctx: &OpContext, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.check_open()?;
        self.node.put_value(ctx, key, value).await
    }
}

// ============================================================================
// Overlay
// ============================================================================

#[async_trait]
pub trait OverlayPublisher: Send + Sync {
    async fn publish(&self, ctx: &OpContext, topic: &Topic, data: Vec<u8>) -> Result<()>;
}

#[async_trait]
pub trait OverlaySubscriber: Send + Sync {
    async fn subscribe(&self, topic: &Topic) -> Result<Subscription>;
    async fn unsubscribe(&self, topic: &Topic) -> Result<()>;
}

/// Publish/subscribe plus overlay membership. An overlay is a topic
/// namespace; its topics are named `overlay/name`.
#[async_trait]
pub trait OverlayManager: OverlayPublisher + OverlaySubscriber {
    async fn join(&self, overlay: &str) -> Result<()>;
    /// Unsubscribe every topic of `overlay` held through this manager.
    async fn leave(&self, overlay: &str) -> Result<()>;
    fn topic(&self, overlay: &str, name: &str) -> Result<Topic>;
    async fn overlays(&self) -> Vec<String>;
}

pub struct OverlayAdapter {
    node: Arc<dyn NetworkNode>,
    /// Joined overlays and the topics subscribed within each.
    joined: RwLock<BTreeMap<String, BTreeSet<String>>>,
}

impl OverlayAdapter {
    pub fn new(node: Arc<dyn NetworkNode>) -> Self {
        Self {
            node,
            joined: RwLock::new(BTreeMap::new()),
        }
    }

    /// Leave every overlay, releasing the adapter's subscriptions.
    pub async fn close(&self) -> Result<()> {
        let overlays: Vec<String> = self.joined.read().await.keys().cloned().collect();
        for overlay in overlays {
            self.leave(&overlay).await?;
        }
        Ok(())
    }
}

fn check_overlay_id(overlay: &str) -> Result<()> {
    if overlay.is_empty() || overlay.contains(crate::overlay::OVERLAY_SEPARATOR) {
        return Err(NetError::InvalidConfig(format!("invalid overlay id {overlay:?}")));
    }
    Ok(())
}

#[async_trait]
impl OverlayPublisher for OverlayAdapter {
    async fn publish(&self, ctx: &OpContext, topic: &Topic, data: Vec<u8>) -> Result<()> {
        self.node.publish(ctx, topic.as_str(), data).await
    }
}

#[async_trait]
impl OverlaySubscriber for OverlayAdapter {
    async fn subscribe(&self, topic: &Topic) -> Result<Subscription> {
        let sub = self.node.subscribe(topic.as_str()).await?;
        if let Some(overlay) = topic.overlay() {
            self.joined
                .write()
                .await
                .entry(overlay.to_string())
                .or_default()
                .insert(topic.as_str().to_string());
        }
        Ok(sub)
    }

    async fn unsubscribe(&self, topic: &Topic) -> Result<()> {
        self.node.unsubscribe(topic.as_str()).await?;
        if let Some(overlay) = topic.overlay() {
            if let Some(topics) = self.joined.write().await.get_mut(overlay) {
                topics.remove(topic.as_str());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl OverlayManager for OverlayAdapter {
    async fn join(&self, overlay: &str) -> Result<()> {
        check_overlay_id(overlay)?;
        self.joined
            .write()
            .await
            .entry(overlay.to_string())
            .or_default();
        debug!(overlay, "joined overlay");
        Ok(())
    }

    async fn leave(&self, overlay: &str) -> Result<()> {
        let topics = self.joined.write().await.remove(overlay);
        let Some(topics) = topics else {
            return Ok(());
        };
        for topic in &topics {
            self.node.unsubscribe(topic).await?;
        }
        debug!(overlay, topics = topics.len(), "left overlay");
        Ok(())
    }

    fn topic(&self, overlay: &str, name: &str) -> Result<Topic> {
        check_overlay_id(overlay)?;
        Topic::scoped(overlay, name)
    }

    async fn overlays(&self) -> Vec<String> {
        self.joined.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::identity::Keypair;
    use crate::memory::{MemoryNetwork, MemoryNode};

    async fn memory_node(network: &MemoryNetwork) -> Arc<dyn NetworkNode> {
        let node: Arc<dyn NetworkNode> = Arc::new(MemoryNode::new(
            network,
            &Keypair::generate(),
            &NodeConfig::default(),
        ));
        node.start(&OpContext::background()).await.unwrap();
        node
    }

    #[tokio::test]
    async fn dht_adapter_round_trip() {
        let network = MemoryNetwork::new();
        let a = DhtAdapter::new(memory_node(&network).await);
        let b = DhtAdapter::new(memory_node(&network).await);
        let ctx = OpContext::background();

        a.start(&ctx).await.unwrap();
        a.put(&ctx, b"k", b"v".to_vec()).await.unwrap();
        assert_eq!(b.get(&ctx, b"k").await.unwrap(), b"v");
        assert_eq!(b.find_peer(&ctx, &a.self_peer().peer_id).await.unwrap(), a.self_peer());

        a.close(&ctx).await.unwrap();
        a.close(&ctx).await.unwrap();
        assert!(matches!(a.get(&ctx, b"k").await, Err(NetError::Closed)));
        // The node itself is still up.
        assert_eq!(b.get(&ctx, b"k").await.unwrap(), b"v");
    }

    #[tokio::test]
    async fn leave_unsubscribes_overlay_topics() {
        let network = MemoryNetwork::new();
        let node = memory_node(&network).await;
        let overlay = OverlayAdapter::new(node.clone());

        overlay.join("shard-1").await.unwrap();
        overlay.join("shard-1").await.unwrap();
        let blocks = overlay.topic("shard-1", "blocks").unwrap();
        let votes = overlay.topic("shard-1", "votes").unwrap();
        let mut blocks_sub = overlay.subscribe(&blocks).await.unwrap();
        let mut votes_sub = overlay.subscribe(&votes).await.unwrap();
        assert_eq!(overlay.overlays().await, vec!["shard-1".to_string()]);

        overlay.leave("shard-1").await.unwrap();
        overlay.leave("shard-1").await.unwrap();
        assert!(blocks_sub.recv().await.is_none());
        assert!(votes_sub.recv().await.is_none());

        let ctx = OpContext::background();
        assert!(matches!(
            overlay.publish(&ctx, &blocks, b"x".to_vec()).await,
            Err(NetError::NoSubscribers(_))
        ));
        assert!(overlay.overlays().await.is_empty());
    }

    #[test]
    fn overlay_ids_are_validated() {
        let network = MemoryNetwork::new();
        let node: Arc<dyn NetworkNode> = Arc::new(MemoryNode::new(
            &network,
            &Keypair::generate(),
            &NodeConfig::default(),
        ));
        let overlay = OverlayAdapter::new(node);
        assert!(overlay.topic("", "blocks").is_err());
        assert!(overlay.topic("a/b", "blocks").is_err());
        assert_eq!(overlay.topic("a", "blocks").unwrap().as_str(), "a/blocks");
    }
}
