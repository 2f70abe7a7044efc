//! Protocol traits the engines depend on.
//!
//! | Protocol | Trait | Implemented by |
//! |----------|-------|----------------|
//! | DHT | [`DhtRpc`] | `UdpRpc`, in-process test networks |
//! | Overlay | [`OverlayRpc`] | `UdpRpc` |
//!
//! The engines in `dht` and `overlay` are generic over these traits so they
//! run unchanged over real sockets or an in-process test network.

use async_trait::async_trait;

use crate::dht::{Key, ValueRecord};
use crate::error::Result;
use crate::identity::{Identity, PeerAddress};
use crate::messages::OverlayMessage;

/// Remote DHT operations against a single peer.
#[async_trait]
pub trait DhtRpc: Send + Sync + 'static {
    async fn ping(&self, to: &PeerAddress) -> Result<()>;

    /// The peer's closest known contacts to `target`.
    async fn find_node(&self, to: &PeerAddress, target: Identity) -> Result<Vec<PeerAddress>>;

    /// The peer's stored record for `key`, if any, plus closer contacts.
    async fn find_value(
        &self,
        to: &PeerAddress,
        key: Key,
    ) -> Result<(Option<ValueRecord>, Vec<PeerAddress>)>;

    async fn store(&self, to: &PeerAddress, key: Key, record: ValueRecord) -> Result<()>;

    /// Register the caller as a provider of `key` on the peer.
    async fn add_provider(&self, to: &PeerAddress, key: Key) -> Result<()>;

    /// Live providers the peer knows for `key`, plus closer contacts.
    async fn get_providers(
        &self,
        to: &PeerAddress,
        key: Key,
    ) -> Result<(Vec<PeerAddress>, Vec<PeerAddress>)>;
}

/// Fire-and-forget overlay gossip to a single peer.
#[async_trait]
pub trait OverlayRpc: Send + Sync + 'static {
    async fn send_overlay(&self, to: &PeerAddress, message: OverlayMessage) -> Result<()>;
}
