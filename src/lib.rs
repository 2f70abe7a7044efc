//! # Ridgenet - Peer-to-Peer Networking Substrate
//!
//! Ridgenet gives higher-level node services a uniform way to find peers,
//! broadcast on topics, store small routing records and move large payloads
//! reliably over an unreliable transport:
//!
//! - **Identity**: Ed25519 keypairs; a peer id is the 32-byte public key
//! - **DHT**: Kademlia routing, provider records and versioned values
//! - **Overlay**: topic publish/subscribe with at-least-once delivery
//! - **RLDP**: reliable, ordered, multiplexed streams over node datagrams
//!
//! ## Architecture
//!
//! Everything above the transport depends on the [`NetworkNode`] capability
//! trait. Two backends implement it:
//! - [`MemoryNode`] joins a process-local [`MemoryNetwork`], with fault
//!   injection for tests
//! - [`UdpNode`] runs the Kademlia and gossip engines over a UDP socket
//!
//! Shared structures (routing table, record stores, subscription table) each
//! sit behind one reader/writer lock; updates are rare next to queries.
//! Every suspending operation takes an [`OpContext`] carrying its deadline
//! and cancellation.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `identity` | Keypairs, peer ids, peer addresses, XOR distance |
//! | `keyring` | Load, generate and persist the node keypair |
//! | `context` | Operation deadlines and cancellation |
//! | `error` | `NetError` taxonomy |
//! | `config` | Node, DHT, overlay and stream configuration |
//! | `messages` | Wire envelopes for DHT RPC, gossip and datagrams |
//! | `protocols` | RPC traits the DHT and overlay engines depend on |
//! | `dht` | Routing table, record stores, iterative lookups |
//! | `overlay` | Topics, subscriptions, gossip engine |
//! | `node` | `NetworkNode` trait and shared lifecycle |
//! | `memory` | In-memory backend |
//! | `udp` | UDP backend |
//! | `adapter` | Backend-agnostic DHT and overlay contracts |
//! | `rldp` | Reliable streams |
//! | `storage` | Key-value store contract |

mod adapter;
mod config;
mod context;
mod dht;
mod error;
mod identity;
mod keyring;
mod memory;
mod messages;
mod node;
mod overlay;
mod protocols;
mod rldp;
mod storage;
mod udp;

pub use adapter::{
    DhtAdapter, DhtTable, OverlayAdapter, OverlayManager, OverlayPublisher, OverlaySubscriber,
};
pub use config::{
    BootstrapPeer, DhtConfig, NodeConfig, OverlayConfig, PROVIDER_REPUBLISH_INTERVAL,
    PROVIDER_TTL, RldpConfig, VALUE_TTL,
};
pub use context::{Canceller, OpContext};
pub use dht::{DhtNode, DhtTelemetry, Key, RoutingTable, ValueRecord, hash_key};
pub use error::{NetError, Result};
pub use identity::{Identity, Keypair, PeerAddress};
pub use keyring::{load_identity, persist_keypair};
pub use memory::{LinkFilter, LinkVerdict, MemoryNetwork, MemoryNode};
pub use messages::{MAX_DATAGRAM_SIZE, MAX_VALUE_SIZE};
pub use node::{Datagram, NetworkNode, NodePhase, NodeTask, NodeTelemetry};
pub use overlay::{MAX_TOPIC_LEN, OverlayNode, Subscription, Topic, TopicMessage};
pub use protocols::{DhtRpc, OverlayRpc};
pub use rldp::{
    Frame, FrameError, FrameKind, ManagerStats, RldpManager, RldpStream, StreamPhase,
    StreamStats,
};
pub use storage::{KvStore, MemoryKv};
pub use udp::{UdpNode, UdpRpc};
