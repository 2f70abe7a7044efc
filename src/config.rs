//! Node, DHT, overlay and stream configuration.
//!
//! Every tunable has a named default below. `validate()` rejects structurally
//! invalid settings with [`NetError::InvalidConfig`]; such errors are fatal at
//! startup and never retried.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use tokio::time::Duration;

use crate::error::{NetError, Result};
use crate::identity::{Identity, PeerAddress};
use crate::messages::{MAX_DATAGRAM_SIZE, MAX_VALUE_SIZE};
use crate::rldp::{FRAME_CHECKSUM_LEN, FRAME_HEADER_LEN};

/// Default deadline applied to a single request when the caller has none.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Kademlia replication factor (bucket size and store fan-out).
pub const DEFAULT_K: usize = 20;

/// Kademlia lookup concurrency.
pub const DEFAULT_ALPHA: usize = 3;

/// Consecutive failed queries before a routing entry is dropped.
pub const DEFAULT_MAX_FAILURES: u32 = 3;

/// Timeout for one RPC inside a lookup wave.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(3);

/// Provider records expire after this long unless re-announced.
pub const PROVIDER_TTL: Duration = Duration::from_secs(30 * 60);

/// How often an owning service should call `provide` again.
pub const PROVIDER_REPUBLISH_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Stored values expire after this long unless re-put.
pub const VALUE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Interval of the expiry sweep over provider and value records.
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Per-subscription delivery queue depth.
pub const DEFAULT_DELIVERY_QUEUE: usize = 1024;

/// Number of recently seen gossip message ids kept for deduplication.
pub const DEFAULT_SEEN_CACHE: usize = 8192;

/// Interval between full subscription re-announcements to known peers.
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Addresses the transport listens on. The UDP backend binds the first.
    pub listen_addrs: Vec<String>,
    pub bootstrap: Vec<BootstrapPeer>,
    /// Persistent identity location; `None` means ephemeral.
    pub identity_path: Option<PathBuf>,
    pub request_timeout: Duration,
    pub dht: DhtConfig,
    pub overlay: OverlayConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addrs: vec!["0.0.0.0:0".to_string()],
            bootstrap: Vec::new(),
            identity_path: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            dht: DhtConfig::default(),
            overlay: OverlayConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout.is_zero() {
            return Err(NetError::InvalidConfig("request_timeout must be non-zero".into()));
        }
        if self.listen_addrs.iter().any(|a| a.trim().is_empty()) {
            return Err(NetError::InvalidConfig("listen address must not be empty".into()));
        }
        self.dht.validate()?;
        self.overlay.validate()
    }
}

#[derive(Clone, Debug)]
pub struct DhtConfig {
    pub k: usize,
    pub alpha: usize,
    pub max_failures: u32,
    pub query_timeout: Duration,
    pub provider_ttl: Duration,
    pub value_ttl: Duration,
    pub max_value_size: usize,
    pub maintenance_interval: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            max_failures: DEFAULT_MAX_FAILURES,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            provider_ttl: PROVIDER_TTL,
            value_ttl: VALUE_TTL,
            max_value_size: MAX_VALUE_SIZE,
            maintenance_interval: MAINTENANCE_INTERVAL,
        }
    }
}

impl DhtConfig {
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(NetError::InvalidConfig("dht.k must be at least 1".into()));
        }
        if self.alpha == 0 || self.alpha > self.k {
            return Err(NetError::InvalidConfig(format!(
                "dht.alpha must be within 1..={}",
                self.k
            )));
        }
        if self.max_failures == 0 {
            return Err(NetError::InvalidConfig("dht.max_failures must be at least 1".into()));
        }
        if self.max_value_size == 0 || self.max_value_size > MAX_VALUE_SIZE {
            return Err(NetError::InvalidConfig(format!(
                "dht.max_value_size must be within 1..={MAX_VALUE_SIZE}"
            )));
        }
        if self.query_timeout.is_zero() || self.provider_ttl.is_zero() || self.value_ttl.is_zero() {
            return Err(NetError::InvalidConfig("dht timeouts and ttls must be non-zero".into()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct OverlayConfig {
    pub delivery_queue: usize,
    pub seen_cache: usize,
    pub announce_interval: Duration,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            delivery_queue: DEFAULT_DELIVERY_QUEUE,
            seen_cache: DEFAULT_SEEN_CACHE,
            announce_interval: DEFAULT_ANNOUNCE_INTERVAL,
        }
    }
}

impl OverlayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.delivery_queue == 0 || self.seen_cache == 0 {
            return Err(NetError::InvalidConfig(
                "overlay queue and cache sizes must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Reliable stream tunables.
#[derive(Clone, Debug)]
pub struct RldpConfig {
    /// Largest payload carried by one DATA frame.
    pub max_frame_payload: usize,
    /// Maximum unacknowledged bytes in flight per stream.
    pub send_window: usize,
    /// Receive window in frames, counted from the next expected sequence.
    pub recv_window: u64,
    pub initial_rto: Duration,
    pub max_rto: Duration,
    /// Retransmissions of one frame before the stream aborts.
    pub max_retries: u32,
    /// How long a sequence gap may persist before a NACK is sent.
    pub gap_fill_timeout: Duration,
    /// How long `close` waits for the peer's close-ack.
    pub close_grace: Duration,
    pub idle_timeout: Duration,
    /// Interval between repeated open-requests while opening.
    pub open_retry_interval: Duration,
    /// Pending open-requests waiting for `accept`.
    pub accept_backlog: usize,
}

impl Default for RldpConfig {
    fn default() -> Self {
        Self {
            max_frame_payload: 1024,
            send_window: 64 * 1024,
            recv_window: 256,
            initial_rto: Duration::from_millis(200),
            max_rto: Duration::from_secs(5),
            max_retries: 8,
            gap_fill_timeout: Duration::from_millis(100),
            close_grace: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(120),
            open_retry_interval: Duration::from_millis(250),
            accept_backlog: 64,
        }
    }
}

/// Room left in a datagram for the transport envelope around a stream frame.
const DATAGRAM_ENVELOPE_ALLOWANCE: usize = 1024;

impl RldpConfig {
    /// Unread bytes a stream buffers before refusing further data.
    pub fn recv_buffer_limit(&self) -> usize {
        (self.recv_window as usize).saturating_mul(self.max_frame_payload)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_frame_payload == 0 || self.max_frame_payload > u16::MAX as usize {
            return Err(NetError::InvalidConfig(
                "rldp.max_frame_payload must be within 1..=65535".into(),
            ));
        }
        let frame_len = FRAME_HEADER_LEN + self.max_frame_payload + FRAME_CHECKSUM_LEN;
        if frame_len + DATAGRAM_ENVELOPE_ALLOWANCE > MAX_DATAGRAM_SIZE {
            return Err(NetError::InvalidConfig(format!(
                "rldp.max_frame_payload too large: {frame_len}-byte frames do not fit a datagram"
            )));
        }
        if self.send_window < self.max_frame_payload {
            return Err(NetError::InvalidConfig(
                "rldp.send_window must hold at least one frame".into(),
            ));
        }
        if self.recv_window == 0 || self.accept_backlog == 0 {
            return Err(NetError::InvalidConfig(
                "rldp.recv_window and rldp.accept_backlog must be non-zero".into(),
            ));
        }
        if self.initial_rto.is_zero() || self.max_rto < self.initial_rto {
            return Err(NetError::InvalidConfig(
                "rldp.initial_rto must be non-zero and not above rldp.max_rto".into(),
            ));
        }
        if self.open_retry_interval.is_zero()
            || self.gap_fill_timeout.is_zero()
            || self.close_grace.is_zero()
            || self.idle_timeout.is_zero()
        {
            return Err(NetError::InvalidConfig("rldp intervals must be non-zero".into()));
        }
        Ok(())
    }
}

/// A seed peer in the form `HOST:PORT/HEX_PEER_ID`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootstrapPeer {
    pub address: String,
    pub peer_id: Identity,
}

impl BootstrapPeer {
    pub fn peer_address(&self) -> PeerAddress {
        PeerAddress::new(self.peer_id, self.address.clone())
    }
}

impl FromStr for BootstrapPeer {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self> {
        let (address, id) = s.rsplit_once('/').ok_or_else(|| {
            NetError::InvalidConfig(format!(
                "bootstrap peer {s:?} must have the form HOST:PORT/PEER_ID"
            ))
        })?;
        if address.is_empty() || !address.contains(':') {
            return Err(NetError::InvalidConfig(format!(
                "bootstrap peer {s:?} has no HOST:PORT part"
            )));
        }
        let peer_id = Identity::from_hex(id).map_err(|e| {
            NetError::InvalidConfig(format!("bootstrap peer id must be 64 hex characters: {e}"))
        })?;
        Ok(Self {
            address: address.to_string(),
            peer_id,
        })
    }
}

impl fmt::Display for BootstrapPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.peer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    #[test]
    fn defaults_validate() {
        NodeConfig::default().validate().unwrap();
        RldpConfig::default().validate().unwrap();
        assert_eq!(NodeConfig::default().request_timeout, Duration::from_secs(10));
    }

    #[test]
    fn rejects_structural_problems() {
        let mut dht = DhtConfig::default();
        dht.k = 0;
        assert!(matches!(dht.validate(), Err(NetError::InvalidConfig(_))));

        let mut dht = DhtConfig::default();
        dht.alpha = dht.k + 1;
        assert!(matches!(dht.validate(), Err(NetError::InvalidConfig(_))));

        let mut rldp = RldpConfig::default();
        rldp.send_window = rldp.max_frame_payload - 1;
        assert!(matches!(rldp.validate(), Err(NetError::InvalidConfig(_))));

        let mut rldp = RldpConfig::default();
        rldp.idle_timeout = Duration::ZERO;
        assert!(matches!(rldp.validate(), Err(NetError::InvalidConfig(_))));

        let mut rldp = RldpConfig::default();
        rldp.close_grace = Duration::ZERO;
        assert!(matches!(rldp.validate(), Err(NetError::InvalidConfig(_))));

        let mut rldp = RldpConfig::default();
        rldp.max_frame_payload = u16::MAX as usize;
        rldp.send_window = rldp.max_frame_payload;
        assert!(matches!(rldp.validate(), Err(NetError::InvalidConfig(_))));
        assert_eq!(RldpConfig::default().recv_buffer_limit(), 256 * 1024);

        let mut node = NodeConfig::default();
        node.listen_addrs = vec![" ".into()];
        assert!(matches!(node.validate(), Err(NetError::InvalidConfig(_))));
    }

    #[test]
    fn bootstrap_peer_parses_and_displays() {
        let id = Keypair::generate().identity();
        let text = format!("127.0.0.1:4100/{}", id.to_hex());
        let peer: BootstrapPeer = text.parse().unwrap();
        assert_eq!(peer.address, "127.0.0.1:4100");
        assert_eq!(peer.peer_id, id);
        assert_eq!(peer.to_string(), text);
        assert_eq!(peer.peer_address().peer_id, id);
    }

    #[test]
    fn bootstrap_peer_rejects_malformed() {
        assert!("127.0.0.1:4100".parse::<BootstrapPeer>().is_err());
        assert!("127.0.0.1:4100/abcd".parse::<BootstrapPeer>().is_err());
        let id = Keypair::generate().identity().to_hex();
        assert!(format!("/{id}").parse::<BootstrapPeer>().is_err());
    }
}
