//! Error taxonomy shared by every component.
//!
//! Callers match on [`NetError`] to decide between "try again later" and
//! "this will never succeed". [`NetError::is_retryable`] encodes that split.

use thiserror::Error;

use crate::identity::Identity;

/// Convenience alias used throughout the crate.
pub type Result<T, E = NetError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum NetError {
    /// No route to the peer could be resolved after exhausting the search frontier.
    #[error("peer not found: {0:?}")]
    PeerNotFound(Identity),

    /// No queried peer holds a value for the key.
    #[error("key not found")]
    KeyNotFound,

    /// No live provider record exists for the key.
    #[error("no providers found for key")]
    NoProviders,

    /// The caller's deadline elapsed before the operation resolved.
    #[error("operation timed out")]
    Timeout,

    /// The caller aborted the operation.
    #[error("operation canceled")]
    Canceled,

    /// A subscription for this topic is already registered in this process.
    #[error("already subscribed to topic {0:?}")]
    AlreadySubscribed(String),

    /// A registration with the same identity already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The publish is known to reach nobody.
    #[error("no subscribers for topic {0:?}")]
    NoSubscribers(String),

    /// Persisted identity material failed validation.
    #[error("corrupt key material: {0}")]
    CorruptKeyMaterial(String),

    /// No open-ack arrived before the deadline.
    #[error("stream open timed out")]
    OpenTimeout,

    /// The stream exceeded its retransmission budget or was reset by the peer.
    #[error("stream broken")]
    StreamBroken,

    /// The stream was closed locally, by the peer, or by node shutdown.
    #[error("stream closed")]
    StreamClosed,

    #[error("node not started")]
    NotStarted,

    #[error("node closed")]
    Closed,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("value too large: {size} bytes (max {max})")]
    ValueTooLarge { size: usize, max: usize },

    /// A single peer failed to answer. Retried internally by the DHT.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for NetError {
    fn from(e: bincode::Error) -> Self {
        NetError::Codec(e.to_string())
    }
}

impl NetError {
    /// True for the NotFound family (peer, key, provider).
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            NetError::PeerNotFound(_) | NetError::KeyNotFound | NetError::NoProviders
        )
    }

    /// True when repeating the operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NetError::PeerNotFound(_)
                | NetError::KeyNotFound
                | NetError::NoProviders
                | NetError::Timeout
                | NetError::OpenTimeout
                | NetError::NoSubscribers(_)
                | NetError::Transport(_)
                | NetError::NotStarted
        )
    }
}
