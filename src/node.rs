//! # Transport Node
//!
//! [`NetworkNode`] is the capability set every networking backend provides.
//! Everything above this layer (adapters, the stream layer, the binary)
//! holds an `Arc<dyn NetworkNode>` and never learns which backend it talks to.
//!
//! | Backend | Module | Transport |
//! |---------|--------|-----------|
//! | [`MemoryNode`](crate::MemoryNode) | `memory` | in-process hub, deterministic, fault injection |
//! | [`UdpNode`](crate::UdpNode) | `udp` | UDP socket running the `dht` and `overlay` engines |
//!
//! ## Lifecycle
//!
//! | Phase | `start` | `close` | network operations |
//! |-------|---------|---------|--------------------|
//! | Created | → Running | → Closed | `NotStarted` |
//! | Running | no-op | → Closed | allowed |
//! | Closed | `Closed` | no-op | `Closed` |
//!
//! Background work runs through [`NetworkNode::spawn`]. `close` signals every
//! task, waits for them and aborts stragglers, so nothing bound to the node
//! outlives the `close` call.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::context::OpContext;
use crate::error::{NetError, Result};
use crate::identity::{Identity, PeerAddress};
use crate::overlay::Subscription;

/// Background future bound to a node's lifetime.
pub type NodeTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A receiver that can be taken exactly once.
pub(crate) type TakeOnce<T> = tokio::sync::Mutex<Option<mpsc::Receiver<T>>>;

/// How long `close` waits for background tasks before aborting them.
pub const TASK_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Capacity of the inbound datagram queue.
pub const DATAGRAM_QUEUE: usize = 4096;

/// An unreliable payload received from a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Datagram {
    pub from: PeerAddress,
    pub payload: Vec<u8>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeTelemetry {
    pub routing_peers: usize,
    pub provider_keys: usize,
    pub stored_values: usize,
    pub subscriptions: usize,
    pub overlay_peers: usize,
    pub background_tasks: usize,
}

#[async_trait]
pub trait NetworkNode: Send + Sync + 'static {
    /// Bring the node up. Idempotent while running; fails with `Closed`
    /// once the node has been closed.
    async fn start(&self, ctx: &OpContext) -> Result<()>;

    /// Release subscriptions, stop background tasks. Idempotent.
    async fn close(&self, ctx: &OpContext) -> Result<()>;

    fn addr(&self) -> PeerAddress;

    fn peer_id(&self) -> Identity;

    async fn publish(&self, ctx: &OpContext, topic: &str, data: Vec<u8>) -> Result<()>;

    async fn subscribe(&self, topic: &str) -> Result<Subscription>;

    /// Idempotent; ends the topic's delivery channel.
    async fn unsubscribe(&self, topic: &str) -> Result<()>;

    async fn find_peer(&self, ctx: &OpContext, id: &Identity) -> Result<PeerAddress>;

    async fn provide(&self, ctx: &OpContext, key: &[u8]) -> Result<()>;

    /// `limit == 0` returns every provider found.
    async fn find_providers(
        &self,
        ctx: &OpContext,
        key: &[u8],
        limit: usize,
    ) -> Result<Vec<PeerAddress>>;

    async fn put_value(&self, ctx: &OpContext, key: &[u8], value: Vec<u8>) -> Result<()>;

    async fn get_value(&self, ctx: &OpContext, key: &[u8]) -> Result<Vec<u8>>;

    /// Best-effort, unordered, possibly lost.
    async fn send_datagram(&self, to: &PeerAddress, payload: Vec<u8>) -> Result<()>;

    /// The inbound datagram queue. Yields `Some` exactly once.
    async fn take_datagrams(&self) -> Option<mpsc::Receiver<Datagram>>;

    /// Flips to `true` when the node begins closing.
    fn shutdown_signal(&self) -> watch::Receiver<bool>;

    /// Run `task` until the node closes. Fails unless the node is running.
    fn spawn(&self, task: NodeTask) -> Result<()>;

    async fn telemetry(&self) -> NodeTelemetry;
}

/// Resolves once `rx` reads `true` or its sender is gone.
pub(crate) async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

// ============================================================================
// Lifecycle
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodePhase {
    Created,
    Running,
    Closed,
}

struct LifecycleState {
    phase: NodePhase,
    tasks: Vec<JoinHandle<()>>,
}

/// Phase tracking and task ownership shared by the backends.
pub(crate) struct Lifecycle {
    state: StdMutex<LifecycleState>,
    shutdown: watch::Sender<bool>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            state: StdMutex::new(LifecycleState {
                phase: NodePhase::Created,
                tasks: Vec::new(),
            }),
            shutdown,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LifecycleState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn phase(&self) -> NodePhase {
        self.lock().phase
    }

    /// Returns true if the caller should perform startup, false if the node
    /// is already running.
    pub fn begin_start(&self) -> Result<bool> {
        let mut state = self.lock();
        match state.phase {
            NodePhase::Created => {
                state.phase = NodePhase::Running;
                Ok(true)
            }
            NodePhase::Running => Ok(false),
            NodePhase::Closed => Err(NetError::Closed),
        }
    }

    /// Undo a failed startup.
    pub fn abort_start(&self) {
        let mut state = self.lock();
        if state.phase == NodePhase::Running {
            state.phase = NodePhase::Created;
        }
    }

    pub fn ensure_running(&self) -> Result<()> {
        match self.phase() {
            NodePhase::Running => Ok(()),
            NodePhase::Created => Err(NetError::NotStarted),
            NodePhase::Closed => Err(NetError::Closed),
        }
    }

    /// Returns true on the first call only.
    pub fn begin_close(&self) -> bool {
        let mut state = self.lock();
        if state.phase == NodePhase::Closed {
            return false;
        }
        state.phase = NodePhase::Closed;
        true
    }

    pub fn spawn(&self, task: NodeTask) -> Result<()> {
        let mut state = self.lock();
        match state.phase {
            NodePhase::Running => {}
            NodePhase::Created => return Err(NetError::NotStarted),
            NodePhase::Closed => return Err(NetError::Closed),
        }
        state.tasks.retain(|t| !t.is_finished());
        state.tasks.push(tokio::spawn(task));
        Ok(())
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn task_count(&self) -> usize {
        self.lock().tasks.iter().filter(|t| !t.is_finished()).count()
    }

    /// Signal shutdown, wait for tasks within the grace period, abort the rest.
    pub async fn shutdown(&self, ctx: &OpContext) {
        self.shutdown.send_replace(true);
        let tasks = std::mem::take(&mut self.lock().tasks);
        let deadline = Instant::now() + ctx.bounded(TASK_SHUTDOWN_GRACE);

        let mut aborted = 0usize;
        for mut task in tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                task.abort();
                let _ = task.await;
                aborted += 1;
            }
        }
        if aborted > 0 {
            warn!(aborted, "background tasks did not stop within grace period");
        } else {
            debug!("background tasks stopped");
        }
    }
}
