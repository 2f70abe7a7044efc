//! # Kademlia-style Distributed Hash Table
//!
//! Keys are arbitrary byte strings hashed with BLAKE3 into the same 256-bit
//! space as peer ids; closeness is the XOR distance between the two.
//!
//! ## Key Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `find_peer(id)` | Resolve a peer's address via iterative lookup |
//! | `provide(key)` | Store a provider record at the K closest peers |
//! | `find_providers(key, limit)` | Merge provider records from the closest peers |
//! | `put(key, value)` | Store a versioned value at the K closest peers |
//! | `get(key)` | Fetch the highest-version value among responders |
//! | `bootstrap(seeds)` | Join the network through known peers |
//!
//! ## State
//!
//! The routing table, provider records and values each sit behind their own
//! `RwLock`. Lookups take read locks and proceed concurrently; observations,
//! stores and expiry take the write lock only for the mutation itself.
//!
//! ## Routing Table
//!
//! 256 buckets indexed by the length of the common id prefix. Each bucket
//! holds at most K entries ordered least-recently-seen first. A fresh contact
//! arriving at a full bucket evicts the least-recently-seen entry. An entry is
//! dropped after `max_failures` consecutive failed queries.
//!
//! ## Values
//!
//! Values are last-writer-wins by `(version, publisher)`. Versions are
//! `max(now_ms, highest_seen + 1)`, where `highest_seen` covers every version
//! this node has issued, stored or read. A put first reads the replicas it is
//! about to overwrite, so a put that follows another node's completed put is
//! always stamped higher.

use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, watch};
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::DhtConfig;
use crate::context::OpContext;
use crate::error::{NetError, Result};
use crate::identity::{Identity, PeerAddress, distance_cmp, now_ms};
use crate::node::shutdown_requested;
use crate::protocols::DhtRpc;

/// 32-byte position in the keyspace.
pub type Key = [u8; 32];

/// Upper bound on lookup rounds regardless of progress.
const MAX_LOOKUP_ROUNDS: usize = 20;

/// Hash an application key into the DHT keyspace.
pub fn hash_key(raw: &[u8]) -> Key {
    *blake3::hash(raw).as_bytes()
}

fn key_target(key: &Key) -> Identity {
    Identity::from_bytes(*key)
}

fn short(key: &Key) -> String {
    hex::encode(&key[..8])
}

// ============================================================================
// Records
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueRecord {
    pub value: Vec<u8>,
    pub version: u64,
    pub publisher: Identity,
}

impl ValueRecord {
    /// Strictly newer by version, ties broken by publisher id.
    pub fn supersedes(&self, other: &ValueRecord) -> bool {
        (self.version, self.publisher) > (other.version, other.publisher)
    }
}

/// Issues strictly increasing, wall-clock anchored versions that stay ahead
/// of every version passed to `observe`.
#[derive(Debug, Default)]
pub struct VersionClock {
    last: AtomicU64,
}

impl VersionClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        let now = now_ms();
        let mut current = self.last.load(AtomicOrdering::Acquire);
        loop {
            let next = now.max(current.saturating_add(1));
            match self.last.compare_exchange_weak(
                current,
                next,
                AtomicOrdering::AcqRel,
                AtomicOrdering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// Record a version seen elsewhere; later versions will exceed it.
    pub fn observe(&self, version: u64) {
        self.last.fetch_max(version, AtomicOrdering::AcqRel);
    }
}

// ============================================================================
// Routing Table
// ============================================================================

#[derive(Clone, Debug)]
pub struct RoutingEntry {
    pub peer: PeerAddress,
    pub distance: [u8; 32],
    pub last_seen: Instant,
    pub failures: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TouchOutcome {
    Inserted,
    Refreshed,
    /// The bucket was full; the least-recently-seen entry made room.
    Evicted(Identity),
}

#[derive(Debug, Default)]
struct RoutingBucket {
    /// Least-recently-seen first.
    entries: Vec<RoutingEntry>,
}

impl RoutingBucket {
    fn touch(&mut self, peer: PeerAddress, distance: [u8; 32], k: usize) -> TouchOutcome {
        if let Some(pos) = self.entries.iter().position(|e| e.peer.peer_id == peer.peer_id) {
            let mut entry = self.entries.remove(pos);
            entry.peer = peer;
            entry.last_seen = Instant::now();
            entry.failures = 0;
            self.entries.push(entry);
            return TouchOutcome::Refreshed;
        }

        let entry = RoutingEntry {
            peer,
            distance,
            last_seen: Instant::now(),
            failures: 0,
        };
        if self.entries.len() < k {
            self.entries.push(entry);
            TouchOutcome::Inserted
        } else {
            let evicted = self.entries.remove(0);
            self.entries.push(entry);
            TouchOutcome::Evicted(evicted.peer.peer_id)
        }
    }

    fn record_failure(&mut self, id: &Identity, max_failures: u32) -> bool {
        let Some(pos) = self.entries.iter().position(|e| &e.peer.peer_id == id) else {
            return false;
        };
        self.entries[pos].failures += 1;
        if self.entries[pos].failures >= max_failures {
            self.entries.remove(pos);
            true
        } else {
            false
        }
    }

    fn remove(&mut self, id: &Identity) -> bool {
        if let Some(pos) = self.entries.iter().position(|e| &e.peer.peer_id == id) {
            self.entries.remove(pos);
            true
        } else {
            false
        }
    }
}

fn bucket_index(self_id: &Identity, other: &Identity) -> usize {
    let dist = self_id.xor_distance(other);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            return byte_idx * 8 + byte.leading_zeros() as usize;
        }
    }
    255
}

#[derive(Debug)]
pub struct RoutingTable {
    self_id: Identity,
    k: usize,
    buckets: Vec<RoutingBucket>,
}

impl RoutingTable {
    pub fn new(self_id: Identity, k: usize) -> Self {
        let mut buckets = Vec::with_capacity(256);
        buckets.resize_with(256, RoutingBucket::default);
        Self {
            self_id,
            k,
            buckets,
        }
    }

    /// Record a successful contact. Returns `None` for our own id and for ids
    /// that are not valid public keys.
    pub fn update(&mut self, peer: PeerAddress) -> Option<TouchOutcome> {
        if peer.peer_id == self.self_id || !peer.peer_id.is_valid() {
            return None;
        }
        let idx = bucket_index(&self.self_id, &peer.peer_id);
        let distance = self.self_id.xor_distance(&peer.peer_id);
        Some(self.buckets[idx].touch(peer, distance, self.k))
    }

    /// Count a failed query. Returns true if the entry was removed.
    pub fn record_failure(&mut self, id: &Identity, max_failures: u32) -> bool {
        if *id == self.self_id {
            return false;
        }
        let idx = bucket_index(&self.self_id, id);
        self.buckets[idx].record_failure(id, max_failures)
    }

    pub fn remove(&mut self, id: &Identity) -> bool {
        if *id == self.self_id {
            return false;
        }
        let idx = bucket_index(&self.self_id, id);
        self.buckets[idx].remove(id)
    }

    pub fn entry(&self, id: &Identity) -> Option<&RoutingEntry> {
        if *id == self.self_id {
            return None;
        }
        let idx = bucket_index(&self.self_id, id);
        self.buckets[idx].entries.iter().find(|e| &e.peer.peer_id == id)
    }

    pub fn lookup(&self, id: &Identity) -> Option<PeerAddress> {
        self.entry(id).map(|e| e.peer.clone())
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn peers(&self) -> Vec<PeerAddress> {
        self.buckets
            .iter()
            .flat_map(|b| b.entries.iter().map(|e| e.peer.clone()))
            .collect()
    }

    /// Up to `k` known peers, closest to `target` first.
    pub fn closest(&self, target: &Identity, k: usize) -> Vec<PeerAddress> {
        if k == 0 {
            return Vec::new();
        }

        #[derive(Eq, PartialEq)]
        struct ByDistance {
            dist: [u8; 32],
            peer: PeerAddress,
        }

        impl Ord for ByDistance {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                distance_cmp(&self.dist, &other.dist)
            }
        }

        impl PartialOrd for ByDistance {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        let mut heap: BinaryHeap<ByDistance> = BinaryHeap::with_capacity(k + 1);
        for bucket in &self.buckets {
            for entry in &bucket.entries {
                let dist = entry.peer.peer_id.xor_distance(target);
                heap.push(ByDistance {
                    dist,
                    peer: entry.peer.clone(),
                });
                if heap.len() > k {
                    heap.pop();
                }
            }
        }

        heap.into_sorted_vec().into_iter().map(|e| e.peer).collect()
    }
}

fn sort_by_distance(peers: &mut [PeerAddress], target: &Identity) {
    peers.sort_by(|a, b| {
        distance_cmp(&a.peer_id.xor_distance(target), &b.peer_id.xor_distance(target))
    });
}

// ============================================================================
// Provider and Value Stores
// ============================================================================

#[derive(Clone, Debug)]
struct ProviderEntry {
    address: PeerAddress,
    expires: Instant,
}

/// Provider records keyed by DHT key, then by provider id.
#[derive(Debug)]
pub struct ProviderStore {
    ttl: Duration,
    records: HashMap<Key, BTreeMap<Identity, ProviderEntry>>,
}

impl ProviderStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            records: HashMap::new(),
        }
    }

    /// Insert or refresh. Re-announcing never duplicates an entry.
    pub fn add(&mut self, key: Key, provider: PeerAddress) {
        let expires = Instant::now() + self.ttl;
        self.records.entry(key).or_default().insert(
            provider.peer_id,
            ProviderEntry {
                address: provider,
                expires,
            },
        );
    }

    /// Live providers ordered by peer id ascending.
    pub fn providers(&self, key: &Key) -> Vec<PeerAddress> {
        let now = Instant::now();
        self.records
            .get(key)
            .map(|entries| {
                entries
                    .values()
                    .filter(|e| e.expires > now)
                    .map(|e| e.address.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub fn remove_provider(&mut self, key: &Key, provider: &Identity) -> bool {
        let Some(entries) = self.records.get_mut(key) else {
            return false;
        };
        let removed = entries.remove(provider).is_some();
        if entries.is_empty() {
            self.records.remove(key);
        }
        removed
    }

    /// Drop expired records, returning how many were removed.
    pub fn expire(&mut self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.records.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|_, e| e.expires > now);
            removed += before - entries.len();
            !entries.is_empty()
        });
        removed
    }

    pub fn key_count(&self) -> usize {
        self.records.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    /// Identical record already present; expiry refreshed.
    Unchanged,
    /// A newer record is already present; nothing changed.
    Stale,
}

#[derive(Debug)]
struct StoredValue {
    record: ValueRecord,
    expires: Instant,
}

#[derive(Debug)]
pub struct ValueStore {
    ttl: Duration,
    records: HashMap<Key, StoredValue>,
}

impl ValueStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            records: HashMap::new(),
        }
    }

    pub fn put(&mut self, key: Key, record: ValueRecord) -> StoreOutcome {
        let now = Instant::now();
        let expires = now + self.ttl;
        match self.records.get_mut(&key) {
            Some(existing) if existing.expires > now => {
                if existing.record == record {
                    existing.expires = expires;
                    StoreOutcome::Unchanged
                } else if record.supersedes(&existing.record) {
                    *existing = StoredValue { record, expires };
                    StoreOutcome::Stored
                } else {
                    StoreOutcome::Stale
                }
            }
            _ => {
                self.records.insert(key, StoredValue { record, expires });
                StoreOutcome::Stored
            }
        }
    }

    pub fn get(&self, key: &Key) -> Option<ValueRecord> {
        let now = Instant::now();
        self.records
            .get(key)
            .filter(|v| v.expires > now)
            .map(|v| v.record.clone())
    }

    pub fn expire(&mut self) -> usize {
        let now = Instant::now();
        let before = self.records.len();
        self.records.retain(|_, v| v.expires > now);
        before - self.records.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

// ============================================================================
// DHT Node
// ============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DhtTelemetry {
    pub routing_peers: usize,
    pub provider_keys: usize,
    pub stored_values: usize,
}

pub struct DhtNode<N: DhtRpc> {
    inner: Arc<DhtShared<N>>,
}

impl<N: DhtRpc> Clone for DhtNode<N> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct DhtShared<N: DhtRpc> {
    self_addr: PeerAddress,
    config: DhtConfig,
    network: Arc<N>,
    routing: RwLock<RoutingTable>,
    providers: RwLock<ProviderStore>,
    values: RwLock<ValueStore>,
    versions: VersionClock,
}

type Replies<T> = Vec<(PeerAddress, Result<T>)>;

impl<N: DhtRpc> DhtNode<N> {
    pub fn new(self_addr: PeerAddress, network: N, config: DhtConfig) -> Self {
        let self_id = self_addr.peer_id;
        Self {
            inner: Arc::new(DhtShared {
                routing: RwLock::new(RoutingTable::new(self_id, config.k)),
                providers: RwLock::new(ProviderStore::new(config.provider_ttl)),
                values: RwLock::new(ValueStore::new(config.value_ttl)),
                versions: VersionClock::new(),
                network: Arc::new(network),
                self_addr,
                config,
            }),
        }
    }

    pub fn identity(&self) -> Identity {
        self.inner.self_addr.peer_id
    }

    pub fn self_addr(&self) -> &PeerAddress {
        &self.inner.self_addr
    }

    pub fn network(&self) -> &N {
        &self.inner.network
    }

    pub fn config(&self) -> &DhtConfig {
        &self.inner.config
    }

    /// Record a peer that just proved it is alive.
    pub async fn observe(&self, peer: PeerAddress) {
        let outcome = self.inner.routing.write().await.update(peer.clone());
        if let Some(TouchOutcome::Evicted(old)) = outcome {
            trace!(evicted = %old.fingerprint(), added = %peer.peer_id.fingerprint(), "bucket full, evicted least-recently-seen");
        }
    }

    async fn record_failure(&self, id: &Identity) {
        let max = self.inner.config.max_failures;
        if self.inner.routing.write().await.record_failure(id, max) {
            debug!(peer = %id.fingerprint(), "dropped unreachable peer from routing table");
        }
    }

    pub async fn routing_peers(&self) -> Vec<PeerAddress> {
        self.inner.routing.read().await.peers()
    }

    pub async fn telemetry(&self) -> DhtTelemetry {
        DhtTelemetry {
            routing_peers: self.inner.routing.read().await.len(),
            provider_keys: self.inner.providers.read().await.key_count(),
            stored_values: self.inner.values.read().await.len(),
        }
    }

    // ------------------------------------------------------------------------
    // Inbound requests
    // ------------------------------------------------------------------------

    pub async fn handle_ping(&self, from: &PeerAddress) {
        self.observe(from.clone()).await;
    }

    pub async fn handle_find_node(&self, from: &PeerAddress, target: Identity) -> Vec<PeerAddress> {
        self.observe(from.clone()).await;
        self.closest_excluding(&target, &from.peer_id).await
    }

    pub async fn handle_find_value(
        &self,
        from: &PeerAddress,
        key: Key,
    ) -> (Option<ValueRecord>, Vec<PeerAddress>) {
        self.observe(from.clone()).await;
        let record = self.inner.values.read().await.get(&key);
        let closer = self.closest_excluding(&key_target(&key), &from.peer_id).await;
        (record, closer)
    }

    pub async fn handle_store(&self, from: &PeerAddress, key: Key, record: ValueRecord) -> Result<()> {
        let max = self.inner.config.max_value_size;
        if record.value.len() > max {
            return Err(NetError::ValueTooLarge {
                size: record.value.len(),
                max,
            });
        }
        self.observe(from.clone()).await;
        self.inner.versions.observe(record.version);
        let outcome = self.inner.values.write().await.put(key, record);
        trace!(key = %short(&key), from = %from.peer_id.fingerprint(), ?outcome, "store request");
        Ok(())
    }

    pub async fn handle_add_provider(&self, from: &PeerAddress, key: Key) {
        self.observe(from.clone()).await;
        self.inner.providers.write().await.add(key, from.clone());
    }

    pub async fn handle_get_providers(
        &self,
        from: &PeerAddress,
        key: Key,
    ) -> (Vec<PeerAddress>, Vec<PeerAddress>) {
        self.observe(from.clone()).await;
        let providers = self.inner.providers.read().await.providers(&key);
        let closer = self.closest_excluding(&key_target(&key), &from.peer_id).await;
        (providers, closer)
    }

    async fn closest_excluding(&self, target: &Identity, exclude: &Identity) -> Vec<PeerAddress> {
        let mut closest = self
            .inner
            .routing
            .read()
            .await
            .closest(target, self.inner.config.k + 1);
        closest.retain(|p| &p.peer_id != exclude);
        closest.truncate(self.inner.config.k);
        closest
    }

    // ------------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------------

    /// Query `peers` concurrently, each bounded by the per-query timeout.
    async fn fan_out<T, F, Fut>(&self, ctx: &OpContext, peers: Vec<PeerAddress>, call: F) -> Replies<T>
    where
        T: Send + 'static,
        F: Fn(Arc<N>, PeerAddress) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let per_query = ctx.bounded(self.inner.config.query_timeout);
        let mut join_set = JoinSet::new();
        for peer in peers {
            let fut = call(self.inner.network.clone(), peer.clone());
            join_set.spawn(async move {
                let result = match tokio::time::timeout(per_query, fut).await {
                    Ok(r) => r,
                    Err(_) => Err(NetError::Timeout),
                };
                (peer, result)
            });
        }

        let mut replies = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            if let Ok(reply) = joined {
                replies.push(reply);
            }
        }
        replies
    }

    /// Same as [`fan_out`](Self::fan_out) but bounded by the caller's context.
    /// Expiry aborts the in-flight queries.
    async fn fan_out_ctx<T, F, Fut>(&self, ctx: &OpContext, peers: Vec<PeerAddress>, call: F) -> Result<Replies<T>>
    where
        T: Send + 'static,
        F: Fn(Arc<N>, PeerAddress) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        ctx.run(async { Ok(self.fan_out(ctx, peers, call).await) }).await
    }

    /// Iterative lookup of the K closest responsive peers to `target`.
    pub async fn lookup(&self, ctx: &OpContext, target: Identity) -> Result<Vec<PeerAddress>> {
        self.lookup_until(ctx, target, None).await
    }

    async fn lookup_until(
        &self,
        ctx: &OpContext,
        target: Identity,
        stop_at: Option<Identity>,
    ) -> Result<Vec<PeerAddress>> {
        ctx.check()?;
        let k = self.inner.config.k;
        let alpha = self.inner.config.alpha;
        let self_id = self.identity();

        let mut shortlist = self.inner.routing.read().await.closest(&target, k);
        let mut seen: HashSet<Identity> = shortlist.iter().map(|p| p.peer_id).collect();
        seen.insert(self_id);
        let mut queried: HashSet<Identity> = HashSet::new();
        let mut best = shortlist
            .first()
            .map(|p| p.peer_id.xor_distance(&target))
            .unwrap_or([0xff; 32]);
        // After a round without progress, query every remaining candidate once.
        let mut stalled = false;

        for _ in 0..MAX_LOOKUP_ROUNDS {
            if let Some(wanted) = stop_at {
                if shortlist.iter().any(|p| p.peer_id == wanted) {
                    break;
                }
            }

            let width = if stalled { k } else { alpha };
            let candidates: Vec<PeerAddress> = shortlist
                .iter()
                .filter(|p| !queried.contains(&p.peer_id))
                .take(width)
                .cloned()
                .collect();
            if candidates.is_empty() {
                break;
            }
            for c in &candidates {
                queried.insert(c.peer_id);
            }

            let replies = self
                .fan_out_ctx(ctx, candidates, move |net, peer| async move {
                    net.find_node(&peer, target).await
                })
                .await?;

            for (peer, reply) in replies {
                match reply {
                    Ok(nodes) => {
                        self.observe(peer).await;
                        for n in nodes {
                            if seen.insert(n.peer_id) {
                                shortlist.push(n);
                            }
                        }
                    }
                    Err(e) => {
                        trace!(peer = %peer.peer_id.fingerprint(), error = %e, "find_node failed");
                        self.record_failure(&peer.peer_id).await;
                        shortlist.retain(|p| p.peer_id != peer.peer_id);
                    }
                }
            }

            sort_by_distance(&mut shortlist, &target);
            shortlist.truncate(k);

            let new_best = shortlist
                .first()
                .map(|p| p.peer_id.xor_distance(&target))
                .unwrap_or([0xff; 32]);
            if distance_cmp(&new_best, &best) == std::cmp::Ordering::Less {
                best = new_best;
                stalled = false;
            } else if stalled {
                break;
            } else {
                stalled = true;
            }
        }

        debug!(
            target = %target.fingerprint(),
            found = shortlist.len(),
            queried = queried.len(),
            "iterative lookup completed"
        );
        Ok(shortlist)
    }

    /// Resolve `id` to a live address. A routing-table hit is confirmed with
    /// a ping before it is trusted.
    pub async fn find_peer(&self, ctx: &OpContext, id: &Identity) -> Result<PeerAddress> {
        ctx.check()?;
        if *id == self.identity() {
            return Ok(self.inner.self_addr.clone());
        }

        let known = self.inner.routing.read().await.lookup(id);
        if let Some(peer) = known {
            let probe = ctx.bounded(self.inner.config.query_timeout);
            let network = self.inner.network.clone();
            let alive = ctx
                .run(async {
                    Ok(matches!(
                        tokio::time::timeout(probe, network.ping(&peer)).await,
                        Ok(Ok(()))
                    ))
                })
                .await?;
            if alive {
                self.observe(peer.clone()).await;
                return Ok(peer);
            }
            self.record_failure(id).await;
        }

        let found = self.lookup_until(ctx, *id, Some(*id)).await?;
        match found.into_iter().find(|p| p.peer_id == *id) {
            Some(peer) => Ok(peer),
            None => {
                // Queries cut short by the deadline are a timeout, not a miss.
                ctx.check()?;
                Err(NetError::PeerNotFound(*id))
            }
        }
    }

    /// Announce this node as a provider of `raw_key`. Returns the number of
    /// remote peers that accepted the record.
    pub async fn provide(&self, ctx: &OpContext, raw_key: &[u8]) -> Result<usize> {
        let key = hash_key(raw_key);
        self.inner
            .providers
            .write()
            .await
            .add(key, self.inner.self_addr.clone());

        let closest = self.lookup(ctx, key_target(&key)).await?;
        let replies = self
            .fan_out_ctx(ctx, closest, move |net, peer| async move {
                net.add_provider(&peer, key).await
            })
            .await?;

        let mut accepted = 0;
        for (peer, reply) in replies {
            match reply {
                Ok(()) => accepted += 1,
                Err(_) => self.record_failure(&peer.peer_id).await,
            }
        }
        debug!(key = %short(&key), replicas = accepted, "provider record announced");
        Ok(accepted)
    }

    /// Providers of `raw_key`, deduplicated and ordered by peer id.
    /// `limit == 0` returns every provider found.
    pub async fn find_providers(
        &self,
        ctx: &OpContext,
        raw_key: &[u8],
        limit: usize,
    ) -> Result<Vec<PeerAddress>> {
        let key = hash_key(raw_key);
        let mut merged: BTreeMap<Identity, PeerAddress> = self
            .inner
            .providers
            .read()
            .await
            .providers(&key)
            .into_iter()
            .map(|p| (p.peer_id, p))
            .collect();

        let closest = self.lookup(ctx, key_target(&key)).await?;
        let replies = self
            .fan_out_ctx(ctx, closest, move |net, peer| async move {
                net.get_providers(&peer, key).await
            })
            .await?;

        for (peer, reply) in replies {
            match reply {
                Ok((providers, _closer)) => {
                    self.observe(peer).await;
                    for provider in providers {
                        merged.entry(provider.peer_id).or_insert(provider);
                    }
                }
                Err(_) => self.record_failure(&peer.peer_id).await,
            }
        }

        if merged.is_empty() {
            return Err(NetError::NoProviders);
        }
        let mut providers: Vec<PeerAddress> = merged.into_values().collect();
        if limit > 0 {
            providers.truncate(limit);
        }
        Ok(providers)
    }

    /// Store `value` under `raw_key` locally and at the K closest peers.
    /// Returns the number of remote replicas written.
    pub async fn put(&self, ctx: &OpContext, raw_key: &[u8], value: Vec<u8>) -> Result<usize> {
        let max = self.inner.config.max_value_size;
        if value.len() > max {
            return Err(NetError::ValueTooLarge {
                size: value.len(),
                max,
            });
        }
        let key = hash_key(raw_key);
        let closest = self.lookup(ctx, key_target(&key)).await?;

        // Stamp above whatever the replicas currently hold.
        if let Some(current) = self.inner.values.read().await.get(&key) {
            self.inner.versions.observe(current.version);
        }
        let current = self
            .fan_out_ctx(ctx, closest.clone(), move |net, peer| async move {
                net.find_value(&peer, key).await
            })
            .await?;
        for (_, reply) in current {
            if let Ok((Some(record), _)) = reply {
                self.inner.versions.observe(record.version);
            }
        }

        let record = ValueRecord {
            value,
            version: self.inner.versions.next(),
            publisher: self.identity(),
        };
        self.inner.values.write().await.put(key, record.clone());

        let replies = self
            .fan_out_ctx(ctx, closest, move |net, peer| {
                let record = record.clone();
                async move { net.store(&peer, key, record).await }
            })
            .await?;

        let mut stored = 0;
        for (peer, reply) in replies {
            match reply {
                Ok(()) => stored += 1,
                Err(_) => self.record_failure(&peer.peer_id).await,
            }
        }
        debug!(key = %short(&key), replicas = stored, "value stored");
        Ok(stored)
    }

    pub async fn get(&self, ctx: &OpContext, raw_key: &[u8]) -> Result<Vec<u8>> {
        Ok(self.get_record(ctx, raw_key).await?.value)
    }

    /// Highest-version record among the local store and every responder.
    /// Responders holding an older record, or none, are repaired.
    pub async fn get_record(&self, ctx: &OpContext, raw_key: &[u8]) -> Result<ValueRecord> {
        let key = hash_key(raw_key);
        let local = self.inner.values.read().await.get(&key);

        let closest = self.lookup(ctx, key_target(&key)).await?;
        let replies = self
            .fan_out_ctx(ctx, closest, move |net, peer| async move {
                net.find_value(&peer, key).await
            })
            .await?;

        let mut best = local.clone();
        let mut responders: Vec<(PeerAddress, Option<ValueRecord>)> = Vec::new();
        for (peer, reply) in replies {
            match reply {
                Ok((record, _closer)) => {
                    self.observe(peer.clone()).await;
                    if let Some(r) = &record {
                        self.inner.versions.observe(r.version);
                        if best.as_ref().is_none_or(|b| r.supersedes(b)) {
                            best = Some(r.clone());
                        }
                    }
                    responders.push((peer, record));
                }
                Err(_) => self.record_failure(&peer.peer_id).await,
            }
        }

        let Some(best) = best else {
            return Err(NetError::KeyNotFound);
        };

        let stale: Vec<PeerAddress> = responders
            .into_iter()
            .filter(|(_, r)| r.as_ref().is_none_or(|r| best.supersedes(r)))
            .map(|(peer, _)| peer)
            .collect();
        if !stale.is_empty() {
            trace!(key = %short(&key), peers = stale.len(), "read-repair");
            let repair = best.clone();
            let _ = self
                .fan_out_ctx(ctx, stale, move |net, peer| {
                    let record = repair.clone();
                    async move { net.store(&peer, key, record).await }
                })
                .await;
        }

        if local.as_ref().is_none_or(|l| best.supersedes(l)) {
            self.inner.values.write().await.put(key, best.clone());
        }
        Ok(best)
    }

    /// Ping the seeds, then look up our own id to populate nearby buckets.
    /// Returns the routing table size afterwards.
    pub async fn bootstrap(&self, ctx: &OpContext, seeds: &[PeerAddress]) -> Result<usize> {
        let self_id = self.identity();
        let seeds: Vec<PeerAddress> = seeds
            .iter()
            .filter(|s| s.peer_id != self_id)
            .cloned()
            .collect();

        let replies = self
            .fan_out_ctx(ctx, seeds, |net, peer| async move { net.ping(&peer).await })
            .await?;

        let mut reachable = 0;
        for (peer, reply) in replies {
            match reply {
                Ok(()) => {
                    self.observe(peer).await;
                    reachable += 1;
                }
                Err(e) => warn!(peer = %peer, error = %e, "bootstrap seed unreachable"),
            }
        }

        if reachable > 0 {
            self.lookup(ctx, self_id).await?;
        }
        let size = self.inner.routing.read().await.len();
        info!(seeds = reachable, routing_peers = size, "dht bootstrap complete");
        Ok(size)
    }

    /// Remove expired provider and value records.
    pub async fn expire(&self) -> (usize, usize) {
        let providers = self.inner.providers.write().await.expire();
        let values = self.inner.values.write().await.expire();
        (providers, values)
    }

    /// Periodic expiry sweep; returns when `shutdown` flips to true.
    pub async fn run_maintenance(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.inner.config.maintenance_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                _ = ticker.tick() => {
                    let (providers, values) = self.expire().await;
                    if providers + values > 0 {
                        debug!(providers, values, "expired dht records");
                    }
                }
            }
        }
        trace!("dht maintenance stopped");
    }
}
