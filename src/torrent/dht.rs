//! DHT peer discovery (BEP 5)
//!
//! A continuous `get_peers` recursion over KRPC/UDP. The node table is a
//! flat bucket keyed by host: each round queries the K lowest-distance
//! nodes still marked `New`, merges returned `nodes` into the bucket and
//! delivers returned `values` (peer addresses) to the swarm. Queried nodes
//! are never asked twice; when the bucket runs out of fresh nodes it is
//! cleared and reseeded from the bootstrap list.
//!
//! Two distance orderings are supported: the canonical 160-bit XOR metric
//! and a cheaper u64-prefix approximation. Which one is active flips on a
//! configured cadence of reseeds; the cadence is policy, not behavior
//! baked into the loop.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::RngCore;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;

use super::bencode::BencodeValue;
use super::metainfo::Sha1Hash;
use crate::config::DhtConfig;
use crate::error::{EngineError, ProtocolErrorKind, Result};

/// Distance ordering between a node id and the target infohash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceMetric {
    /// Full 160-bit XOR distance, compared lexicographically
    Canonical,
    /// XOR of the first 8 bytes only; cheaper, approximately the same
    /// ordering for the nodes that matter
    Prefix,
}

impl DistanceMetric {
    pub fn flip(self) -> Self {
        match self {
            Self::Canonical => Self::Prefix,
            Self::Prefix => Self::Canonical,
        }
    }
}

/// Sort key for a node under a metric. Nodes without a known id (fresh
/// bootstrap entries) sort last; with an empty table they are queried
/// anyway.
fn distance_key(id: Option<&[u8; 20]>, target: &Sha1Hash, metric: DistanceMetric) -> [u8; 20] {
    match id {
        None => [0xFF; 20],
        Some(id) => {
            let mut xor = [0u8; 20];
            for i in 0..20 {
                xor[i] = id[i] ^ target[i];
            }
            match metric {
                DistanceMetric::Canonical => xor,
                DistanceMetric::Prefix => {
                    let mut key = [0u8; 20];
                    key[..8].copy_from_slice(&xor[..8]);
                    key
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeStatus {
    /// Never queried
    New,
    /// Queried; this implementation does not reuse responded nodes
    Requested,
    /// Timed out or replied garbage; purged with the next bucket clear
    Failed,
}

#[derive(Debug, Clone)]
struct DhtNode {
    id: Option<[u8; 20]>,
    status: NodeStatus,
}

/// A parsed `get_peers` reply
#[derive(Debug, Default)]
struct GetPeersReply {
    nodes: Vec<(SocketAddr, [u8; 20])>,
    peers: Vec<SocketAddr>,
}

/// Continuous trackerless peer discovery for one torrent
pub struct DhtDiscovery {
    info_hash: Sha1Hash,
    node_id: [u8; 20],
    config: DhtConfig,
    table: Mutex<HashMap<SocketAddr, DhtNode>>,
    metric: Mutex<DistanceMetric>,
    peer_tx: mpsc::Sender<Vec<SocketAddr>>,
    shutdown: AtomicBool,
}

impl DhtDiscovery {
    pub fn new(
        info_hash: Sha1Hash,
        config: DhtConfig,
        peer_tx: mpsc::Sender<Vec<SocketAddr>>,
    ) -> Self {
        let mut node_id = [0u8; 20];
        rand::rng().fill_bytes(&mut node_id);

        Self {
            info_hash,
            node_id,
            config,
            table: Mutex::new(HashMap::new()),
            metric: Mutex::new(DistanceMetric::Canonical),
            peer_tx,
            shutdown: AtomicBool::new(false),
        }
    }

    /// Stop the discovery loop. The loop notices at its next round.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Active distance ordering (policy introspection)
    pub fn metric(&self) -> DistanceMetric {
        *self.metric.lock()
    }

    /// Run the lookup recursion until [`stop`](Self::stop).
    ///
    /// This is a background process, not a one-shot query: it keeps
    /// walking toward the infohash and re-walking from the bootstrap set,
    /// delivering every batch of discovered peers through the channel.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.reseed().await;

        let mut rounds_this_seed = 0u32;
        let mut reseeds = 0u32;

        while !self.is_stopped() {
            let targets = self.pick_targets();

            // A bounded number of rounds per seeding keeps termination of
            // each walk auditable, however many nodes replies feed us.
            if targets.is_empty() || rounds_this_seed >= self.config.max_rounds_per_seed {
                reseeds += 1;
                if self.config.metric_flip > 0 && reseeds.is_multiple_of(self.config.metric_flip) {
                    let mut metric = self.metric.lock();
                    *metric = metric.flip();
                    tracing::debug!("dht distance metric flipped to {:?}", *metric);
                }
                self.table.lock().clear();
                self.reseed().await;
                rounds_this_seed = 0;
                tokio::time::sleep(self.config.round_interval).await;
                continue;
            }
            rounds_this_seed += 1;

            let mut queries = JoinSet::new();
            for addr in targets {
                let dht = Arc::clone(&self);
                queries.spawn(async move {
                    let reply = dht.query_get_peers(addr).await;
                    (addr, reply)
                });
            }

            let mut discovered = Vec::new();
            while let Some(joined) = queries.join_next().await {
                let Ok((addr, reply)) = joined else { continue };
                match reply {
                    Ok(reply) => {
                        self.merge_reply(addr, reply, &mut discovered);
                    }
                    Err(e) => {
                        tracing::trace!("dht node {} failed: {}", addr, e);
                        if let Some(node) = self.table.lock().get_mut(&addr) {
                            node.status = NodeStatus::Failed;
                        }
                    }
                }
            }

            if !discovered.is_empty() {
                discovered.sort();
                discovered.dedup();
                tracing::debug!("dht round discovered {} peers", discovered.len());
                if self.peer_tx.send(discovered).await.is_err() {
                    // Swarm is gone; nothing left to discover for.
                    break;
                }
            }

            tokio::time::sleep(self.config.round_interval).await;
        }

        Ok(())
    }

    /// Resolve the bootstrap list into fresh table entries
    async fn reseed(&self) {
        for name in &self.config.bootstrap_nodes {
            match tokio::net::lookup_host(name.as_str()).await {
                Ok(addrs) => {
                    let mut table = self.table.lock();
                    for addr in addrs.filter(|a| a.is_ipv4()) {
                        table.entry(addr).or_insert(DhtNode {
                            id: None,
                            status: NodeStatus::New,
                        });
                    }
                }
                Err(e) => {
                    tracing::debug!("dht bootstrap {} did not resolve: {}", name, e);
                }
            }
        }
    }

    /// Up to K `New` nodes with minimal distance, marked `Requested`
    fn pick_targets(&self) -> Vec<SocketAddr> {
        let metric = self.metric();
        let mut table = self.table.lock();

        let mut fresh: Vec<(SocketAddr, [u8; 20])> = table
            .iter()
            .filter(|(_, node)| node.status == NodeStatus::New)
            .map(|(addr, node)| {
                (
                    *addr,
                    distance_key(node.id.as_ref(), &self.info_hash, metric),
                )
            })
            .collect();

        fresh.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));
        fresh.truncate(self.config.query_parallelism.max(1));

        for (addr, _) in &fresh {
            if let Some(node) = table.get_mut(addr) {
                node.status = NodeStatus::Requested;
            }
        }

        fresh.into_iter().map(|(addr, _)| addr).collect()
    }

    /// Merge a reply's nodes into the table and collect its peer values
    fn merge_reply(
        &self,
        from: SocketAddr,
        reply: GetPeersReply,
        discovered: &mut Vec<SocketAddr>,
    ) {
        let mut table = self.table.lock();

        if let Some(node) = table.get_mut(&from) {
            node.status = NodeStatus::Requested;
        }

        for (addr, id) in reply.nodes {
            table
                .entry(addr)
                .and_modify(|node| {
                    if node.id.is_none() {
                        node.id = Some(id);
                    }
                })
                .or_insert(DhtNode {
                    id: Some(id),
                    status: NodeStatus::New,
                });
        }

        discovered.extend(reply.peers);
    }

    /// One `get_peers` exchange over a throwaway UDP socket
    async fn query_get_peers(&self, addr: SocketAddr) -> Result<GetPeersReply> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(addr).await.map_err(|e| {
            EngineError::protocol(
                ProtocolErrorKind::DhtError,
                format!("dht connect failed: {}", e),
            )
        })?;

        let mut txn = [0u8; 2];
        rand::rng().fill_bytes(&mut txn);

        let query = build_get_peers(&txn, &self.node_id, &self.info_hash);
        socket.send(&query).await.map_err(|e| {
            EngineError::protocol(ProtocolErrorKind::DhtError, format!("dht send failed: {}", e))
        })?;

        let mut buf = [0u8; 2048];
        let len = timeout(self.config.query_timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| {
                EngineError::protocol(ProtocolErrorKind::DhtError, "dht query timeout")
            })?
            .map_err(|e| {
                EngineError::protocol(ProtocolErrorKind::DhtError, format!("dht recv failed: {}", e))
            })?;

        parse_get_peers_reply(&buf[..len], &txn)
    }
}

/// Build a `get_peers` query:
/// `{t, y:"q", q:"get_peers", a:{id, info_hash}}`
fn build_get_peers(txn: &[u8; 2], node_id: &[u8; 20], info_hash: &Sha1Hash) -> Vec<u8> {
    let mut args = std::collections::BTreeMap::new();
    args.insert(b"id".to_vec(), BencodeValue::Bytes(node_id.to_vec()));
    args.insert(
        b"info_hash".to_vec(),
        BencodeValue::Bytes(info_hash.to_vec()),
    );

    let mut root = std::collections::BTreeMap::new();
    root.insert(b"a".to_vec(), BencodeValue::Dict(args));
    root.insert(b"q".to_vec(), BencodeValue::Bytes(b"get_peers".to_vec()));
    root.insert(b"t".to_vec(), BencodeValue::Bytes(txn.to_vec()));
    root.insert(b"y".to_vec(), BencodeValue::Bytes(b"q".to_vec()));

    BencodeValue::Dict(root).encode()
}

/// Parse a `get_peers` response:
/// `{t, y:"r", r:{id, token?, nodes?, values?}}`
fn parse_get_peers_reply(data: &[u8], expected_txn: &[u8; 2]) -> Result<GetPeersReply> {
    let value = BencodeValue::parse_exact(data).map_err(|_| {
        EngineError::protocol(ProtocolErrorKind::DhtError, "malformed dht reply")
    })?;

    let txn = value.get("t").and_then(|v| v.as_bytes()).ok_or_else(|| {
        EngineError::protocol(ProtocolErrorKind::DhtError, "dht reply missing transaction")
    })?;
    if txn != expected_txn {
        return Err(EngineError::protocol(
            ProtocolErrorKind::DhtError,
            "dht transaction id mismatch",
        ));
    }

    match value.get("y").and_then(|v| v.as_string()) {
        Some("r") => {}
        Some("e") => {
            return Err(EngineError::protocol(
                ProtocolErrorKind::DhtError,
                "dht node returned an error",
            ))
        }
        _ => {
            return Err(EngineError::protocol(
                ProtocolErrorKind::DhtError,
                "dht reply is not a response",
            ))
        }
    }

    let reply_dict = value.get("r").ok_or_else(|| {
        EngineError::protocol(ProtocolErrorKind::DhtError, "dht response missing body")
    })?;

    let mut reply = GetPeersReply::default();

    // Packed 26-byte entries: 20-byte node id + IPv4 + port.
    if let Some(nodes) = reply_dict.get("nodes").and_then(|v| v.as_bytes()) {
        for chunk in nodes.chunks_exact(26) {
            let mut id = [0u8; 20];
            id.copy_from_slice(&chunk[..20]);
            let ip = Ipv4Addr::new(chunk[20], chunk[21], chunk[22], chunk[23]);
            let port = u16::from_be_bytes([chunk[24], chunk[25]]);
            if port != 0 {
                reply
                    .nodes
                    .push((SocketAddr::new(IpAddr::V4(ip), port), id));
            }
        }
    }

    // Packed 6-byte peer entries.
    if let Some(values) = reply_dict.get("values").and_then(|v| v.as_list()) {
        for entry in values {
            if let Some(bytes) = entry.as_bytes() {
                reply
                    .peers
                    .extend(super::pex::parse_compact_peers_v4(bytes));
            }
        }
    }

    Ok(reply)
}
