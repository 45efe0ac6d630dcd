//! Swarm engine
//!
//! This module contains the whole BitTorrent side of the crate:
//! - Bencode codec and torrent/magnet parsing
//! - Peer wire protocol with the fast and extension protocols
//! - Piece scheduling with timeout/retry/endgame handling
//! - Metadata-over-wire bootstrap for magnet links (BEP 9)
//! - Tracker announces (HTTP/UDP) and DHT peer discovery (BEP 5)
//!
//! [`SwarmSession`] is the orchestrator: it owns the peer registry, admits
//! connections through a bounded pool, runs the periodic control loop and
//! mediates between peers, the piece store and storage.

pub mod bencode;
pub mod dht;
pub mod magnet;
pub mod metadata;
pub mod metainfo;
pub mod peer;
pub mod pex;
pub mod piece;
pub mod pool;
pub mod stats;
pub mod tracker;

pub use bencode::BencodeValue;
pub use dht::{DhtDiscovery, DistanceMetric};
pub use magnet::MagnetUri;
pub use metadata::{MetadataFetcher, MetadataMessage, MetadataMessageType, METADATA_PIECE_SIZE};
pub use metainfo::{FileInfo, Info, Metainfo, Sha1Hash};
pub use peer::{PeerLink, PeerMessage, PeerReader, PeerState, RemotePieces, BLOCK_SIZE};
pub use pex::{ExtensionHandshake, METADATA_EXTENSION_NAME, PEX_EXTENSION_NAME};
pub use piece::{BlockArrival, BlockRequest, PeerAvailability, PieceStore};
pub use pool::ConnectPool;
pub use stats::RateEstimator;
pub use tracker::{AnnounceEvent, AnnounceRequest, AnnounceResponse, TrackerClient};

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};

use crate::config::SwarmConfig;
use crate::error::{EngineError, ProtocolErrorKind, Result};
use crate::events::SwarmEvent;
use crate::storage::PartFile;
use crate::types::{PeerStateCounts, ProgressSnapshot, SessionState, SwarmStats, TorrentId};

/// One torrent's swarm: peers, scheduling, discovery, storage dispatch.
pub struct SwarmSession {
    id: TorrentId,
    info_hash: Sha1Hash,
    name: Mutex<String>,
    magnet: Option<MagnetUri>,
    download_dir: PathBuf,
    config: SwarmConfig,

    metainfo: RwLock<Option<Arc<Metainfo>>>,
    store: RwLock<Option<Arc<PieceStore>>>,
    storage: RwLock<Option<Arc<PartFile>>>,
    metadata_fetcher: RwLock<Option<Arc<MetadataFetcher>>>,

    state: Mutex<SessionState>,

    /// Every peer we track, candidates included, behind one lock.
    peers: Mutex<HashMap<SocketAddr, Arc<PeerLink>>>,
    /// Addresses learned from trackers/DHT/PEX not yet promoted to links.
    known_peers: Mutex<HashSet<SocketAddr>>,

    pool: Arc<ConnectPool>,
    tracker: TrackerClient,
    event_tx: broadcast::Sender<SwarmEvent>,

    dht: Mutex<Option<Arc<DhtDiscovery>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,

    rate: Mutex<RateEstimator>,
    peer_counts: Mutex<PeerStateCounts>,
    last_announce: Mutex<Instant>,

    next_focus_id: AtomicU64,
    read_cancelled: AtomicBool,
    shutdown: AtomicBool,
    finalizing: AtomicBool,
}

impl SwarmSession {
    /// Create a session from parsed .torrent metadata.
    pub async fn from_metainfo(
        id: TorrentId,
        metainfo: Metainfo,
        download_dir: PathBuf,
        config: SwarmConfig,
        event_tx: broadcast::Sender<SwarmEvent>,
    ) -> Result<Arc<Self>> {
        let metainfo = Arc::new(metainfo);
        let session = Self::bare(
            id,
            metainfo.info_hash,
            metainfo.info.name.clone(),
            None,
            download_dir,
            config,
            event_tx,
            SessionState::Downloading,
        )?;
        session.install_metainfo(Arc::clone(&metainfo)).await?;
        Ok(session)
    }

    /// Create a session from a magnet link; metadata comes over the wire.
    pub fn from_magnet(
        id: TorrentId,
        magnet: MagnetUri,
        download_dir: PathBuf,
        config: SwarmConfig,
        event_tx: broadcast::Sender<SwarmEvent>,
    ) -> Result<Arc<Self>> {
        let fetcher = Arc::new(MetadataFetcher::new(
            magnet.info_hash,
            config.metadata_request_budget as usize,
        ));
        let session = Self::bare(
            id,
            magnet.info_hash,
            magnet.name(),
            Some(magnet),
            download_dir,
            config,
            event_tx,
            SessionState::Metadata,
        )?;
        *session.metadata_fetcher.write() = Some(fetcher);
        Ok(session)
    }

    #[allow(clippy::too_many_arguments)]
    fn bare(
        id: TorrentId,
        info_hash: Sha1Hash,
        name: String,
        magnet: Option<MagnetUri>,
        download_dir: PathBuf,
        config: SwarmConfig,
        event_tx: broadcast::Sender<SwarmEvent>,
        state: SessionState,
    ) -> Result<Arc<Self>> {
        let pool = ConnectPool::new(config.connect_slots);
        let tracker = TrackerClient::new()?;

        Ok(Arc::new(Self {
            id,
            info_hash,
            name: Mutex::new(name),
            magnet,
            download_dir,
            config,
            metainfo: RwLock::new(None),
            store: RwLock::new(None),
            storage: RwLock::new(None),
            metadata_fetcher: RwLock::new(None),
            state: Mutex::new(state),
            peers: Mutex::new(HashMap::new()),
            known_peers: Mutex::new(HashSet::new()),
            pool,
            tracker,
            event_tx,
            dht: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            rate: Mutex::new(RateEstimator::new()),
            peer_counts: Mutex::new(PeerStateCounts::default()),
            last_announce: Mutex::new(Instant::now() - Duration::from_secs(3600)),
            next_focus_id: AtomicU64::new(1),
            read_cancelled: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            finalizing: AtomicBool::new(false),
        }))
    }

    /// Wire up piece tracking and storage for known metadata.
    async fn install_metainfo(&self, metainfo: Arc<Metainfo>) -> Result<()> {
        let store = Arc::new(PieceStore::new(
            &metainfo,
            self.config.endgame_block_threshold,
        ));
        let part = PartFile::create(
            self.download_dir.clone(),
            &metainfo.info.name,
            metainfo.info.piece_length,
            metainfo.info.total_size,
            metainfo.file_spans(),
        )
        .await?;

        *self.name.lock() = metainfo.info.name.clone();
        *self.store.write() = Some(store);
        *self.storage.write() = Some(Arc::new(part));
        *self.metainfo.write() = Some(metainfo);
        Ok(())
    }

    // Accessors

    pub fn id(&self) -> TorrentId {
        self.id
    }

    pub fn info_hash(&self) -> &Sha1Hash {
        &self.info_hash
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().clone()
    }

    pub fn metainfo(&self) -> Option<Arc<Metainfo>> {
        self.metainfo.read().clone()
    }

    fn store(&self) -> Option<Arc<PieceStore>> {
        self.store.read().clone()
    }

    fn storage(&self) -> Option<Arc<PartFile>> {
        self.storage.read().clone()
    }

    fn fetcher(&self) -> Option<Arc<MetadataFetcher>> {
        self.metadata_fetcher.read().clone()
    }

    fn num_pieces(&self) -> usize {
        self.store().map(|s| s.piece_count() as usize).unwrap_or(0)
    }

    fn is_private(&self) -> bool {
        self.metainfo
            .read()
            .as_ref()
            .map(|m| m.info.private)
            .unwrap_or(false)
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn emit(&self, event: SwarmEvent) {
        let _ = self.event_tx.send(event);
    }

    fn set_state(&self, new_state: SessionState) {
        let old_state = {
            let mut state = self.state.lock();
            if *state == new_state {
                return;
            }
            std::mem::replace(&mut *state, new_state.clone())
        };
        self.emit(SwarmEvent::StateChanged {
            id: self.id,
            old_state,
            new_state,
        });
    }

    /// Accumulated statistics with the latest peer-state census.
    pub fn stats(&self) -> SwarmStats {
        let mut stats = self.store().map(|s| s.stats()).unwrap_or_default();
        stats.peers = *self.peer_counts.lock();
        stats
    }

    /// Progress snapshot for the front-end.
    pub fn progress(&self) -> ProgressSnapshot {
        let rate = self.rate.lock();
        let connections = self.peer_counts.lock();
        let active =
            connections.connected + connections.ready + connections.downloading;

        match self.store() {
            Some(store) => {
                let completed = store.bytes_complete();
                let remaining = store.total_size().saturating_sub(completed);
                ProgressSnapshot {
                    total_size: Some(store.total_size()),
                    completed_size: completed,
                    pieces_have: store.pieces_have(),
                    pieces_total: store.piece_count(),
                    download_speed: rate.instant_rate(),
                    average_speed: rate.average_rate(),
                    connections: active,
                    eta_seconds: rate.eta_seconds(remaining),
                }
            }
            None => ProgressSnapshot {
                connections: active,
                ..Default::default()
            },
        }
    }

    // Lifecycle

    /// Start the control loop, discovery and the initial announce.
    pub fn start(self: &Arc<Self>) {
        self.emit(SwarmEvent::Started { id: self.id });

        let session = Arc::clone(self);
        self.tasks
            .lock()
            .push(tokio::spawn(async move { session.run_control_loop().await }));

        let session = Arc::clone(self);
        self.tasks.lock().push(tokio::spawn(async move {
            session.announce_round(AnnounceEvent::Started).await;
        }));

        if self.config.dht.enabled && !self.is_private() {
            self.spawn_dht();
        }
    }

    fn spawn_dht(self: &Arc<Self>) {
        let (peer_tx, mut peer_rx) = mpsc::channel(32);
        let discovery = Arc::new(DhtDiscovery::new(
            self.info_hash,
            self.config.dht.clone(),
            peer_tx,
        ));
        *self.dht.lock() = Some(Arc::clone(&discovery));

        let session = Arc::clone(self);
        self.tasks.lock().push(tokio::spawn(async move {
            while let Some(peers) = peer_rx.recv().await {
                session.add_candidates(peers);
            }
        }));

        self.tasks.lock().push(tokio::spawn(async move {
            if let Err(e) = discovery.run().await {
                tracing::warn!("dht discovery stopped: {}", e);
            }
        }));
    }

    /// Stop the session. Safe to call more than once.
    pub async fn stop(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        if !self.state().is_terminal() {
            self.set_state(SessionState::Stopped);
        }
        self.cancel_reads();

        if let Some(dht) = self.dht.lock().take() {
            dht.stop();
        }

        let links: Vec<Arc<PeerLink>> = self.peers.lock().values().cloned().collect();
        for link in links {
            if let Some(store) = self.store() {
                store.drop_peer_requests(link.addr());
            }
            link.clear_outstanding();
            link.disconnect().await;
        }

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }

        self.announce_round(AnnounceEvent::Stopped).await;
    }

    /// Stop with a session-fatal error.
    async fn fail(&self, error: EngineError) {
        tracing::error!("session {} stopped with error: {}", self.id, error);
        let retryable = error.is_retryable();
        self.set_state(SessionState::Error {
            kind: "fatal".to_string(),
            message: error.to_string(),
            retryable,
        });
        self.emit(SwarmEvent::Failed {
            id: self.id,
            error: error.to_string(),
            retryable,
        });
        self.stop().await;
    }

    // Candidate management

    /// Feed candidate addresses from trackers, DHT or PEX.
    pub fn add_candidates(&self, addrs: impl IntoIterator<Item = SocketAddr>) {
        let mut known = self.known_peers.lock();
        let mut peers = self.peers.lock();
        for addr in addrs {
            known.insert(addr);
            peers
                .entry(addr)
                .or_insert_with(|| Arc::new(PeerLink::new(addr)));
        }
    }

    fn census(&self) -> PeerStateCounts {
        let peers = self.peers.lock();
        let mut counts = PeerStateCounts::default();
        for link in peers.values() {
            match link.state() {
                PeerState::New => counts.new += 1,
                PeerState::Connecting => counts.connecting += 1,
                PeerState::Connected => counts.connected += 1,
                PeerState::Ready => counts.ready += 1,
                PeerState::Downloading => counts.downloading += 1,
                PeerState::Failed => counts.failed += 1,
            }
        }
        counts
    }

    fn active_connections(&self) -> usize {
        let counts = self.census();
        (counts.connecting + counts.connected + counts.ready + counts.downloading) as usize
    }

    // Control loop

    async fn run_control_loop(self: Arc<Self>) {
        let mut dispatch =
            tokio::time::interval(Duration::from_millis(self.config.dispatch_interval_ms));
        let mut sweep = tokio::time::interval(Duration::from_millis(self.config.sweep_interval_ms));
        let mut stats_tick =
            tokio::time::interval(Duration::from_secs(self.config.stats_interval_secs));
        let mut housekeeping = tokio::time::interval(Duration::from_secs(10));

        loop {
            if self.is_shutdown() {
                break;
            }

            tokio::select! {
                _ = dispatch.tick() => self.dispatch_tick(),
                _ = sweep.tick() => self.sweep_tick(),
                _ = stats_tick.tick() => self.stats_tick(),
                _ = housekeeping.tick() => self.housekeeping_tick(),
            }

            if let Some(store) = self.store() {
                if store.is_complete() && !self.finalizing.swap(true, Ordering::SeqCst) {
                    let session = Arc::clone(&self);
                    tokio::spawn(async move { session.finalize().await });
                }
            }
        }
    }

    /// Per-tick: hand every `Ready` peer its next batch and admit `New`
    /// peers through the connect pool.
    fn dispatch_tick(self: &Arc<Self>) {
        if !self.state().is_active() {
            return;
        }

        let links: Vec<Arc<PeerLink>> = self.peers.lock().values().cloned().collect();

        for link in &links {
            if link.state() == PeerState::Ready {
                let session = Arc::clone(self);
                let link = Arc::clone(link);
                tokio::spawn(async move { session.dispatch_batch(&link).await });
            }
        }

        // Connection admission: bounded by both the configured peer cap
        // and the pool's free connect slots.
        let mut admitted = Vec::new();
        {
            let active = self.active_connections();
            let budget = self.config.max_peers.saturating_sub(active);
            let peers = self.peers.lock();
            for link in peers.values() {
                if admitted.len() >= budget {
                    break;
                }
                if link.state() == PeerState::New {
                    admitted.push(Arc::clone(link));
                }
            }
        }

        for link in admitted {
            let Some(slot) = self.pool.dispatch() else {
                break;
            };
            // Taken out of `New` here so the next tick skips it.
            link.set_state(PeerState::Connecting);
            let session = Arc::clone(self);
            tokio::spawn(async move { session.run_peer(link, slot).await });
        }
    }

    /// Expire overdue requests and disconnect peers over their budget.
    fn sweep_tick(self: &Arc<Self>) {
        if let Some(store) = self.store() {
            let expired = store.sweep_timeouts(
                self.config.request_timeout,
                self.config.aggressive_request_timeout,
            );

            let mut strikes: HashMap<SocketAddr, (u32, u32)> = HashMap::new();
            for (addr, aggressive) in expired {
                let entry = strikes.entry(addr).or_default();
                if aggressive {
                    entry.1 += 1;
                } else {
                    entry.0 += 1;
                }
            }

            for (addr, (normal, aggressive)) in strikes {
                let link = self.peers.lock().get(&addr).cloned();
                let Some(link) = link else { continue };

                for _ in 0..(normal + aggressive) {
                    link.request_settled();
                }
                let total =
                    link.timeouts.fetch_add(normal + aggressive, Ordering::SeqCst)
                        + normal
                        + aggressive;

                let over_budget = total > self.config.retry_budget
                    || (aggressive > 0 && total > self.config.aggressive_retry_budget);
                if over_budget {
                    tracing::debug!("peer {} exhausted its retry budget", addr);
                    let session = Arc::clone(self);
                    tokio::spawn(async move { session.drop_peer(addr).await });
                }
            }
        }

        if let Some(fetcher) = self.fetcher() {
            fetcher.sweep_timeouts(self.config.metadata_request_timeout);
        }
    }

    /// Recompute rates, reclassify peers, purge failed links, publish.
    fn stats_tick(&self) {
        if let Some(store) = self.store() {
            self.rate.lock().sample(store.stats().bytes_downloaded);

            for focus_id in store.take_completed_focus() {
                self.emit(SwarmEvent::FocusDone {
                    id: self.id,
                    focus_id,
                });
            }
        }

        // Failed links leave the registry; their addresses stay known and
        // may be re-learned from discovery later.
        {
            let mut peers = self.peers.lock();
            let mut known = self.known_peers.lock();
            peers.retain(|addr, link| {
                if link.state() == PeerState::Failed {
                    known.remove(addr);
                    false
                } else {
                    true
                }
            });
        }

        *self.peer_counts.lock() = self.census();

        self.emit(SwarmEvent::StatsUpdated {
            id: self.id,
            progress: self.progress(),
            stats: self.stats(),
        });
    }

    /// Keep-alives, interest nudges, low-water re-announce.
    fn housekeeping_tick(self: &Arc<Self>) {
        if !self.state().is_active() {
            return;
        }

        let links: Vec<Arc<PeerLink>> = self.peers.lock().values().cloned().collect();
        for link in links {
            match link.state() {
                PeerState::Ready | PeerState::Downloading => {}
                _ => continue,
            }

            if link.idle_time() >= self.config.keepalive_interval {
                let link2 = Arc::clone(&link);
                tokio::spawn(async move {
                    link2.send_keep_alive().await.ok();
                });
            }

            // A peer that keeps choking us gets its interest restated.
            if !link.is_unchoked() {
                let link2 = Arc::clone(&link);
                tokio::spawn(async move {
                    link2.send_interested().await.ok();
                });
            }
        }

        let starving = self.known_peers.lock().len() < self.config.peer_low_water;
        let cooled_down = self.last_announce.lock().elapsed() > Duration::from_secs(60);
        if starving && cooled_down {
            let session = Arc::clone(self);
            tokio::spawn(async move {
                session.announce_round(AnnounceEvent::None).await;
            });
        }
    }

    // Peer driving

    /// Connect, handshake and run one peer's message loop to completion.
    async fn run_peer(self: Arc<Self>, link: Arc<PeerLink>, slot: pool::ConnectSlot) {
        let peer_id = *self.tracker.peer_id();
        let read_half = match link
            .connect(
                self.info_hash,
                peer_id,
                self.config.connect_timeout,
                self.config.handshake_timeout,
            )
            .await
        {
            Ok(half) => half,
            Err(e) => {
                tracing::debug!("peer {} connect failed: {}", link.addr(), e);
                return;
            }
        };
        // Past handshake: the connect slot goes back to the pool, the
        // long-lived read loop keeps only its own task.
        drop(slot);

        tracing::debug!("peer {} connected", link.addr());
        link.send_interested().await.ok();

        let mut reader = PeerReader::new(read_half, self.config.keepalive_interval * 2);

        loop {
            if self.is_shutdown() || !self.state().is_active() {
                break;
            }

            let msg = match reader.next_message().await {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::debug!("peer {} read error: {}", link.addr(), e);
                    break;
                }
            };

            if let Err(e) = self.handle_peer_message(&link, msg).await {
                tracing::debug!("peer {} protocol fault: {}", link.addr(), e);
                break;
            }
        }

        self.drop_peer_link(&link).await;
    }

    /// Disconnect a specific link, returning its outstanding work first.
    ///
    /// Works on the link itself, not the registry entry: after a metadata
    /// promotion the registry may already hold a fresh candidate link for
    /// the same address, which must survive.
    async fn drop_peer_link(&self, link: &Arc<PeerLink>) {
        if let Some(store) = self.store() {
            store.drop_peer_requests(link.addr());
        }
        link.clear_outstanding();
        link.disconnect().await;
        // The registry entry is purged by the next stats sweep.
    }

    /// Disconnect whichever link currently serves an address.
    async fn drop_peer(&self, addr: SocketAddr) {
        let link = self.peers.lock().get(&addr).cloned();
        if let Some(link) = link {
            self.drop_peer_link(&link).await;
        }
    }

    /// Inbound message dispatch for one peer.
    async fn handle_peer_message(
        self: &Arc<Self>,
        link: &Arc<PeerLink>,
        msg: PeerMessage,
    ) -> Result<()> {
        link.apply_message(&msg, self.num_pieces());

        match msg {
            PeerMessage::Choke => {
                // A choking peer will not answer: abandon its outstanding
                // requests now instead of waiting for the timeout sweep.
                if let Some(store) = self.store() {
                    store.drop_peer_requests(link.addr());
                }
                link.clear_outstanding();
            }

            PeerMessage::Unchoke => {
                self.dispatch_batch(link).await;
            }

            PeerMessage::Piece {
                index,
                begin,
                block,
            } => {
                let remaining = link.request_settled();

                let Some(store) = self.store() else {
                    return Ok(());
                };
                match store.on_block_received(index, begin, &block, link.addr())? {
                    BlockArrival::Accepted | BlockArrival::Dropped => {}
                    BlockArrival::HashMismatch => {}
                    BlockArrival::Complete { data, redundant } => {
                        let Some(storage) = self.storage() else {
                            return Ok(());
                        };
                        if let Err(e) = storage.write_piece(index, &data).await {
                            // Disk faults have no partial recovery path.
                            self.fail(e).await;
                            return Ok(());
                        }
                        store.mark_piece_written(index);
                        tracing::debug!("piece {} verified and written", index);

                        // Withdraw the endgame duplicates other peers are
                        // still holding for this piece.
                        if !redundant.is_empty() {
                            let peers = self.peers.lock().clone();
                            for entry in redundant {
                                if entry.peer == link.addr() {
                                    continue;
                                }
                                let Some(other) = peers.get(&entry.peer) else {
                                    continue;
                                };
                                let other = Arc::clone(other);
                                tokio::spawn(async move {
                                    other
                                        .cancel_block(
                                            entry.piece,
                                            entry.block * BLOCK_SIZE,
                                            entry.length,
                                        )
                                        .await
                                        .ok();
                                    other.request_settled();
                                });
                            }
                        }
                    }
                }

                // Self-pipelining: an idle unchoked peer asks for the next
                // batch immediately rather than waiting for the tick.
                if remaining == 0 {
                    self.dispatch_batch(link).await;
                }
            }

            PeerMessage::RejectRequest {
                index,
                begin,
                length: _,
            } => {
                let remaining = link.request_settled();
                link.rejects.fetch_add(1, Ordering::SeqCst);
                if let Some(store) = self.store() {
                    store.on_block_rejected(index, begin, link.addr());
                }
                if remaining == 0 {
                    self.dispatch_batch(link).await;
                }
            }

            PeerMessage::Extended { id, payload } => {
                self.handle_extended(link, id, &payload).await?;
            }

            PeerMessage::Unknown { id, .. } => {
                // Payload was already drained by the framing layer; the
                // stream stays aligned.
                tracing::trace!("peer {} sent unknown message id {}", link.addr(), id);
            }

            _ => {}
        }

        Ok(())
    }

    /// Extended-envelope sub-dispatch (BEP 10).
    async fn handle_extended(
        self: &Arc<Self>,
        link: &Arc<PeerLink>,
        ext_id: u8,
        payload: &[u8],
    ) -> Result<()> {
        if ext_id == 0 {
            let handshake = pex::parse_extension_handshake(payload)?;
            link.apply_extension_handshake(handshake);

            // A metadata-capable peer can serve the magnet bootstrap
            // right away.
            if self.fetcher().is_some() {
                self.dispatch_metadata_requests(link).await;
            }
            return Ok(());
        }

        if ext_id == pex::OUR_METADATA_EXTENSION_ID {
            return self.handle_metadata_message(link, payload).await;
        }

        if ext_id == pex::OUR_PEX_EXTENSION_ID {
            match pex::parse_pex_added(payload) {
                Ok(added) if !added.is_empty() => {
                    tracing::debug!("peer {} sent {} PEX peers", link.addr(), added.len());
                    self.add_candidates(added);
                }
                Ok(_) => {}
                Err(e) => tracing::debug!("peer {} sent bad PEX message: {}", link.addr(), e),
            }
            return Ok(());
        }

        tracing::trace!("peer {} used unknown extension id {}", link.addr(), ext_id);
        Ok(())
    }

    /// ut_metadata data/reject handling and the metadata-to-download
    /// mode transition.
    async fn handle_metadata_message(
        self: &Arc<Self>,
        link: &Arc<PeerLink>,
        payload: &[u8],
    ) -> Result<()> {
        let Some(fetcher) = self.fetcher() else {
            return Ok(());
        };

        let msg = MetadataMessage::parse(payload)?;
        if matches!(
            msg.msg_type,
            MetadataMessageType::Data | MetadataMessageType::Reject
        ) {
            link.request_settled();
        }

        match fetcher.process_message(msg) {
            Ok(true) => {
                // Only the first completion performs the mode transition.
                if self.metadata_fetcher.write().take().is_none() {
                    return Ok(());
                }

                let raw = fetcher.metadata().ok_or_else(|| {
                    EngineError::Internal("metadata complete but missing".to_string())
                })?;
                let trackers = self
                    .magnet
                    .as_ref()
                    .map(|m| m.trackers.clone())
                    .unwrap_or_default();

                let promoted = match Metainfo::from_info_dict(&raw, self.info_hash, trackers) {
                    Ok(metainfo) => metainfo,
                    Err(e) => {
                        // Hash-verified yet unparseable: nothing to retry.
                        self.fail(e).await;
                        return Ok(());
                    }
                };
                let name = promoted.info.name.clone();

                if let Err(e) = self.install_metainfo(Arc::new(promoted)).await {
                    self.fail(e).await;
                    return Ok(());
                }

                tracing::info!("metadata received for {}", name);
                self.emit(SwarmEvent::MetadataReceived { id: self.id, name });
                self.set_state(SessionState::Downloading);

                // Peers handshaken during the bootstrap never exchanged
                // piece bitfields; recycle them so they reconnect against
                // the real piece count.
                let links: Vec<Arc<PeerLink>> = self.peers.lock().values().cloned().collect();
                let addrs: Vec<SocketAddr> = links.iter().map(|l| l.addr()).collect();
                for link in links {
                    link.disconnect().await;
                }
                self.peers.lock().clear();
                self.add_candidates(addrs);
            }
            Ok(false) => {
                self.dispatch_metadata_requests(link).await;
            }
            Err(e) => {
                if matches!(
                    e,
                    EngineError::Protocol {
                        kind: ProtocolErrorKind::HashMismatch,
                        ..
                    }
                ) {
                    // Wrong or malicious swarm: nothing to retry.
                    self.fail(e).await;
                    return Ok(());
                }
                // Anything else is this peer misbehaving.
                return Err(e);
            }
        }

        Ok(())
    }

    /// Issue block (or metadata) requests to a peer within its batch
    /// budget.
    async fn dispatch_batch(self: &Arc<Self>, link: &Arc<PeerLink>) {
        if self.is_shutdown() {
            return;
        }

        if self.fetcher().is_some() {
            self.dispatch_metadata_requests(link).await;
            return;
        }

        let Some(store) = self.store() else { return };

        let budget = self
            .config
            .requests_per_peer
            .saturating_sub(link.outstanding());
        if budget == 0 {
            return;
        }

        let requests = if link.is_unchoked() {
            let remote = link.remote_pieces();
            match remote {
                RemotePieces::All => {
                    store.next_requests(link.addr(), PeerAvailability::All, budget)
                }
                RemotePieces::Field(ref field) => {
                    store.next_requests(link.addr(), PeerAvailability::Field(field), budget)
                }
                RemotePieces::None | RemotePieces::Unknown => Vec::new(),
            }
        } else {
            // Choked: ALLOW_FAST pieces are the only legal source.
            let allowed = link.allowed_fast();
            if allowed.is_empty() {
                return;
            }
            let field = crate::bitfield::Bitfield::new(store.piece_count() as usize);
            for piece in allowed {
                if (piece as usize) < field.len() {
                    field.set(piece as usize);
                }
            }
            store.next_requests(link.addr(), PeerAvailability::Field(&field), budget)
        };

        if requests.is_empty() {
            return;
        }

        if let Err(e) = link.request_blocks(&requests).await {
            tracing::debug!("peer {} request send failed: {}", link.addr(), e);
            self.drop_peer_link(link).await;
        }
    }

    /// Metadata-phase requests under the fetcher's parallelism budget.
    async fn dispatch_metadata_requests(self: &Arc<Self>, link: &Arc<PeerLink>) {
        let Some(fetcher) = self.fetcher() else { return };
        let Some(ext_id) = link.extension_id(METADATA_EXTENSION_NAME) else {
            return;
        };

        let budget = self
            .config
            .requests_per_peer
            .saturating_sub(link.outstanding());
        for piece in fetcher.next_requests(budget) {
            if let Err(e) = link.request_metadata_piece(ext_id, piece).await {
                tracing::debug!("peer {} metadata request failed: {}", link.addr(), e);
                break;
            }
        }
    }

    // Announce

    /// One announce pass over every known tracker.
    async fn announce_round(&self, event: AnnounceEvent) {
        *self.last_announce.lock() = Instant::now();

        let trackers = match self.metainfo() {
            Some(metainfo) => metainfo.all_trackers(),
            None => self
                .magnet
                .as_ref()
                .map(|m| m.trackers.clone())
                .unwrap_or_default(),
        };
        if trackers.is_empty() {
            return;
        }

        let (downloaded, left) = match self.store() {
            Some(store) => {
                let done = store.bytes_complete();
                (done, store.total_size().saturating_sub(done))
            }
            None => (0, 1),
        };

        let request = AnnounceRequest {
            info_hash: self.info_hash,
            peer_id: *self.tracker.peer_id(),
            port: self.config.listen_port,
            uploaded: 0,
            downloaded,
            left,
            event,
            numwant: self.config.tracker_numwant,
        };

        for tracker_url in trackers {
            match self.tracker.announce(&tracker_url, &request).await {
                Ok(response) => {
                    tracing::info!(
                        "announced to {}: {} peers, interval {}s",
                        tracker_url,
                        response.peers.len(),
                        response.interval
                    );
                    self.add_candidates(response.peers);
                }
                Err(e) => {
                    tracing::warn!("announce to {} failed: {}", tracker_url, e);
                }
            }
        }
    }

    // Completion

    /// Materialize the final file layout and wind the session down.
    async fn finalize(self: Arc<Self>) {
        let Some(storage) = self.storage() else { return };

        if let Err(e) = storage.create_final_file().await {
            self.fail(e).await;
            return;
        }

        tracing::info!("download complete for {}", self.name());
        self.set_state(SessionState::Finished);
        self.emit(SwarmEvent::Completed { id: self.id });
        self.announce_round(AnnounceEvent::Completed).await;

        // Leech-only: with the payload on disk there is nothing left to
        // serve, so the swarm shuts down.
        self.stop().await;
    }

    // Streaming read interface

    /// Read payload bytes, prioritizing and waiting for the pieces that
    /// cover them.
    ///
    /// Blocks the calling task until the span is verified on disk, the
    /// read is cancelled, or the session stops.
    pub async fn read(&self, position: u64, length: usize) -> Result<Vec<u8>> {
        let store = self.store().ok_or_else(|| EngineError::InvalidState {
            action: "read",
            current_state: "metadata not yet available".to_string(),
        })?;

        if length == 0 {
            return Ok(Vec::new());
        }
        if position + length as u64 > store.total_size() {
            return Err(EngineError::invalid_input(
                "position",
                "read range past end of torrent",
            ));
        }

        let (first, last) = store.piece_span(position, length as u64);
        let focus_id = self.next_focus_id.fetch_add(1, Ordering::SeqCst);
        store.add_focus(focus_id, first, last);

        let waited = store
            .wait_range(position, length as u64, &self.read_cancelled)
            .await;
        store.remove_focus(focus_id);
        waited?;

        let storage = self.storage().ok_or(EngineError::Shutdown)?;
        storage.read(position, length).await
    }

    /// Cancel all blocked streaming reads.
    pub fn cancel_reads(&self) {
        self.read_cancelled.store(true, Ordering::SeqCst);
        if let Some(store) = self.store() {
            store.wake_waiters();
        }
    }

    /// Restrict the download to the pieces covering the given files.
    /// `None` selects everything.
    pub fn select_files(&self, file_indices: Option<&[usize]>) -> Result<()> {
        let metainfo = self.metainfo().ok_or_else(|| EngineError::InvalidState {
            action: "select files",
            current_state: "metadata not yet available".to_string(),
        })?;
        let store = self.store().ok_or(EngineError::Shutdown)?;
        if store.piece_count() == 0 {
            return Ok(());
        }

        let Some(indices) = file_indices else {
            store.set_included_pieces(None);
            return Ok(());
        };

        let mask = crate::bitfield::Bitfield::new(store.piece_count() as usize);
        let piece_length = metainfo.info.piece_length;
        for &index in indices {
            let Some(file) = metainfo.info.files.get(index) else {
                return Err(EngineError::invalid_input("file", "file index out of range"));
            };
            if file.length == 0 {
                continue;
            }
            let first = (file.offset / piece_length) as usize;
            let last = ((file.offset + file.length - 1) / piece_length) as usize;
            for piece in first..=last.min(store.piece_count() as usize - 1) {
                mask.set(piece);
            }
        }

        store.set_included_pieces(Some(&mask));
        Ok(())
    }
}
