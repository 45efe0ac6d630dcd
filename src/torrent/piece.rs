//! Piece and block bookkeeping
//!
//! The [`PieceStore`] owns all per-torrent download state: the `progress`
//! and `requested` bitfields, the lazily created per-piece working buffers,
//! the flat list of outstanding requests scanned for expiry, and the focus
//! regions that bias selection for streaming consumers.
//!
//! Every mutating operation takes one coarse lock. Operations are memory
//! copies plus an occasional SHA-1, cheap next to the network I/O around
//! them, so the single lock keeps the invariants simple:
//!
//! - a set bit in `progress` means the piece was hash-verified and handed
//!   to storage
//! - a set bit in `requested` means no further request should be issued
//!   for that piece right now, nothing more

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use sha1::{Digest, Sha1};
use tokio::sync::Notify;

use super::metainfo::{Metainfo, Sha1Hash};
use super::peer::BLOCK_SIZE;
use crate::bitfield::Bitfield;
use crate::error::{EngineError, ProtocolErrorKind, Result};
use crate::types::SwarmStats;

/// One block request bound for the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    /// Piece index
    pub piece: u32,
    /// Byte offset within the piece
    pub offset: u32,
    /// Block length
    pub length: u32,
    /// Focus/endgame request, expires on the shorter budget
    pub aggressive: bool,
}

/// An outstanding request awaiting its PIECE (or REJECT) message
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub at: Instant,
    pub peer: SocketAddr,
    pub piece: u32,
    pub block: u32,
    pub length: u32,
    pub aggressive: bool,
}

/// Externally requested priority window of pieces
#[derive(Debug, Clone)]
pub struct FocusRegion {
    pub id: u64,
    pub from_piece: u32,
    pub to_piece: u32,
    pub done: bool,
}

/// A peer's piece availability, as the selection scans consume it
#[derive(Debug, Clone, Copy)]
pub enum PeerAvailability<'a> {
    All,
    None,
    Field(&'a Bitfield),
}

/// In-flight buffer for one piece
struct PieceBuffer {
    data: Vec<u8>,
    blocks_done: Bitfield,
    blocks_requested: Bitfield,
}

impl PieceBuffer {
    fn new(piece_len: u64, block_count: u32) -> Self {
        Self {
            data: vec![0; piece_len as usize],
            blocks_done: Bitfield::new(block_count as usize),
            blocks_requested: Bitfield::new(block_count as usize),
        }
    }
}

struct StoreState {
    /// Lazily created piece buffers, destroyed on completion or hash failure
    working: HashMap<u32, PieceBuffer>,
    /// Pieces verified and handed off, waiting for the storage write to land
    flushing: std::collections::HashSet<u32>,
    /// Flat outstanding-request list, scanned periodically for expiry
    pending: Vec<PendingRequest>,
    /// Priority windows keyed by consumer-chosen id
    focus: BTreeMap<u64, FocusRegion>,
    /// Mask of wanted pieces when a file sub-selection is active
    include_mask: Option<Bitfield>,
}

/// What happened to a delivered block
#[derive(Debug)]
pub enum BlockArrival {
    /// Stored; the piece is still incomplete
    Accepted,
    /// Duplicate or late delivery; bytes counted as dropped, never an error
    Dropped,
    /// Every block arrived and the SHA-1 matched: write these bytes to
    /// storage, then call [`PieceStore::mark_piece_written`]. `redundant`
    /// lists requests for the same piece still outstanding at other peers
    /// (endgame duplicates), so the caller can send cancels.
    Complete {
        data: Vec<u8>,
        redundant: Vec<PendingRequest>,
    },
    /// SHA-1 mismatch: the whole piece was discarded and re-queued
    HashMismatch,
}

/// Per-torrent piece/block progress tables
pub struct PieceStore {
    piece_count: u32,
    piece_length: u64,
    last_piece_length: u64,
    blocks_per_piece: u32,
    hashes: Vec<Sha1Hash>,
    total_size: u64,

    /// Pieces fully verified and written to storage
    progress: Bitfield,
    /// Pieces that currently need no further requests
    requested: Bitfield,
    /// Snapshot pair taken when the included-file set changes
    progress_snapshot: Bitfield,
    requested_snapshot: Bitfield,

    state: Mutex<StoreState>,

    endgame_threshold: u64,
    endgame: AtomicBool,

    bytes_downloaded: AtomicU64,
    bytes_dropped: AtomicU64,
    hash_failures: AtomicU64,
    request_timeouts: AtomicU64,
    request_rejects: AtomicU64,

    /// Signalled on every piece completion (streaming-read waiters)
    notify: Notify,
}

impl PieceStore {
    pub fn new(metainfo: &Metainfo, endgame_threshold: u64) -> Self {
        let piece_count = metainfo.info.num_pieces() as u32;
        let piece_length = metainfo.info.piece_length;
        let total_size = metainfo.info.total_size;
        let last_piece_length = if piece_count == 0 {
            0
        } else {
            total_size - (piece_count as u64 - 1) * piece_length
        };

        Self {
            piece_count,
            piece_length,
            last_piece_length,
            blocks_per_piece: piece_length.div_ceil(BLOCK_SIZE as u64) as u32,
            hashes: metainfo.info.pieces.clone(),
            total_size,
            progress: Bitfield::new(piece_count as usize),
            requested: Bitfield::new(piece_count as usize),
            progress_snapshot: Bitfield::new(piece_count as usize),
            requested_snapshot: Bitfield::new(piece_count as usize),
            state: Mutex::new(StoreState {
                working: HashMap::new(),
                flushing: std::collections::HashSet::new(),
                pending: Vec::new(),
                focus: BTreeMap::new(),
                include_mask: None,
            }),
            endgame_threshold,
            endgame: AtomicBool::new(false),
            bytes_downloaded: AtomicU64::new(0),
            bytes_dropped: AtomicU64::new(0),
            hash_failures: AtomicU64::new(0),
            request_timeouts: AtomicU64::new(0),
            request_rejects: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    // Geometry helpers

    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    fn piece_len(&self, piece: u32) -> u64 {
        if piece + 1 == self.piece_count {
            self.last_piece_length
        } else {
            self.piece_length
        }
    }

    fn block_count(&self, piece: u32) -> u32 {
        self.piece_len(piece).div_ceil(BLOCK_SIZE as u64) as u32
    }

    fn block_len(&self, piece: u32, block: u32) -> u32 {
        let piece_len = self.piece_len(piece);
        let offset = block as u64 * BLOCK_SIZE as u64;
        (piece_len - offset).min(BLOCK_SIZE as u64) as u32
    }

    /// Piece range `[first, last]` covering a byte span of the torrent
    pub fn piece_span(&self, position: u64, length: u64) -> (u32, u32) {
        let first = (position / self.piece_length) as u32;
        let last_byte = (position + length.max(1) - 1).min(self.total_size.saturating_sub(1));
        let last = (last_byte / self.piece_length) as u32;
        (
            first.min(self.piece_count.saturating_sub(1)),
            last.min(self.piece_count.saturating_sub(1)),
        )
    }

    // Progress

    pub fn is_complete(&self) -> bool {
        self.progress.is_full()
    }

    pub fn pieces_have(&self) -> u32 {
        self.progress.count() as u32
    }

    pub fn has_piece(&self, piece: u32) -> bool {
        self.progress.get(piece as usize)
    }

    /// Bytes verified and written so far
    pub fn bytes_complete(&self) -> u64 {
        let have = self.progress.count() as u64;
        if have == 0 {
            return 0;
        }
        if self.progress.get(self.piece_count as usize - 1) {
            (have - 1) * self.piece_length + self.last_piece_length
        } else {
            have * self.piece_length
        }
    }

    pub fn stats(&self) -> SwarmStats {
        SwarmStats {
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            bytes_dropped: self.bytes_dropped.load(Ordering::Relaxed),
            hash_failures: self.hash_failures.load(Ordering::Relaxed),
            request_timeouts: self.request_timeouts.load(Ordering::Relaxed),
            request_rejects: self.request_rejects.load(Ordering::Relaxed),
            peers: Default::default(),
        }
    }

    /// True once the remaining work is small enough for redundant requests
    pub fn in_endgame(&self) -> bool {
        let remaining = self.piece_count as u64 - self.progress.count() as u64;
        if remaining == 0 {
            return false;
        }
        let entered = remaining * self.blocks_per_piece as u64 <= self.endgame_threshold;
        if entered {
            self.endgame.store(true, Ordering::Relaxed);
        }
        self.endgame.load(Ordering::Relaxed)
    }

    // Block arrival

    /// Record a delivered block.
    ///
    /// Duplicate delivery is expected under concurrent multi-peer
    /// requesting and is accounting, not a fault. Misaligned or wrong-size
    /// payloads are a protocol violation by the peer.
    pub fn on_block_received(
        &self,
        piece: u32,
        offset: u32,
        bytes: &[u8],
        from: SocketAddr,
    ) -> Result<BlockArrival> {
        if piece >= self.piece_count {
            return Err(EngineError::protocol(
                ProtocolErrorKind::PeerProtocol,
                format!("piece {} out of range", piece),
            ));
        }
        if !offset.is_multiple_of(BLOCK_SIZE) {
            return Err(EngineError::protocol(
                ProtocolErrorKind::PeerProtocol,
                format!("block offset {} not aligned", offset),
            ));
        }
        let block = offset / BLOCK_SIZE;
        if block >= self.block_count(piece) {
            return Err(EngineError::protocol(
                ProtocolErrorKind::PeerProtocol,
                format!("block {} out of range for piece {}", block, piece),
            ));
        }
        if bytes.len() as u32 != self.block_len(piece, block) {
            return Err(EngineError::protocol(
                ProtocolErrorKind::PeerProtocol,
                format!(
                    "block {}:{} has wrong size {} (expected {})",
                    piece,
                    block,
                    bytes.len(),
                    self.block_len(piece, block)
                ),
            ));
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;

        // Already verified (or mid-flush): late duplicate, drop it.
        if self.progress.get(piece as usize) || state.flushing.contains(&piece) {
            self.bytes_dropped
                .fetch_add(bytes.len() as u64, Ordering::Relaxed);
            state.pending.retain(|p| {
                !(p.peer == from && p.piece == piece && p.block == block)
            });
            return Ok(BlockArrival::Dropped);
        }

        let block_count = self.block_count(piece);
        let piece_len = self.piece_len(piece);
        let buffer = state
            .working
            .entry(piece)
            .or_insert_with(|| PieceBuffer::new(piece_len, block_count));

        if buffer.blocks_done.get(block as usize) {
            self.bytes_dropped
                .fetch_add(bytes.len() as u64, Ordering::Relaxed);
            state.pending.retain(|p| {
                !(p.peer == from && p.piece == piece && p.block == block)
            });
            return Ok(BlockArrival::Dropped);
        }

        let start = offset as usize;
        buffer.data[start..start + bytes.len()].copy_from_slice(bytes);
        buffer.blocks_done.set(block as usize);
        buffer.blocks_requested.set(block as usize);
        self.bytes_downloaded
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);

        state
            .pending
            .retain(|p| !(p.piece == piece && p.block == block && p.peer == from));

        if !buffer.blocks_done.is_full() {
            return Ok(BlockArrival::Accepted);
        }

        // Whole piece assembled: the SHA-1 check is the sole correctness
        // backstop against interleaved and duplicate delivery.
        let buffer = state.working.remove(&piece).unwrap();
        // Endgame leaves redundant entries for this piece at other peers.
        let pending = std::mem::take(&mut state.pending);
        let (redundant, kept): (Vec<_>, Vec<_>) =
            pending.into_iter().partition(|p| p.piece == piece);
        state.pending = kept;

        let mut hasher = Sha1::new();
        hasher.update(&buffer.data);
        let actual: Sha1Hash = hasher.finalize().into();

        if actual != self.hashes[piece as usize] {
            // No way to tell which block was corrupted, so the whole piece
            // becomes eligible again.
            self.requested.unset(piece as usize);
            self.hash_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("piece {} failed hash verification, re-queued", piece);
            return Ok(BlockArrival::HashMismatch);
        }

        self.requested.set(piece as usize);
        state.flushing.insert(piece);
        Ok(BlockArrival::Complete {
            data: buffer.data,
            redundant,
        })
    }

    /// Confirm a verified piece landed in storage.
    ///
    /// Only now does the `progress` bit go up; waiters are woken.
    pub fn mark_piece_written(&self, piece: u32) {
        {
            let mut state = self.state.lock();
            state.flushing.remove(&piece);
        }
        self.progress.set(piece as usize);
        self.requested.set(piece as usize);
        self.notify.notify_waiters();
    }

    /// A peer refused a block (fast-extension REJECT_REQUEST)
    pub fn on_block_rejected(&self, piece: u32, offset: u32, from: SocketAddr) {
        if piece >= self.piece_count || !offset.is_multiple_of(BLOCK_SIZE) {
            return;
        }
        let block = offset / BLOCK_SIZE;
        self.request_rejects.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.lock();
        state
            .pending
            .retain(|p| !(p.peer == from && p.piece == piece && p.block == block));

        if self.progress.get(piece as usize) || state.flushing.contains(&piece) {
            return;
        }
        if let Some(buffer) = state.working.get(&piece) {
            if buffer.blocks_done.get(block as usize) {
                return;
            }
            buffer.blocks_requested.unset(block as usize);
        }
        self.requested.unset(piece as usize);
    }

    /// Expire outstanding requests older than their budget.
    ///
    /// Expired blocks become re-requestable unless already complete; the
    /// per-peer expiry list feeds the scheduler's retry budgets.
    pub fn sweep_timeouts(
        &self,
        normal: Duration,
        aggressive: Duration,
    ) -> Vec<(SocketAddr, bool)> {
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut state = self.state.lock();

        let mut kept = Vec::with_capacity(state.pending.len());
        let pending = std::mem::take(&mut state.pending);
        for entry in pending {
            let budget = if entry.aggressive { aggressive } else { normal };
            if now.duration_since(entry.at) < budget {
                kept.push(entry);
                continue;
            }

            let done = self.progress.get(entry.piece as usize)
                || state.flushing.contains(&entry.piece)
                || state
                    .working
                    .get(&entry.piece)
                    .map(|b| b.blocks_done.get(entry.block as usize))
                    .unwrap_or(false);

            if !done {
                if let Some(buffer) = state.working.get(&entry.piece) {
                    buffer.blocks_requested.unset(entry.block as usize);
                }
                self.requested.unset(entry.piece as usize);
                self.request_timeouts.fetch_add(1, Ordering::Relaxed);
                expired.push((entry.peer, entry.aggressive));
            }
        }
        state.pending = kept;

        expired
    }

    /// Return every outstanding request of a peer to the pool.
    ///
    /// Used when a peer chokes us (it will not answer) and on disconnect,
    /// so in-flight work is never silently lost.
    pub fn drop_peer_requests(&self, peer: SocketAddr) {
        let mut state = self.state.lock();
        let pending = std::mem::take(&mut state.pending);
        let (dropped, kept): (Vec<_>, Vec<_>) =
            pending.into_iter().partition(|p| p.peer == peer);
        state.pending = kept;

        for entry in dropped {
            let done = self.progress.get(entry.piece as usize)
                || state.flushing.contains(&entry.piece)
                || state
                    .working
                    .get(&entry.piece)
                    .map(|b| b.blocks_done.get(entry.block as usize))
                    .unwrap_or(false);
            if !done {
                if let Some(buffer) = state.working.get(&entry.piece) {
                    buffer.blocks_requested.unset(entry.block as usize);
                }
                self.requested.unset(entry.piece as usize);
            }
        }
    }

    /// Outstanding request count for a peer
    pub fn pending_for(&self, peer: SocketAddr) -> usize {
        self.state.lock().pending.iter().filter(|p| p.peer == peer).count()
    }

    // Request selection

    /// Plan the next request batch for a peer.
    ///
    /// Focus windows come first, then the normal first-available fill; in
    /// endgame every remaining block is fair game for redundant requests.
    pub fn next_requests(
        &self,
        peer: SocketAddr,
        avail: PeerAvailability<'_>,
        batch: usize,
    ) -> Vec<BlockRequest> {
        if matches!(avail, PeerAvailability::None) || batch == 0 {
            return Vec::new();
        }

        if self.in_endgame() {
            return self.endgame_requests(peer, avail, batch);
        }

        let mut state = self.state.lock();
        let mut out = Vec::with_capacity(batch);

        self.fill_from_focus(&mut state, peer, avail, batch, &mut out);
        self.fill_normal(&mut state, peer, avail, batch, &mut out);

        out
    }

    /// Focus-first selection: the first incomplete piece inside the oldest
    /// unfinished window that the peer can serve.
    fn fill_from_focus(
        &self,
        state: &mut StoreState,
        peer: SocketAddr,
        avail: PeerAvailability<'_>,
        batch: usize,
        out: &mut Vec<BlockRequest>,
    ) {
        if state.focus.is_empty() || out.len() >= batch {
            return;
        }

        let regions: Vec<(u64, u32, u32)> = state
            .focus
            .values()
            .filter(|r| !r.done)
            .map(|r| (r.id, r.from_piece, r.to_piece))
            .collect();

        for (_, from, to) in regions {
            if out.len() >= batch {
                break;
            }
            let lo = from as usize;
            let hi = (to as usize + 1).min(self.piece_count as usize);
            if lo >= hi {
                continue;
            }

            let mut cursor = lo;
            while out.len() < batch {
                let piece = match avail {
                    PeerAvailability::All => self.progress.first_unset_in(cursor, hi),
                    PeerAvailability::Field(field) => {
                        self.progress.first_missing_in(field, cursor, hi)
                    }
                    PeerAvailability::None => None,
                };
                let piece = match piece {
                    Some(p) => p as u32,
                    None => break,
                };

                if state.flushing.contains(&piece) {
                    cursor = piece as usize + 1;
                    continue;
                }
                self.fill_piece_blocks(state, peer, piece, batch, true, out);
                cursor = piece as usize + 1;
            }
        }
    }

    /// Normal selection: first piece needing requests that the peer has,
    /// first unrequested block within it.
    fn fill_normal(
        &self,
        state: &mut StoreState,
        peer: SocketAddr,
        avail: PeerAvailability<'_>,
        batch: usize,
        out: &mut Vec<BlockRequest>,
    ) {
        let mut cursor = 0usize;
        let count = self.piece_count as usize;

        while out.len() < batch && cursor < count {
            let piece = match avail {
                PeerAvailability::All => self.requested.first_unset_in(cursor, count),
                PeerAvailability::Field(field) => {
                    self.requested.first_missing_in(field, cursor, count)
                }
                PeerAvailability::None => None,
            };
            let Some(piece) = piece else { break };
            let piece = piece as u32;

            if let Some(mask) = &state.include_mask {
                if !mask.get(piece as usize) {
                    // Excluded pieces keep their requested bit set; reaching
                    // here means the mask changed mid-scan. Skip forward.
                    cursor = piece as usize + 1;
                    continue;
                }
            }
            if state.flushing.contains(&piece) {
                cursor = piece as usize + 1;
                continue;
            }

            self.fill_piece_blocks(state, peer, piece, batch, false, out);

            // Only a fully requested piece is taken out of selection; a
            // partially filled one stays eligible for the next caller.
            let fully_requested = state
                .working
                .get(&piece)
                .map(|b| b.blocks_requested.is_full())
                .unwrap_or(false);
            if fully_requested {
                self.requested.set(piece as usize);
            }
            cursor = piece as usize + 1;
        }
    }

    /// Endgame: uniformly sample the remaining (piece, block) pairs the
    /// peer has, tolerating redundancy across peers but not within one.
    fn endgame_requests(
        &self,
        peer: SocketAddr,
        avail: PeerAvailability<'_>,
        batch: usize,
    ) -> Vec<BlockRequest> {
        let mut state = self.state.lock();
        let mut candidates: Vec<(u32, u32)> = Vec::new();

        for piece in 0..self.piece_count {
            if self.progress.get(piece as usize) || state.flushing.contains(&piece) {
                continue;
            }
            if let Some(mask) = &state.include_mask {
                if !mask.get(piece as usize) {
                    continue;
                }
            }
            let has = match avail {
                PeerAvailability::All => true,
                PeerAvailability::Field(field) => field.get(piece as usize),
                PeerAvailability::None => false,
            };
            if !has {
                continue;
            }

            let block_count = self.block_count(piece);
            for block in 0..block_count {
                let done = state
                    .working
                    .get(&piece)
                    .map(|b| b.blocks_done.get(block as usize))
                    .unwrap_or(false);
                if done {
                    continue;
                }
                let already_mine = state
                    .pending
                    .iter()
                    .any(|p| p.peer == peer && p.piece == piece && p.block == block);
                if !already_mine {
                    candidates.push((piece, block));
                }
            }
        }

        candidates.shuffle(&mut rand::rng());
        candidates.truncate(batch);

        let mut out = Vec::with_capacity(candidates.len());
        for (piece, block) in candidates {
            let block_count = self.block_count(piece);
            let piece_len = self.piece_len(piece);
            let buffer = state
                .working
                .entry(piece)
                .or_insert_with(|| PieceBuffer::new(piece_len, block_count));
            buffer.blocks_requested.set(block as usize);

            let request = BlockRequest {
                piece,
                offset: block * BLOCK_SIZE,
                length: self.block_len(piece, block),
                aggressive: true,
            };
            state.pending.push(PendingRequest {
                at: Instant::now(),
                peer,
                piece,
                block,
                length: request.length,
                aggressive: true,
            });
            out.push(request);
        }
        out
    }

    /// Allocate unrequested blocks of one piece into the batch
    fn fill_piece_blocks(
        &self,
        state: &mut StoreState,
        peer: SocketAddr,
        piece: u32,
        batch: usize,
        aggressive: bool,
        out: &mut Vec<BlockRequest>,
    ) {
        let block_count = self.block_count(piece);
        let piece_len = self.piece_len(piece);
        let buffer = state
            .working
            .entry(piece)
            .or_insert_with(|| PieceBuffer::new(piece_len, block_count));

        while out.len() < batch {
            let Some(block) = buffer.blocks_requested.first_unset() else {
                break;
            };
            buffer.blocks_requested.set(block);
            let block = block as u32;

            let request = BlockRequest {
                piece,
                offset: block * BLOCK_SIZE,
                length: self.block_len(piece, block),
                aggressive,
            };
            state.pending.push(PendingRequest {
                at: Instant::now(),
                peer,
                piece,
                block,
                length: request.length,
                aggressive,
            });
            out.push(request);
        }
    }

    // Focus regions

    /// Create or extend a priority window. Overlapping calls with the same
    /// id merge to the widest span.
    pub fn add_focus(&self, id: u64, from_piece: u32, to_piece: u32) {
        let mut state = self.state.lock();
        let to_piece = to_piece.min(self.piece_count.saturating_sub(1));
        state
            .focus
            .entry(id)
            .and_modify(|r| {
                r.from_piece = r.from_piece.min(from_piece);
                r.to_piece = r.to_piece.max(to_piece);
                r.done = false;
            })
            .or_insert(FocusRegion {
                id,
                from_piece,
                to_piece,
                done: false,
            });
    }

    /// Remove a priority window
    pub fn remove_focus(&self, id: u64) {
        self.state.lock().focus.remove(&id);
    }

    /// Collect and remove windows whose whole span is now in `progress`
    pub fn take_completed_focus(&self) -> Vec<u64> {
        let mut state = self.state.lock();
        let mut done = Vec::new();
        for region in state.focus.values_mut() {
            let lo = region.from_piece as usize;
            let hi = (region.to_piece as usize + 1).min(self.piece_count as usize);
            if self.progress.first_unset_in(lo, hi).is_none() {
                region.done = true;
                done.push(region.id);
            }
        }
        for id in &done {
            state.focus.remove(id);
        }
        done
    }

    /// Is every piece covering this byte range verified and written?
    pub fn range_complete(&self, position: u64, length: u64) -> bool {
        let (first, last) = self.piece_span(position, length);
        self.progress
            .first_unset_in(first as usize, last as usize + 1)
            .is_none()
    }

    /// Wait until a byte range completes or the flag cancels the wait
    pub async fn wait_range(
        &self,
        position: u64,
        length: u64,
        cancelled: &AtomicBool,
    ) -> Result<()> {
        loop {
            let notified = self.notify.notified();
            if self.range_complete(position, length) {
                return Ok(());
            }
            if cancelled.load(Ordering::SeqCst) {
                return Err(EngineError::ReadCancelled);
            }
            notified.await;
        }
    }

    /// Wake streaming-read waiters (cancellation path)
    pub fn wake_waiters(&self) {
        self.notify.notify_waiters();
    }

    // Included-file mask

    /// Restrict selection to the pieces of a file sub-selection.
    ///
    /// The current `progress`/`requested` pair is snapshotted before the
    /// mask applies; excluded pieces park behind a set `requested` bit and
    /// the snapshot restores their true request state when the selection
    /// widens again. `None` clears the mask.
    pub fn set_included_pieces(&self, mask: Option<&Bitfield>) {
        let count = self.piece_count as usize;
        let mut state = self.state.lock();

        if state.include_mask.take().is_some() {
            // Undo the parking bits of the previous mask.
            self.requested.copy_from(&self.requested_snapshot, 0, count);
        }

        self.progress_snapshot.copy_from(&self.progress, 0, count);
        self.requested_snapshot.copy_from(&self.requested, 0, count);

        if let Some(mask) = mask {
            assert_eq!(mask.len(), count, "include mask must cover every piece");
            for piece in 0..count {
                if !mask.get(piece) {
                    self.requested.set(piece);
                }
            }
            state.include_mask = Some(mask.clone());
        }
    }

    /// Download complete with respect to the current file mask
    pub fn is_selection_complete(&self) -> bool {
        let state = self.state.lock();
        match &state.include_mask {
            None => self.progress.is_full(),
            Some(mask) => {
                for piece in 0..self.piece_count as usize {
                    if mask.get(piece) && !self.progress.get(piece) {
                        return false;
                    }
                }
                true
            }
        }
    }

    /// Working-set count (test and introspection hook)
    pub fn active_assemblies(&self) -> usize {
        self.state.lock().working.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn peer(n: u8) -> SocketAddr {
        format!("10.0.0.{}:6881", n).parse().unwrap()
    }

    /// Torrent with `pieces` pieces of 32 KiB (2 blocks each); the last
    /// piece is a single short block of 100 bytes.
    fn test_store(pieces: u32) -> (PieceStore, Vec<Vec<u8>>) {
        let piece_length = 2 * BLOCK_SIZE as u64;
        let mut data_pieces = Vec::new();
        let mut hashes = Vec::new();
        for i in 0..pieces {
            let len = if i + 1 == pieces {
                100
            } else {
                piece_length as usize
            };
            let data: Vec<u8> = (0..len).map(|j| ((j + i as usize) % 251) as u8).collect();
            let mut hasher = Sha1::new();
            hasher.update(&data);
            hashes.push(hasher.finalize().into());
            data_pieces.push(data);
        }

        let total_size = (pieces as u64 - 1) * piece_length + 100;
        let metainfo = Metainfo {
            info_hash: [0u8; 20],
            info: super::super::metainfo::Info {
                name: "test".to_string(),
                piece_length,
                pieces: hashes,
                files: vec![super::super::metainfo::FileInfo {
                    path: PathBuf::from("test"),
                    length: total_size,
                    offset: 0,
                }],
                total_size,
                is_single_file: true,
                private: false,
            },
            announce: None,
            announce_list: Vec::new(),
        };

        (PieceStore::new(&metainfo, 4), data_pieces)
    }

    fn deliver_piece(store: &PieceStore, data: &[u8], piece: u32, from: SocketAddr) {
        let mut offset = 0u32;
        while (offset as usize) < data.len() {
            let end = (offset as usize + BLOCK_SIZE as usize).min(data.len());
            let arrival = store
                .on_block_received(piece, offset, &data[offset as usize..end], from)
                .unwrap();
            if let BlockArrival::Complete { .. } = arrival {
                store.mark_piece_written(piece);
            }
            offset += BLOCK_SIZE;
        }
    }

    #[test]
    fn normal_selection_walks_first_available() {
        let (store, _) = test_store(4);
        let requests = store.next_requests(peer(1), PeerAvailability::All, 3);

        assert_eq!(requests.len(), 3);
        assert_eq!((requests[0].piece, requests[0].offset), (0, 0));
        assert_eq!((requests[1].piece, requests[1].offset), (0, BLOCK_SIZE));
        assert_eq!((requests[2].piece, requests[2].offset), (1, 0));
        assert!(requests.iter().all(|r| !r.aggressive));

        // Piece 0 fully requested, piece 1 only partially: a second peer
        // picks up the remainder of piece 1 first.
        let more = store.next_requests(peer(2), PeerAvailability::All, 2);
        assert_eq!((more[0].piece, more[0].offset), (1, BLOCK_SIZE));
        assert_eq!((more[1].piece, more[1].offset), (2, 0));
    }

    #[test]
    fn selection_respects_peer_bitfield() {
        let (store, _) = test_store(4);
        let field = Bitfield::new(4);
        field.set(2);

        let requests = store.next_requests(peer(1), PeerAvailability::Field(&field), 8);
        assert_eq!(requests.len(), 2); // both blocks of piece 2
        assert!(requests.iter().all(|r| r.piece == 2));

        assert!(store
            .next_requests(peer(1), PeerAvailability::None, 8)
            .is_empty());
    }

    #[test]
    fn complete_piece_verifies_and_marks_progress() {
        let (store, data) = test_store(2);

        let first = store
            .on_block_received(0, 0, &data[0][..BLOCK_SIZE as usize], peer(1))
            .unwrap();
        assert!(matches!(first, BlockArrival::Accepted));

        let second = store
            .on_block_received(0, BLOCK_SIZE, &data[0][BLOCK_SIZE as usize..], peer(1))
            .unwrap();
        let BlockArrival::Complete { data: bytes, redundant } = second else {
            panic!("expected completion");
        };
        assert_eq!(bytes, data[0]);
        assert!(redundant.is_empty());

        // Progress is only visible after the storage write confirms.
        assert!(!store.has_piece(0));
        store.mark_piece_written(0);
        assert!(store.has_piece(0));
        assert_eq!(store.bytes_complete(), 2 * BLOCK_SIZE as u64);
        assert_eq!(store.active_assemblies(), 0);
    }

    #[test]
    fn corrupted_piece_is_discarded_and_requeued() {
        let (store, data) = test_store(2);

        let mut corrupted = data[0].clone();
        corrupted[10] ^= 0xFF;

        store
            .on_block_received(0, 0, &corrupted[..BLOCK_SIZE as usize], peer(1))
            .unwrap();
        let arrival = store
            .on_block_received(0, BLOCK_SIZE, &corrupted[BLOCK_SIZE as usize..], peer(1))
            .unwrap();
        assert!(matches!(arrival, BlockArrival::HashMismatch));

        assert!(!store.has_piece(0));
        assert_eq!(store.stats().hash_failures, 1);
        assert_eq!(store.active_assemblies(), 0);

        // The piece must be fully re-requestable.
        let requests = store.next_requests(peer(2), PeerAvailability::All, 2);
        assert!(requests.iter().all(|r| r.piece == 0));

        // A clean retry completes it.
        deliver_piece(&store, &data[0], 0, peer(2));
        assert!(store.has_piece(0));
    }

    #[test]
    fn duplicate_delivery_is_dropped_not_counted() {
        let (store, data) = test_store(2);
        let block = &data[0][..BLOCK_SIZE as usize];

        store.on_block_received(0, 0, block, peer(1)).unwrap();
        let downloaded = store.stats().bytes_downloaded;

        let dup = store.on_block_received(0, 0, block, peer(2)).unwrap();
        assert!(matches!(dup, BlockArrival::Dropped));

        let stats = store.stats();
        assert_eq!(stats.bytes_downloaded, downloaded);
        assert_eq!(stats.bytes_dropped, BLOCK_SIZE as u64);
    }

    #[test]
    fn delivery_to_written_piece_is_dropped() {
        let (store, data) = test_store(2);
        deliver_piece(&store, &data[0], 0, peer(1));

        let arrival = store
            .on_block_received(0, 0, &data[0][..BLOCK_SIZE as usize], peer(2))
            .unwrap();
        assert!(matches!(arrival, BlockArrival::Dropped));
        assert_eq!(store.stats().bytes_dropped, BLOCK_SIZE as u64);
    }

    #[test]
    fn malformed_geometry_is_a_peer_fault() {
        let (store, _) = test_store(2);
        assert!(store.on_block_received(9, 0, &[0; 10], peer(1)).is_err());
        assert!(store.on_block_received(0, 7, &[0; 10], peer(1)).is_err());
        assert!(store
            .on_block_received(0, 0, &[0; 10], peer(1)) // wrong length
            .is_err());
    }

    #[test]
    fn timeout_requeues_but_never_loses_work() {
        let (store, _) = test_store(2);

        let requests = store.next_requests(peer(1), PeerAvailability::All, 2);
        assert_eq!(requests.len(), 2);
        assert_eq!(store.pending_for(peer(1)), 2);

        // Zero budget: everything expires on the next sweep.
        let expired = store.sweep_timeouts(Duration::ZERO, Duration::ZERO);
        assert_eq!(expired.len(), 2);
        assert!(expired.iter().all(|(p, aggressive)| *p == peer(1) && !*aggressive));
        assert_eq!(store.pending_for(peer(1)), 0);
        assert_eq!(store.stats().request_timeouts, 2);

        // The same blocks are requestable again.
        let again = store.next_requests(peer(2), PeerAvailability::All, 2);
        assert_eq!(again.len(), 2);
        assert_eq!((again[0].piece, again[0].offset), (0, 0));
    }

    #[test]
    fn completed_blocks_do_not_expire() {
        let (store, data) = test_store(2);

        store.next_requests(peer(1), PeerAvailability::All, 2);
        store
            .on_block_received(0, 0, &data[0][..BLOCK_SIZE as usize], peer(1))
            .unwrap();

        let expired = store.sweep_timeouts(Duration::ZERO, Duration::ZERO);
        // Only the unanswered block counts against the peer.
        assert_eq!(expired.len(), 1);
        assert_eq!(store.stats().request_timeouts, 1);
    }

    #[test]
    fn reject_makes_block_eligible_again() {
        let (store, _) = test_store(2);

        let requests = store.next_requests(peer(1), PeerAvailability::All, 1);
        assert_eq!(requests.len(), 1);

        store.on_block_rejected(0, 0, peer(1));
        assert_eq!(store.stats().request_rejects, 1);
        assert_eq!(store.pending_for(peer(1)), 0);

        let again = store.next_requests(peer(2), PeerAvailability::All, 1);
        assert_eq!((again[0].piece, again[0].offset), (0, 0));
    }

    #[test]
    fn choke_drop_returns_all_peer_requests() {
        let (store, _) = test_store(3);

        store.next_requests(peer(1), PeerAvailability::All, 3);
        store.next_requests(peer(2), PeerAvailability::All, 2);
        assert_eq!(store.pending_for(peer(1)), 3);

        store.drop_peer_requests(peer(1));
        assert_eq!(store.pending_for(peer(1)), 0);
        assert_eq!(store.pending_for(peer(2)), 2);

        // Peer 1's blocks are immediately requestable elsewhere.
        let again = store.next_requests(peer(3), PeerAvailability::All, 3);
        assert_eq!(again.len(), 3);
    }

    #[test]
    fn focus_region_takes_priority_and_completes() {
        let (store, data) = test_store(6);

        store.add_focus(7, 3, 4);
        let requests = store.next_requests(peer(1), PeerAvailability::All, 2);
        assert!(requests.iter().all(|r| r.piece == 3));
        assert!(requests.iter().all(|r| r.aggressive));

        // Fill the whole window; the region reports done exactly once.
        deliver_piece(&store, &data[3], 3, peer(1));
        deliver_piece(&store, &data[4], 4, peer(1));
        assert_eq!(store.take_completed_focus(), vec![7]);
        assert!(store.take_completed_focus().is_empty());

        // With the window gone, selection falls back to the front.
        let normal = store.next_requests(peer(1), PeerAvailability::All, 1);
        assert_eq!(normal[0].piece, 0);
    }

    #[test]
    fn focus_merges_ranges_by_id() {
        let (store, _) = test_store(6);
        store.add_focus(1, 2, 3);
        store.add_focus(1, 1, 4);

        let requests = store.next_requests(peer(1), PeerAvailability::All, 1);
        assert_eq!(requests[0].piece, 1);
    }

    #[test]
    fn endgame_samples_remaining_blocks_redundantly() {
        let (store, data) = test_store(3);

        // Complete the first two pieces; 1 piece * 1 block remains, below
        // the threshold of 4 blocks per piece * pieces.
        deliver_piece(&store, &data[0], 0, peer(1));
        deliver_piece(&store, &data[1], 1, peer(1));
        assert!(store.in_endgame());

        let first = store.next_requests(peer(1), PeerAvailability::All, 4);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].piece, 2);
        assert!(first[0].aggressive);

        // A second peer may request the same block redundantly...
        let second = store.next_requests(peer(2), PeerAvailability::All, 4);
        assert_eq!(second.len(), 1);

        // ...but the same peer may not double-request it.
        assert!(store.next_requests(peer(1), PeerAvailability::All, 4).is_empty());
    }

    #[test]
    fn endgame_duplicate_finish_drops_cleanly() {
        let (store, data) = test_store(3);
        deliver_piece(&store, &data[0], 0, peer(1));
        deliver_piece(&store, &data[1], 1, peer(1));

        store.next_requests(peer(1), PeerAvailability::All, 4);
        store.next_requests(peer(2), PeerAvailability::All, 4);

        // Peer 1 wins the race; peer 2's duplicate surfaces for a cancel.
        let arrival = store
            .on_block_received(2, 0, &data[2], peer(1))
            .unwrap();
        let BlockArrival::Complete { redundant, .. } = arrival else {
            panic!("expected completion");
        };
        assert_eq!(redundant.len(), 1);
        assert_eq!(redundant[0].peer, peer(2));
        store.mark_piece_written(2);
        assert!(store.is_complete());

        // Peer 2's redundant copy arrives late and is dropped.
        let arrival = store
            .on_block_received(2, 0, &data[2], peer(2))
            .unwrap();
        assert!(matches!(arrival, BlockArrival::Dropped));
        // Its pending entry was purged with the completion.
        assert_eq!(store.pending_for(peer(2)), 0);
    }

    #[test]
    fn include_mask_parks_and_restores_request_state() {
        let (store, _) = test_store(4);

        // Request part of piece 0 first so there is state to snapshot.
        store.next_requests(peer(1), PeerAvailability::All, 1);

        let mask = Bitfield::new(4);
        mask.set(2);
        store.set_included_pieces(Some(&mask));

        // Only piece 2 is selectable now.
        let requests = store.next_requests(peer(2), PeerAvailability::All, 8);
        assert!(requests.iter().all(|r| r.piece == 2));
        assert!(!store.is_selection_complete());

        // Widening the selection restores the parked pieces.
        store.set_included_pieces(None);
        let requests = store.next_requests(peer(3), PeerAvailability::All, 1);
        assert_eq!(requests[0].piece, 0);
    }

    #[test]
    fn piece_span_maps_byte_ranges() {
        let (store, _) = test_store(4);
        let piece_len = 2 * BLOCK_SIZE as u64;

        assert_eq!(store.piece_span(0, 10), (0, 0));
        assert_eq!(store.piece_span(piece_len - 1, 2), (0, 1));
        assert_eq!(store.piece_span(3 * piece_len, 50), (3, 3));
    }

    #[tokio::test]
    async fn wait_range_wakes_on_completion() {
        let (store, data) = test_store(2);
        let store = std::sync::Arc::new(store);
        let cancelled = std::sync::Arc::new(AtomicBool::new(false));

        let waiter = {
            let store = store.clone();
            let cancelled = cancelled.clone();
            tokio::spawn(async move { store.wait_range(0, 100, &cancelled).await })
        };

        deliver_piece(&store, &data[0], 0, peer(1));
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn wait_range_observes_cancellation() {
        let (store, _) = test_store(2);
        let store = std::sync::Arc::new(store);
        let cancelled = std::sync::Arc::new(AtomicBool::new(false));

        let waiter = {
            let store = store.clone();
            let cancelled = cancelled.clone();
            tokio::spawn(async move { store.wait_range(0, 100, &cancelled).await })
        };

        tokio::task::yield_now().await;
        cancelled.store(true, Ordering::SeqCst);
        store.wake_waiters();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(EngineError::ReadCancelled)));
    }
}
