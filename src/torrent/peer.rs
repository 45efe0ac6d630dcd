//! Peer wire protocol
//!
//! BEP 3 message framing and the per-peer connection entity. Supports the
//! fast extension (BEP 6) and the extension protocol envelope (BEP 10).
//!
//! A connection is split: the session's read loop owns the read half and
//! processes one message at a time (the socket is a single ordered byte
//! stream), while the write half sits behind an async mutex so both the
//! scheduler tick and the read loop can issue sends. Block requests are
//! batched into one buffer and flushed with a single write.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::metainfo::Sha1Hash;
use super::pex;
use super::piece::BlockRequest;
use crate::bitfield::Bitfield;
use crate::error::{EngineError, NetworkErrorKind, ProtocolErrorKind, Result};

/// Protocol string for BitTorrent
const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// Size of the handshake message
const HANDSHAKE_SIZE: usize = 68; // 1 + 19 + 8 + 20 + 20

/// Default block size (16 KiB), the wire's maximum data chunk
pub const BLOCK_SIZE: u32 = 16384;

/// Largest inbound frame accepted. A declared length beyond roughly twice
/// the block size is protocol corruption (or a hostile peer) and fails the
/// connection before any allocation happens.
const MAX_FRAME_SIZE: usize = 2 * BLOCK_SIZE as usize + 1024;

/// Timeout applied to individual socket writes
const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Reserved bytes for extension signalling in the handshake
#[derive(Debug, Clone, Copy, Default)]
pub struct ReservedBytes(pub [u8; 8]);

impl ReservedBytes {
    /// Reserved bytes advertising extension protocol + fast extension
    pub fn ours() -> Self {
        let mut reserved = [0u8; 8];
        reserved[5] |= 0x10; // Extension Protocol (BEP 10)
        reserved[7] |= 0x04; // Fast Extension (BEP 6)
        Self(reserved)
    }

    pub fn supports_extension_protocol(&self) -> bool {
        (self.0[5] & 0x10) != 0
    }

    pub fn supports_fast(&self) -> bool {
        (self.0[7] & 0x04) != 0
    }
}

/// Connection state machine.
///
/// `Ready` and `Downloading` alternate with the outstanding-request
/// counter; `Failed` is terminal and reachable from every state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Candidate address, not yet dispatched
    New,
    /// TCP connect in flight
    Connecting,
    /// TCP established, handshakes in flight
    Connected,
    /// Handshaken, no outstanding requests
    Ready,
    /// One or more block/metadata requests outstanding
    Downloading,
    /// Terminal: socket closed or being closed
    Failed,
}

/// Peer wire protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bitfield: Vec<u8> },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    Port { port: u16 },

    // BEP 6: Fast Extension
    SuggestPiece { piece_index: u32 },
    HaveAll,
    HaveNone,
    RejectRequest { index: u32, begin: u32, length: u32 },
    AllowedFast { piece_index: u32 },

    /// Extension envelope (BEP 10): sub-dispatched on the second id byte
    Extended { id: u8, payload: Vec<u8> },

    /// Unknown message type; payload already drained to keep framing
    Unknown { id: u8, payload: Vec<u8> },
}

impl PeerMessage {
    /// Encode the message, length prefix included
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_to(&mut buf);
        buf
    }

    /// Encode into an existing buffer (used to batch request bursts)
    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        fn header(buf: &mut Vec<u8>, len: u32, id: u8) {
            buf.extend_from_slice(&len.to_be_bytes());
            buf.push(id);
        }

        match self {
            Self::KeepAlive => buf.extend_from_slice(&[0, 0, 0, 0]),
            Self::Choke => header(buf, 1, 0),
            Self::Unchoke => header(buf, 1, 1),
            Self::Interested => header(buf, 1, 2),
            Self::NotInterested => header(buf, 1, 3),
            Self::Have { piece_index } => {
                header(buf, 5, 4);
                buf.extend_from_slice(&piece_index.to_be_bytes());
            }
            Self::Bitfield { bitfield } => {
                header(buf, 1 + bitfield.len() as u32, 5);
                buf.extend_from_slice(bitfield);
            }
            Self::Request {
                index,
                begin,
                length,
            } => {
                header(buf, 13, 6);
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(&length.to_be_bytes());
            }
            Self::Piece {
                index,
                begin,
                block,
            } => {
                header(buf, 9 + block.len() as u32, 7);
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(block);
            }
            Self::Cancel {
                index,
                begin,
                length,
            } => {
                header(buf, 13, 8);
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(&length.to_be_bytes());
            }
            Self::Port { port } => {
                header(buf, 3, 9);
                buf.extend_from_slice(&port.to_be_bytes());
            }
            Self::SuggestPiece { piece_index } => {
                header(buf, 5, 0x0D);
                buf.extend_from_slice(&piece_index.to_be_bytes());
            }
            Self::HaveAll => header(buf, 1, 0x0E),
            Self::HaveNone => header(buf, 1, 0x0F),
            Self::RejectRequest {
                index,
                begin,
                length,
            } => {
                header(buf, 13, 0x10);
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(&length.to_be_bytes());
            }
            Self::AllowedFast { piece_index } => {
                header(buf, 5, 0x11);
                buf.extend_from_slice(&piece_index.to_be_bytes());
            }
            Self::Extended { id, payload } => {
                header(buf, 2 + payload.len() as u32, 20);
                buf.push(*id);
                buf.extend_from_slice(payload);
            }
            Self::Unknown { id, payload } => {
                header(buf, 1 + payload.len() as u32, *id);
                buf.extend_from_slice(payload);
            }
        }
    }

    /// Decode a message body (without the length prefix)
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Ok(Self::KeepAlive);
        }

        fn u32_at(payload: &[u8], at: usize) -> u32 {
            u32::from_be_bytes([payload[at], payload[at + 1], payload[at + 2], payload[at + 3]])
        }

        fn need(payload: &[u8], len: usize, what: &str) -> Result<()> {
            if payload.len() < len {
                return Err(EngineError::protocol(
                    ProtocolErrorKind::PeerProtocol,
                    format!("{} message too short", what),
                ));
            }
            Ok(())
        }

        let id = data[0];
        let payload = &data[1..];

        match id {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),
            3 => Ok(Self::NotInterested),
            4 => {
                need(payload, 4, "Have")?;
                Ok(Self::Have {
                    piece_index: u32_at(payload, 0),
                })
            }
            5 => Ok(Self::Bitfield {
                bitfield: payload.to_vec(),
            }),
            6 => {
                need(payload, 12, "Request")?;
                Ok(Self::Request {
                    index: u32_at(payload, 0),
                    begin: u32_at(payload, 4),
                    length: u32_at(payload, 8),
                })
            }
            7 => {
                need(payload, 8, "Piece")?;
                Ok(Self::Piece {
                    index: u32_at(payload, 0),
                    begin: u32_at(payload, 4),
                    block: payload[8..].to_vec(),
                })
            }
            8 => {
                need(payload, 12, "Cancel")?;
                Ok(Self::Cancel {
                    index: u32_at(payload, 0),
                    begin: u32_at(payload, 4),
                    length: u32_at(payload, 8),
                })
            }
            9 => {
                need(payload, 2, "Port")?;
                Ok(Self::Port {
                    port: u16::from_be_bytes([payload[0], payload[1]]),
                })
            }
            0x0D => {
                need(payload, 4, "SuggestPiece")?;
                Ok(Self::SuggestPiece {
                    piece_index: u32_at(payload, 0),
                })
            }
            0x0E => Ok(Self::HaveAll),
            0x0F => Ok(Self::HaveNone),
            0x10 => {
                need(payload, 12, "RejectRequest")?;
                Ok(Self::RejectRequest {
                    index: u32_at(payload, 0),
                    begin: u32_at(payload, 4),
                    length: u32_at(payload, 8),
                })
            }
            0x11 => {
                need(payload, 4, "AllowedFast")?;
                Ok(Self::AllowedFast {
                    piece_index: u32_at(payload, 0),
                })
            }
            20 => {
                need(payload, 1, "Extended")?;
                Ok(Self::Extended {
                    id: payload[0],
                    payload: payload[1..].to_vec(),
                })
            }
            _ => Ok(Self::Unknown {
                id,
                payload: payload.to_vec(),
            }),
        }
    }
}

/// What we know about the remote side's piece inventory
#[derive(Debug, Clone)]
pub enum RemotePieces {
    /// Nothing received yet
    Unknown,
    /// Fast-extension HAVE_ALL shortcut
    All,
    /// Fast-extension HAVE_NONE shortcut (or empty bitfield)
    None,
    /// Explicit bitfield
    Field(Bitfield),
}

/// Per-remote-peer connection entity.
///
/// Shared between the peer's read loop and the scheduler behind an `Arc`.
pub struct PeerLink {
    addr: SocketAddr,
    state: Mutex<PeerState>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,

    /// Outstanding block/metadata request count; zero means `Ready`
    outstanding: AtomicUsize,
    /// Expired requests charged to this peer
    pub timeouts: AtomicU32,
    /// Rejects received from this peer
    pub rejects: AtomicU32,

    last_action: Mutex<Instant>,
    remote_pieces: Mutex<RemotePieces>,
    allowed_fast: Mutex<Vec<u32>>,

    /// Peer is not choking us
    unchoked: AtomicBool,
    /// We told the peer we are interested
    interested_sent: AtomicBool,

    /// Peer's extension id map from its extension handshake
    extensions: Mutex<HashMap<String, u8>>,
    /// metadata_size advertised by the peer, if any
    metadata_size: Mutex<Option<usize>>,

    closed: AtomicBool,
}

impl PeerLink {
    /// New candidate peer in the `New` state
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            state: Mutex::new(PeerState::New),
            writer: tokio::sync::Mutex::new(None),
            outstanding: AtomicUsize::new(0),
            timeouts: AtomicU32::new(0),
            rejects: AtomicU32::new(0),
            last_action: Mutex::new(Instant::now()),
            remote_pieces: Mutex::new(RemotePieces::Unknown),
            allowed_fast: Mutex::new(Vec::new()),
            unchoked: AtomicBool::new(false),
            interested_sent: AtomicBool::new(false),
            extensions: Mutex::new(HashMap::new()),
            metadata_size: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> PeerState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: PeerState) {
        *self.state.lock() = state;
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub fn is_unchoked(&self) -> bool {
        self.unchoked.load(Ordering::SeqCst)
    }

    pub fn interested_sent(&self) -> bool {
        self.interested_sent.load(Ordering::SeqCst)
    }

    pub fn idle_time(&self) -> Duration {
        self.last_action.lock().elapsed()
    }

    pub fn touch(&self) {
        *self.last_action.lock() = Instant::now();
    }

    /// Snapshot of the peer's piece inventory
    pub fn remote_pieces(&self) -> RemotePieces {
        self.remote_pieces.lock().clone()
    }

    /// Pieces the peer offered via ALLOW_FAST
    pub fn allowed_fast(&self) -> Vec<u32> {
        self.allowed_fast.lock().clone()
    }

    /// The peer's negotiated id for a named extension
    pub fn extension_id(&self, name: &str) -> Option<u8> {
        self.extensions.lock().get(name).copied()
    }

    /// metadata_size from the peer's extension handshake
    pub fn peer_metadata_size(&self) -> Option<usize> {
        *self.metadata_size.lock()
    }

    /// Establish the TCP connection and exchange handshakes.
    ///
    /// Returns the read half for the caller's message loop; the write half
    /// stays inside the link. On any failure the link is `Failed`.
    pub async fn connect(
        &self,
        info_hash: Sha1Hash,
        our_peer_id: [u8; 20],
        connect_timeout: Duration,
        handshake_timeout: Duration,
    ) -> Result<OwnedReadHalf> {
        self.set_state(PeerState::Connecting);

        let result = self
            .connect_inner(info_hash, our_peer_id, connect_timeout, handshake_timeout)
            .await;

        match result {
            Ok(read_half) => Ok(read_half),
            Err(e) => {
                self.set_state(PeerState::Failed);
                Err(e)
            }
        }
    }

    async fn connect_inner(
        &self,
        info_hash: Sha1Hash,
        our_peer_id: [u8; 20],
        connect_timeout: Duration,
        handshake_timeout: Duration,
    ) -> Result<OwnedReadHalf> {
        let stream = timeout(connect_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| {
                EngineError::network(NetworkErrorKind::Timeout, "peer connect timeout")
            })?
            .map_err(|e| {
                EngineError::network(
                    NetworkErrorKind::ConnectionRefused,
                    format!("failed to connect: {}", e),
                )
            })?;

        self.set_state(PeerState::Connected);
        let (mut read_half, mut write_half) = stream.into_split();

        // Fixed 68-byte handshake, sent immediately after connect.
        let mut handshake = Vec::with_capacity(HANDSHAKE_SIZE);
        handshake.push(PROTOCOL_STRING.len() as u8);
        handshake.extend_from_slice(PROTOCOL_STRING);
        handshake.extend_from_slice(&ReservedBytes::ours().0);
        handshake.extend_from_slice(&info_hash);
        handshake.extend_from_slice(&our_peer_id);

        timeout(handshake_timeout, write_half.write_all(&handshake))
            .await
            .map_err(|_| EngineError::network(NetworkErrorKind::Timeout, "handshake send timeout"))?
            .map_err(|e| {
                EngineError::network(
                    NetworkErrorKind::ConnectionReset,
                    format!("handshake send failed: {}", e),
                )
            })?;

        let mut response = [0u8; HANDSHAKE_SIZE];
        timeout(handshake_timeout, read_half.read_exact(&mut response))
            .await
            .map_err(|_| {
                EngineError::network(NetworkErrorKind::Timeout, "handshake receive timeout")
            })?
            .map_err(|e| {
                EngineError::network(
                    NetworkErrorKind::ConnectionReset,
                    format!("handshake receive failed: {}", e),
                )
            })?;

        let pstrlen = response[0] as usize;
        if pstrlen != PROTOCOL_STRING.len() || &response[1..1 + pstrlen] != PROTOCOL_STRING {
            return Err(EngineError::protocol(
                ProtocolErrorKind::PeerProtocol,
                "invalid protocol string in handshake",
            ));
        }

        let mut peer_reserved = ReservedBytes::default();
        peer_reserved.0.copy_from_slice(&response[20..28]);

        if response[28..48] != info_hash {
            return Err(EngineError::protocol(
                ProtocolErrorKind::PeerProtocol,
                "info hash mismatch in handshake",
            ));
        }

        *self.writer.lock().await = Some(write_half);
        self.touch();

        // The extension handshake goes out right behind ours; the reply is
        // asynchronous and lands in the message loop.
        if peer_reserved.supports_extension_protocol() {
            let payload = pex::build_extension_handshake(None);
            self.send(PeerMessage::Extended { id: 0, payload }).await?;
        }

        self.set_state(PeerState::Ready);
        Ok(read_half)
    }

    /// Send a single message through the shared write half
    pub async fn send(&self, msg: PeerMessage) -> Result<()> {
        self.send_bytes(&msg.encode()).await
    }

    async fn send_bytes(&self, data: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| {
            EngineError::network(NetworkErrorKind::ConnectionReset, "peer not connected")
        })?;

        timeout(SEND_TIMEOUT, writer.write_all(data))
            .await
            .map_err(|_| EngineError::network(NetworkErrorKind::Timeout, "send timeout"))?
            .map_err(|e| {
                EngineError::network(
                    NetworkErrorKind::ConnectionReset,
                    format!("send failed: {}", e),
                )
            })?;
        writer.flush().await.ok();

        self.touch();
        Ok(())
    }

    /// Batch several block requests into consecutive wire messages and a
    /// single flush, then account them as outstanding.
    pub async fn request_blocks(&self, batch: &[BlockRequest]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::with_capacity(batch.len() * 17);
        for request in batch {
            PeerMessage::Request {
                index: request.piece,
                begin: request.offset,
                length: request.length,
            }
            .encode_to(&mut buf);
        }
        self.send_bytes(&buf).await?;

        self.outstanding.fetch_add(batch.len(), Ordering::SeqCst);
        self.set_state(PeerState::Downloading);
        Ok(())
    }

    /// Request one metadata piece through the peer's negotiated extension id
    pub async fn request_metadata_piece(&self, ext_id: u8, piece: usize) -> Result<()> {
        let payload = super::metadata::MetadataMessage::request(piece).encode();
        self.send(PeerMessage::Extended {
            id: ext_id,
            payload,
        })
        .await?;
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        self.set_state(PeerState::Downloading);
        Ok(())
    }

    /// Note a completed/rejected request; flips back to `Ready` on zero.
    ///
    /// Returns the remaining outstanding count so the read loop can
    /// self-pipeline the next batch the moment it drains.
    pub fn request_settled(&self) -> usize {
        let mut current = self.outstanding.load(Ordering::SeqCst);
        loop {
            if current == 0 {
                return 0;
            }
            match self.outstanding.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    let remaining = current - 1;
                    if remaining == 0 && self.state() == PeerState::Downloading {
                        self.set_state(PeerState::Ready);
                    }
                    return remaining;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Clear the outstanding counter (choke / disconnect path)
    pub fn clear_outstanding(&self) {
        self.outstanding.store(0, Ordering::SeqCst);
        if self.state() == PeerState::Downloading {
            self.set_state(PeerState::Ready);
        }
    }

    pub async fn send_keep_alive(&self) -> Result<()> {
        self.send(PeerMessage::KeepAlive).await
    }

    /// Withdraw a block request (endgame duplicates won from elsewhere)
    pub async fn cancel_block(&self, index: u32, begin: u32, length: u32) -> Result<()> {
        self.send(PeerMessage::Cancel {
            index,
            begin,
            length,
        })
        .await
    }

    pub async fn send_interested(&self) -> Result<()> {
        self.interested_sent.store(true, Ordering::SeqCst);
        self.send(PeerMessage::Interested).await
    }

    /// Fold an inbound message into the link's protocol state.
    pub fn apply_message(&self, msg: &PeerMessage, num_pieces: usize) {
        self.touch();
        match msg {
            PeerMessage::Choke => {
                self.unchoked.store(false, Ordering::SeqCst);
            }
            PeerMessage::Unchoke => {
                self.unchoked.store(true, Ordering::SeqCst);
            }
            PeerMessage::Have { piece_index } => {
                let mut remote = self.remote_pieces.lock();
                match &*remote {
                    RemotePieces::Field(field) => {
                        if (*piece_index as usize) < field.len() {
                            field.set(*piece_index as usize);
                        }
                    }
                    RemotePieces::All => {}
                    _ => {
                        if num_pieces > 0 && (*piece_index as usize) < num_pieces {
                            let field = Bitfield::new(num_pieces);
                            field.set(*piece_index as usize);
                            *remote = RemotePieces::Field(field);
                        }
                    }
                }
            }
            PeerMessage::Bitfield { bitfield } => {
                if num_pieces > 0 {
                    let field = Bitfield::from_bytes(bitfield, num_pieces);
                    *self.remote_pieces.lock() = if field.count() == 0 {
                        RemotePieces::None
                    } else {
                        RemotePieces::Field(field)
                    };
                }
            }
            PeerMessage::HaveAll => {
                *self.remote_pieces.lock() = RemotePieces::All;
            }
            PeerMessage::HaveNone => {
                *self.remote_pieces.lock() = RemotePieces::None;
            }
            PeerMessage::AllowedFast { piece_index } => {
                let mut allowed = self.allowed_fast.lock();
                if !allowed.contains(piece_index) {
                    allowed.push(*piece_index);
                }
            }
            _ => {}
        }
    }

    /// Record the peer's extension handshake (`m` dict + metadata_size)
    pub fn apply_extension_handshake(&self, handshake: pex::ExtensionHandshake) {
        *self.extensions.lock() = handshake.extensions;
        *self.metadata_size.lock() = handshake.metadata_size;
    }

    /// Does the peer claim this piece?
    pub fn has_piece(&self, index: u32) -> bool {
        match &*self.remote_pieces.lock() {
            RemotePieces::All => true,
            RemotePieces::Field(field) => {
                (index as usize) < field.len() && field.get(index as usize)
            }
            _ => false,
        }
    }

    /// Close the socket. Idempotent; safe from any task.
    ///
    /// The caller is responsible for returning this peer's outstanding
    /// requests to the piece store *before* calling this, so in-flight
    /// work is never silently lost.
    pub async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(PeerState::Failed);
        if let Some(mut writer) = self.writer.lock().await.take() {
            writer.shutdown().await.ok();
        }
    }
}

/// Framed reader over the connection's read half.
pub struct PeerReader {
    half: OwnedReadHalf,
    buf: BytesMut,
    read_timeout: Duration,
}

impl PeerReader {
    pub fn new(half: OwnedReadHalf, read_timeout: Duration) -> Self {
        Self {
            half,
            buf: BytesMut::with_capacity(MAX_FRAME_SIZE),
            read_timeout,
        }
    }

    /// Read one framed message.
    ///
    /// Every message starts with a 4-byte big-endian length covering
    /// everything after the prefix; zero is a keep-alive. An oversized
    /// declared length is treated as stream corruption and fails the
    /// connection immediately, before any buffer is sized from it.
    pub async fn next_message(&mut self) -> Result<PeerMessage> {
        let mut len_buf = [0u8; 4];
        timeout(self.read_timeout, self.half.read_exact(&mut len_buf))
            .await
            .map_err(|_| EngineError::network(NetworkErrorKind::Timeout, "receive timeout"))?
            .map_err(|e| {
                EngineError::network(
                    NetworkErrorKind::ConnectionReset,
                    format!("receive failed: {}", e),
                )
            })?;

        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Ok(PeerMessage::KeepAlive);
        }
        if len > MAX_FRAME_SIZE {
            return Err(EngineError::protocol(
                ProtocolErrorKind::PeerProtocol,
                format!("declared message length {} exceeds frame bound", len),
            ));
        }

        self.buf.resize(len, 0);
        timeout(self.read_timeout, self.half.read_exact(&mut self.buf))
            .await
            .map_err(|_| EngineError::network(NetworkErrorKind::Timeout, "receive body timeout"))?
            .map_err(|e| {
                EngineError::network(
                    NetworkErrorKind::ConnectionReset,
                    format!("receive body failed: {}", e),
                )
            })?;

        PeerMessage::decode(&self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_encode_decode_round_trip() {
        let cases = vec![
            PeerMessage::Choke,
            PeerMessage::Unchoke,
            PeerMessage::Interested,
            PeerMessage::Have { piece_index: 42 },
            PeerMessage::Request {
                index: 1,
                begin: 16384,
                length: 16384,
            },
            PeerMessage::Piece {
                index: 7,
                begin: 0,
                block: vec![1, 2, 3],
            },
            PeerMessage::HaveAll,
            PeerMessage::HaveNone,
            PeerMessage::RejectRequest {
                index: 2,
                begin: 0,
                length: 16384,
            },
            PeerMessage::AllowedFast { piece_index: 9 },
            PeerMessage::Extended {
                id: 3,
                payload: b"d1:ai1ee".to_vec(),
            },
        ];

        for msg in cases {
            let encoded = msg.encode();
            let decoded = PeerMessage::decode(&encoded[4..]).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn keep_alive_is_length_zero() {
        assert_eq!(PeerMessage::KeepAlive.encode(), vec![0, 0, 0, 0]);
        assert_eq!(PeerMessage::decode(&[]).unwrap(), PeerMessage::KeepAlive);
    }

    #[test]
    fn truncated_messages_are_rejected() {
        // Have with no payload
        assert!(PeerMessage::decode(&[4]).is_err());
        // Request with 8 of 12 payload bytes
        assert!(PeerMessage::decode(&[6, 0, 0, 0, 1, 0, 0, 0, 2]).is_err());
        // Extended with no sub-id
        assert!(PeerMessage::decode(&[20]).is_err());
    }

    #[test]
    fn reserved_bytes_flags() {
        let ours = ReservedBytes::ours();
        assert!(ours.supports_extension_protocol());
        assert!(ours.supports_fast());
        assert!(!ReservedBytes::default().supports_extension_protocol());
    }

    #[test]
    fn link_state_follows_outstanding_counter() {
        let link = PeerLink::new("127.0.0.1:6881".parse().unwrap());
        assert_eq!(link.state(), PeerState::New);

        link.set_state(PeerState::Downloading);
        link.outstanding.store(2, Ordering::SeqCst);

        assert_eq!(link.request_settled(), 1);
        assert_eq!(link.state(), PeerState::Downloading);
        assert_eq!(link.request_settled(), 0);
        assert_eq!(link.state(), PeerState::Ready);

        // Settling with nothing outstanding must not underflow.
        assert_eq!(link.request_settled(), 0);
    }

    #[test]
    fn apply_message_tracks_remote_pieces() {
        let link = PeerLink::new("127.0.0.1:6881".parse().unwrap());

        link.apply_message(&PeerMessage::HaveNone, 16);
        assert!(!link.has_piece(3));

        link.apply_message(&PeerMessage::Have { piece_index: 3 }, 16);
        assert!(link.has_piece(3));
        assert!(!link.has_piece(4));

        link.apply_message(&PeerMessage::HaveAll, 16);
        assert!(link.has_piece(15));

        link.apply_message(
            &PeerMessage::Bitfield {
                bitfield: vec![0b1000_0000, 0],
            },
            16,
        );
        assert!(link.has_piece(0));
        assert!(!link.has_piece(1));

        link.apply_message(&PeerMessage::AllowedFast { piece_index: 5 }, 16);
        assert_eq!(link.allowed_fast(), vec![5]);
    }

    #[test]
    fn choke_state_toggles() {
        let link = PeerLink::new("127.0.0.1:6881".parse().unwrap());
        assert!(!link.is_unchoked());
        link.apply_message(&PeerMessage::Unchoke, 0);
        assert!(link.is_unchoked());
        link.apply_message(&PeerMessage::Choke, 0);
        assert!(!link.is_unchoked());
    }
}
