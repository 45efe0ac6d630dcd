//! Metadata fetching for magnet links (BEP 9)
//!
//! A magnet session knows only the infohash. Peers advertising ut_metadata
//! serve the info dictionary in 16 KiB pieces; the total size is unknown
//! until the first data response carries it. Pieces are assembled out of
//! order into a staging buffer behind a [`Bitfield`], under a parallelism
//! budget so the bootstrap window does not hammer every peer for the same
//! few pieces.
//!
//! The assembled bytes MUST hash to the magnet's infohash. That check is
//! the only integrity guarantee that the fetched metadata belongs to the
//! requested torrent, and a mismatch is fatal to the session: it means a
//! wrong or malicious swarm, with no recovery path.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sha1::{Digest, Sha1};

use super::bencode::BencodeValue;
use super::metainfo::Sha1Hash;
use crate::bitfield::Bitfield;
use crate::error::{EngineError, ProtocolErrorKind, Result};

/// Size of metadata pieces (16 KiB)
pub const METADATA_PIECE_SIZE: usize = 16 * 1024;

/// Metadata message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataMessageType {
    /// Request a piece of metadata
    Request = 0,
    /// Data response with a piece of metadata
    Data = 1,
    /// Reject - peer will not serve this piece
    Reject = 2,
}

impl MetadataMessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Request),
            1 => Some(Self::Data),
            2 => Some(Self::Reject),
            _ => None,
        }
    }
}

/// A metadata extension message: a small bencoded header, and for data
/// responses the raw piece bytes appended with no delimiter.
#[derive(Debug, Clone)]
pub struct MetadataMessage {
    pub msg_type: MetadataMessageType,
    pub piece: usize,
    /// Total metadata size (only present in data messages)
    pub total_size: Option<usize>,
    /// Piece payload (only present in data messages)
    pub data: Option<Vec<u8>>,
}

impl MetadataMessage {
    pub fn request(piece: usize) -> Self {
        Self {
            msg_type: MetadataMessageType::Request,
            piece,
            total_size: None,
            data: None,
        }
    }

    pub fn data(piece: usize, total_size: usize, data: Vec<u8>) -> Self {
        Self {
            msg_type: MetadataMessageType::Data,
            piece,
            total_size: Some(total_size),
            data: Some(data),
        }
    }

    pub fn reject(piece: usize) -> Self {
        Self {
            msg_type: MetadataMessageType::Reject,
            piece,
            total_size: None,
            data: None,
        }
    }

    /// Encode header dict plus trailing raw bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut dict = std::collections::BTreeMap::new();
        dict.insert(
            b"msg_type".to_vec(),
            BencodeValue::Integer(self.msg_type as i64),
        );
        dict.insert(b"piece".to_vec(), BencodeValue::Integer(self.piece as i64));
        if let Some(size) = self.total_size {
            dict.insert(b"total_size".to_vec(), BencodeValue::Integer(size as i64));
        }

        let mut encoded = BencodeValue::Dict(dict).encode();
        if let Some(ref data) = self.data {
            encoded.extend_from_slice(data);
        }
        encoded
    }

    /// Parse the header dict; whatever follows it is the piece payload
    pub fn parse(data: &[u8]) -> Result<Self> {
        let parse_result = BencodeValue::parse(data)?;
        let consumed = data.len() - parse_result.remaining.len();

        let dict = parse_result.value.as_dict().ok_or_else(|| {
            EngineError::protocol(
                ProtocolErrorKind::MetadataError,
                "metadata message must be a dict",
            )
        })?;

        let msg_type = dict
            .get(b"msg_type".as_slice())
            .and_then(|v| v.as_uint())
            .and_then(|v| MetadataMessageType::from_u8(v as u8))
            .ok_or_else(|| {
                EngineError::protocol(
                    ProtocolErrorKind::MetadataError,
                    "invalid or missing msg_type",
                )
            })?;

        let piece = dict
            .get(b"piece".as_slice())
            .and_then(|v| v.as_uint())
            .map(|v| v as usize)
            .ok_or_else(|| {
                EngineError::protocol(ProtocolErrorKind::MetadataError, "invalid or missing piece")
            })?;

        let total_size = dict
            .get(b"total_size".as_slice())
            .and_then(|v| v.as_uint())
            .map(|v| v as usize);

        let piece_data = if msg_type == MetadataMessageType::Data && consumed < data.len() {
            Some(data[consumed..].to_vec())
        } else {
            None
        };

        Ok(Self {
            msg_type,
            piece,
            total_size,
            data: piece_data,
        })
    }
}

struct MetaState {
    /// 0 until the first data response arrives
    total_size: Option<usize>,
    /// Sized once total_size is known
    have: Option<Bitfield>,
    buffer: Vec<u8>,
    /// Outstanding piece requests with their issue time
    outstanding: Vec<(usize, Instant)>,
    /// Verified assembled metadata
    finished: Option<Vec<u8>>,
}

/// Metadata fetch state for one magnet session
pub struct MetadataFetcher {
    info_hash: Sha1Hash,
    /// Maximum outstanding metadata requests across the swarm
    budget: usize,
    state: Mutex<MetaState>,
}

impl MetadataFetcher {
    pub fn new(info_hash: Sha1Hash, budget: usize) -> Self {
        Self {
            info_hash,
            budget: budget.max(1),
            state: Mutex::new(MetaState {
                total_size: None,
                have: None,
                buffer: Vec::new(),
                outstanding: Vec::new(),
                finished: None,
            }),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().finished.is_some()
    }

    /// The verified metadata bytes, once assembled
    pub fn metadata(&self) -> Option<Vec<u8>> {
        self.state.lock().finished.clone()
    }

    pub fn total_size(&self) -> Option<usize> {
        self.state.lock().total_size
    }

    fn piece_count(total_size: usize) -> usize {
        total_size.div_ceil(METADATA_PIECE_SIZE)
    }

    /// Pieces to request now, bounded by the remaining budget.
    ///
    /// Before the total size is known only piece 0 is useful (the reply
    /// carries the size); afterwards any missing, not-outstanding piece.
    pub fn next_requests(&self, max: usize) -> Vec<usize> {
        let mut state = self.state.lock();
        if state.finished.is_some() {
            return Vec::new();
        }

        let available = self.budget.saturating_sub(state.outstanding.len()).min(max);
        if available == 0 {
            return Vec::new();
        }

        let picks: Vec<usize> = match (state.total_size, &state.have) {
            (Some(total), Some(have)) => (0..Self::piece_count(total))
                .filter(|&i| !have.get(i))
                .filter(|i| !state.outstanding.iter().any(|(p, _)| p == i))
                .take(available)
                .collect(),
            _ => {
                if state.outstanding.iter().any(|(p, _)| *p == 0) {
                    Vec::new()
                } else {
                    vec![0]
                }
            }
        };

        let now = Instant::now();
        for &piece in &picks {
            state.outstanding.push((piece, now));
        }
        picks
    }

    /// Expire outstanding requests, returning their budget. The pieces
    /// become requestable again on the next plan.
    pub fn sweep_timeouts(&self, budget: Duration) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        let before = state.outstanding.len();
        state
            .outstanding
            .retain(|(_, at)| now.duration_since(*at) < budget);
        before - state.outstanding.len()
    }

    /// Fold in a metadata message from any peer.
    ///
    /// Returns `Ok(true)` once the metadata is complete and verified. An
    /// infohash mismatch after full assembly is a hard error.
    pub fn process_message(&self, msg: MetadataMessage) -> Result<bool> {
        match msg.msg_type {
            // We are leech-only for metadata too; requests from peers are
            // answered by silence.
            MetadataMessageType::Request => Ok(false),

            MetadataMessageType::Reject => {
                let mut state = self.state.lock();
                state.outstanding.retain(|(p, _)| *p != msg.piece);
                Ok(false)
            }

            MetadataMessageType::Data => self.on_data(msg),
        }
    }

    fn on_data(&self, msg: MetadataMessage) -> Result<bool> {
        let total_size = msg.total_size.ok_or_else(|| {
            EngineError::protocol(
                ProtocolErrorKind::MetadataError,
                "data message missing total_size",
            )
        })?;
        let data = msg.data.ok_or_else(|| {
            EngineError::protocol(
                ProtocolErrorKind::MetadataError,
                "data message missing piece data",
            )
        })?;

        if total_size == 0 {
            return Err(EngineError::protocol(
                ProtocolErrorKind::MetadataError,
                "peer advertised zero-size metadata",
            ));
        }

        let mut state = self.state.lock();
        if state.finished.is_some() {
            return Ok(true);
        }

        // First response fixes the geometry.
        if state.total_size.is_none() {
            state.total_size = Some(total_size);
            state.have = Some(Bitfield::new(Self::piece_count(total_size)));
            state.buffer = vec![0; total_size];
        }

        let known_size = state.total_size.unwrap();
        if total_size != known_size {
            return Err(EngineError::protocol(
                ProtocolErrorKind::MetadataError,
                format!(
                    "peer reported metadata size {} but swarm established {}",
                    total_size, known_size
                ),
            ));
        }

        let piece_count = Self::piece_count(known_size);
        if msg.piece >= piece_count {
            return Err(EngineError::protocol(
                ProtocolErrorKind::MetadataError,
                format!("metadata piece {} out of range", msg.piece),
            ));
        }

        let offset = msg.piece * METADATA_PIECE_SIZE;
        let expected = (known_size - offset).min(METADATA_PIECE_SIZE);
        if data.len() != expected {
            return Err(EngineError::protocol(
                ProtocolErrorKind::MetadataError,
                format!(
                    "metadata piece {} has wrong size {} (expected {})",
                    msg.piece,
                    data.len(),
                    expected
                ),
            ));
        }

        state.outstanding.retain(|(p, _)| *p != msg.piece);

        let have = state.have.as_ref().unwrap();
        if have.get(msg.piece) {
            // Duplicate metadata piece; harmless.
            return Ok(false);
        }
        have.set(msg.piece);
        state.buffer[offset..offset + data.len()].copy_from_slice(&data);

        if !state.have.as_ref().unwrap().is_full() {
            return Ok(false);
        }

        // Every piece landed: the assembled dict must hash to the magnet's
        // infohash or the whole session is talking to the wrong swarm.
        let mut hasher = Sha1::new();
        hasher.update(&state.buffer);
        let actual: Sha1Hash = hasher.finalize().into();

        if actual != self.info_hash {
            return Err(EngineError::protocol(
                ProtocolErrorKind::MetadataError,
                "assembled metadata does not match the magnet infohash",
            ));
        }

        state.finished = Some(std::mem::take(&mut state.buffer));
        tracing::info!("metadata assembled and verified ({} bytes)", known_size);
        Ok(true)
    }
}
