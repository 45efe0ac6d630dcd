//! Mock BitTorrent peer for integration tests
//!
//! A scriptable in-process peer listening on a real TCP socket. It
//! handshakes, advertises the extension protocol, serves configured piece
//! data and metadata, and can misbehave on demand (duplicate block
//! delivery) to exercise the engine's recovery paths.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Protocol string for the BitTorrent handshake
const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// Extension id this mock advertises for ut_metadata
const MOCK_METADATA_ID: u8 = 3;

/// Extension id the engine advertises for ut_metadata (where our data
/// replies must go)
const CLIENT_METADATA_ID: u8 = 2;

/// Mock peer configuration
#[derive(Clone)]
pub struct MockPeerConfig {
    /// Info hash to accept connections for
    pub info_hash: [u8; 20],
    /// Total piece count of the torrent
    pub num_pieces: usize,
    /// Piece data to serve, keyed by piece index
    pub piece_data: HashMap<u32, Vec<u8>>,
    /// Raw metadata (info dict bytes) for ut_metadata serving
    pub metadata: Option<Vec<u8>>,
    /// Send every served block twice
    pub duplicate_blocks: bool,
}

impl MockPeerConfig {
    pub fn new(info_hash: [u8; 20], num_pieces: usize) -> Self {
        Self {
            info_hash,
            num_pieces,
            piece_data: HashMap::new(),
            metadata: None,
            duplicate_blocks: false,
        }
    }

    /// Add a piece this peer has and serves
    pub fn with_piece(mut self, index: u32, data: Vec<u8>) -> Self {
        self.piece_data.insert(index, data);
        self
    }

    /// Serve metadata over ut_metadata
    pub fn with_metadata(mut self, metadata: Vec<u8>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Deliver every block twice
    pub fn with_duplicate_blocks(mut self) -> Self {
        self.duplicate_blocks = true;
        self
    }
}

/// A mock peer accepting connections in the background
pub struct MockPeer {
    config: MockPeerConfig,
    listener: TcpListener,
}

impl MockPeer {
    pub async fn start(config: MockPeerConfig) -> std::io::Result<(Arc<Self>, SocketAddr)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let peer = Arc::new(Self { config, listener });

        let accepting = Arc::clone(&peer);
        tokio::spawn(async move {
            loop {
                match accepting.listener.accept().await {
                    Ok((stream, _)) => {
                        let peer = Arc::clone(&accepting);
                        tokio::spawn(async move {
                            let _ = peer.handle_connection(stream).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        Ok((peer, addr))
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> std::io::Result<()> {
        self.do_handshake(&mut stream).await?;
        self.send_extension_handshake(&mut stream).await?;
        self.send_bitfield(&mut stream).await?;
        self.send_unchoke(&mut stream).await?;

        loop {
            let (id, payload) = self.read_message(&mut stream).await?;
            match id {
                // Request
                Some(6) => {
                    let index = u32::from_be_bytes(payload[0..4].try_into().unwrap());
                    let begin = u32::from_be_bytes(payload[4..8].try_into().unwrap());
                    let length = u32::from_be_bytes(payload[8..12].try_into().unwrap());

                    if let Some(piece) = self.config.piece_data.get(&index) {
                        let end = (begin + length) as usize;
                        if end <= piece.len() {
                            let block = piece[begin as usize..end].to_vec();
                            self.send_piece(&mut stream, index, begin, &block).await?;
                            if self.config.duplicate_blocks {
                                self.send_piece(&mut stream, index, begin, &block).await?;
                            }
                        }
                    }
                }

                // Extended
                Some(20) => {
                    let ext_id = payload[0];
                    if ext_id == MOCK_METADATA_ID {
                        self.serve_metadata(&mut stream, &payload[1..]).await?;
                    }
                    // Extension handshakes and anything else are ignored.
                }

                _ => {}
            }
        }
    }

    async fn do_handshake(&self, stream: &mut TcpStream) -> std::io::Result<()> {
        let mut handshake = [0u8; 68];
        stream.read_exact(&mut handshake).await?;

        if handshake[0] != 19 || &handshake[1..20] != PROTOCOL_STRING {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "invalid protocol string",
            ));
        }
        if handshake[28..48] != self.config.info_hash {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "info hash mismatch",
            ));
        }

        let mut response = Vec::with_capacity(68);
        response.push(19);
        response.extend_from_slice(PROTOCOL_STRING);
        let mut reserved = [0u8; 8];
        reserved[5] |= 0x10; // extension protocol
        response.extend_from_slice(&reserved);
        response.extend_from_slice(&self.config.info_hash);
        response.extend_from_slice(b"-MK0001-0123456789ab");
        stream.write_all(&response).await
    }

    async fn send_extension_handshake(&self, stream: &mut TcpStream) -> std::io::Result<()> {
        let payload = match &self.config.metadata {
            Some(metadata) => format!(
                "d1:md11:ut_metadatai{}ee13:metadata_sizei{}ee",
                MOCK_METADATA_ID,
                metadata.len()
            )
            .into_bytes(),
            None => format!("d1:md11:ut_metadatai{}eee", MOCK_METADATA_ID).into_bytes(),
        };

        let len = 2 + payload.len() as u32;
        let mut msg = Vec::with_capacity(4 + len as usize);
        msg.extend_from_slice(&len.to_be_bytes());
        msg.push(20);
        msg.push(0);
        msg.extend_from_slice(&payload);
        stream.write_all(&msg).await
    }

    async fn send_bitfield(&self, stream: &mut TcpStream) -> std::io::Result<()> {
        let byte_count = self.config.num_pieces.div_ceil(8);
        let mut bits = vec![0u8; byte_count];
        for index in self.config.piece_data.keys() {
            let index = *index as usize;
            if index < self.config.num_pieces {
                bits[index / 8] |= 0x80 >> (index % 8);
            }
        }

        let len = 1 + bits.len() as u32;
        let mut msg = Vec::with_capacity(4 + len as usize);
        msg.extend_from_slice(&len.to_be_bytes());
        msg.push(5);
        msg.extend_from_slice(&bits);
        stream.write_all(&msg).await
    }

    async fn send_unchoke(&self, stream: &mut TcpStream) -> std::io::Result<()> {
        stream.write_all(&[0, 0, 0, 1, 1]).await
    }

    async fn send_piece(
        &self,
        stream: &mut TcpStream,
        index: u32,
        begin: u32,
        block: &[u8],
    ) -> std::io::Result<()> {
        let len = 9 + block.len() as u32;
        let mut msg = Vec::with_capacity(4 + len as usize);
        msg.extend_from_slice(&len.to_be_bytes());
        msg.push(7);
        msg.extend_from_slice(&index.to_be_bytes());
        msg.extend_from_slice(&begin.to_be_bytes());
        msg.extend_from_slice(block);
        stream.write_all(&msg).await
    }

    /// Answer a ut_metadata request with a data message on the client's id
    async fn serve_metadata(
        &self,
        stream: &mut TcpStream,
        payload: &[u8],
    ) -> std::io::Result<()> {
        let Some(metadata) = &self.config.metadata else {
            return Ok(());
        };

        // Header is a tiny bencoded dict: {msg_type: 0, piece: N}. Pull the
        // piece index out without a full parser.
        let text = String::from_utf8_lossy(payload);
        let piece: usize = text
            .split("5:piecei")
            .nth(1)
            .and_then(|rest| rest.split('e').next())
            .and_then(|n| n.parse().ok())
            .unwrap_or(0);

        let piece_size = 16 * 1024;
        let start = piece * piece_size;
        let end = (start + piece_size).min(metadata.len());
        if start >= metadata.len() {
            return Ok(());
        }

        let header = format!(
            "d8:msg_typei1e5:piecei{}e10:total_sizei{}ee",
            piece,
            metadata.len()
        );
        let mut body = header.into_bytes();
        body.extend_from_slice(&metadata[start..end]);

        let len = 2 + body.len() as u32;
        let mut msg = Vec::with_capacity(4 + len as usize);
        msg.extend_from_slice(&len.to_be_bytes());
        msg.push(20);
        msg.push(CLIENT_METADATA_ID);
        msg.extend_from_slice(&body);
        stream.write_all(&msg).await
    }

    /// Read one framed message; `None` id means keep-alive
    async fn read_message(
        &self,
        stream: &mut TcpStream,
    ) -> std::io::Result<(Option<u8>, Vec<u8>)> {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;

        if len == 0 {
            return Ok((None, Vec::new()));
        }

        let mut data = vec![0u8; len];
        stream.read_exact(&mut data).await?;
        Ok((Some(data[0]), data[1..].to_vec()))
    }
}

/// Deterministic test piece data with its SHA-1
pub fn test_piece(piece_length: usize, seed: u8) -> (Vec<u8>, [u8; 20]) {
    let data: Vec<u8> = (0..piece_length)
        .map(|i| ((i + seed as usize) % 251) as u8)
        .collect();
    let mut hasher = Sha1::new();
    hasher.update(&data);
    (data, hasher.finalize().into())
}
