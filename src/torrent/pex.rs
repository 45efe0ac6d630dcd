//! Extension protocol handshake and peer exchange (BEP 10 / BEP 11)
//!
//! The extension handshake advertises our `m` dict (ut_metadata, ut_pex)
//! and carries the peer's back. PEX here is consumed only as an extra
//! candidate-peer source: incoming `added` entries feed the scheduler's
//! known-peer set; we never emit PEX messages ourselves.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use super::bencode::BencodeValue;
use crate::error::{EngineError, ProtocolErrorKind, Result};

/// Extension name for ut_pex in the BEP 10 handshake
pub const PEX_EXTENSION_NAME: &str = "ut_pex";

/// Extension name for ut_metadata in the BEP 10 handshake
pub const METADATA_EXTENSION_NAME: &str = "ut_metadata";

/// Our extension id for ut_metadata (what we advertise to peers)
pub const OUR_METADATA_EXTENSION_ID: u8 = 2;

/// Our extension id for ut_pex
pub const OUR_PEX_EXTENSION_ID: u8 = 1;

/// Parsed extension handshake from a peer
#[derive(Debug, Clone, Default)]
pub struct ExtensionHandshake {
    /// Extension name -> peer's message id
    pub extensions: HashMap<String, u8>,
    /// Peer's client identification string, if sent
    pub client: Option<String>,
    /// Total metadata size, if the peer has the metadata
    pub metadata_size: Option<usize>,
}

impl ExtensionHandshake {
    /// The peer's id for ut_metadata, if supported
    pub fn metadata_id(&self) -> Option<u8> {
        self.extensions.get(METADATA_EXTENSION_NAME).copied()
    }

    /// The peer's id for ut_pex, if supported
    pub fn pex_id(&self) -> Option<u8> {
        self.extensions.get(PEX_EXTENSION_NAME).copied()
    }
}

/// Build our extension handshake payload.
///
/// `metadata_size` is included when we already hold the metadata (peers
/// bootstrapping from a magnet ask for it).
pub fn build_extension_handshake(metadata_size: Option<usize>) -> Vec<u8> {
    let mut m = std::collections::BTreeMap::new();
    m.insert(
        METADATA_EXTENSION_NAME.as_bytes().to_vec(),
        BencodeValue::Integer(OUR_METADATA_EXTENSION_ID as i64),
    );
    m.insert(
        PEX_EXTENSION_NAME.as_bytes().to_vec(),
        BencodeValue::Integer(OUR_PEX_EXTENSION_ID as i64),
    );

    let mut root = std::collections::BTreeMap::new();
    root.insert(b"m".to_vec(), BencodeValue::Dict(m));
    root.insert(b"v".to_vec(), BencodeValue::Bytes(b"riptide 0.1".to_vec()));
    if let Some(size) = metadata_size {
        root.insert(
            b"metadata_size".to_vec(),
            BencodeValue::Integer(size as i64),
        );
    }

    BencodeValue::Dict(root).encode()
}

/// Parse a peer's extension handshake payload
pub fn parse_extension_handshake(data: &[u8]) -> Result<ExtensionHandshake> {
    let value = BencodeValue::parse_exact(data).map_err(|_| {
        EngineError::protocol(
            ProtocolErrorKind::PeerProtocol,
            "malformed extension handshake",
        )
    })?;

    let dict = value.as_dict().ok_or_else(|| {
        EngineError::protocol(
            ProtocolErrorKind::PeerProtocol,
            "extension handshake must be a dict",
        )
    })?;

    let mut extensions = HashMap::new();
    if let Some(m) = dict.get(b"m".as_slice()).and_then(|v| v.as_dict()) {
        for (name, id) in m {
            if let (Ok(name), Some(id)) = (String::from_utf8(name.clone()), id.as_uint()) {
                extensions.insert(name, id as u8);
            }
        }
    }

    let client = dict
        .get(b"v".as_slice())
        .and_then(|v| v.as_string())
        .map(String::from);

    let metadata_size = dict
        .get(b"metadata_size".as_slice())
        .and_then(|v| v.as_uint())
        .map(|v| v as usize);

    Ok(ExtensionHandshake {
        extensions,
        client,
        metadata_size,
    })
}

/// Peers advertised in a ut_pex message's `added` field
pub fn parse_pex_added(data: &[u8]) -> Result<Vec<SocketAddr>> {
    let value = BencodeValue::parse_exact(data).map_err(|_| {
        EngineError::protocol(ProtocolErrorKind::PeerProtocol, "malformed PEX message")
    })?;

    let Some(added) = value.get("added").and_then(|v| v.as_bytes()) else {
        return Ok(Vec::new());
    };

    Ok(parse_compact_peers_v4(added))
}

/// Decode packed 6-byte (IPv4 + port) peer entries
pub fn parse_compact_peers_v4(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .filter(|addr| addr.port() != 0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_round_trip() {
        let payload = build_extension_handshake(Some(31744));
        let parsed = parse_extension_handshake(&payload).unwrap();

        assert_eq!(parsed.metadata_id(), Some(OUR_METADATA_EXTENSION_ID));
        assert_eq!(parsed.pex_id(), Some(OUR_PEX_EXTENSION_ID));
        assert_eq!(parsed.metadata_size, Some(31744));
        assert_eq!(parsed.client.as_deref(), Some("riptide 0.1"));
    }

    #[test]
    fn handshake_without_metadata_size() {
        let payload = build_extension_handshake(None);
        let parsed = parse_extension_handshake(&payload).unwrap();
        assert!(parsed.metadata_size.is_none());
    }

    #[test]
    fn parse_peer_handshake_with_unknown_extensions() {
        let payload = b"d1:md11:ut_metadatai3e9:ut_uploadi7eee";
        let parsed = parse_extension_handshake(payload).unwrap();
        assert_eq!(parsed.metadata_id(), Some(3));
        assert_eq!(parsed.extensions.get("ut_upload"), Some(&7));
    }

    #[test]
    fn malformed_handshake_is_rejected() {
        assert!(parse_extension_handshake(b"not bencode").is_err());
        assert!(parse_extension_handshake(b"i42e").is_err());
    }

    #[test]
    fn pex_added_peers_are_decoded() {
        // added = two packed peers: 10.0.0.1:6881, 10.0.0.2:6882
        let mut added = Vec::new();
        added.extend_from_slice(&[10, 0, 0, 1]);
        added.extend_from_slice(&6881u16.to_be_bytes());
        added.extend_from_slice(&[10, 0, 0, 2]);
        added.extend_from_slice(&6882u16.to_be_bytes());

        let mut dict = std::collections::BTreeMap::new();
        dict.insert(b"added".to_vec(), BencodeValue::Bytes(added));
        let payload = BencodeValue::Dict(dict).encode();

        let peers = parse_pex_added(&payload).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0], "10.0.0.1:6881".parse().unwrap());
    }

    #[test]
    fn zero_ports_are_dropped() {
        let mut data = Vec::new();
        data.extend_from_slice(&[10, 0, 0, 1, 0, 0]);
        assert!(parse_compact_peers_v4(&data).is_empty());
    }
}
