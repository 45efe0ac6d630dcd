//! Magnet URI parser
//!
//! A magnet link carries only the infohash plus optional hints; the full
//! metadata comes over the wire (BEP 9) once a peer is found.
//!
//! Format: `magnet:?xt=urn:btih:<hash>&dn=<name>&tr=<tracker>`

use crate::error::{EngineError, ProtocolErrorKind, Result};

use super::metainfo::Sha1Hash;

/// Parsed magnet URI
#[derive(Debug, Clone)]
pub struct MagnetUri {
    /// Info hash (20 bytes)
    pub info_hash: Sha1Hash,
    /// Display name (optional)
    pub display_name: Option<String>,
    /// Tracker URL hints
    pub trackers: Vec<String>,
    /// Exact length (optional, rarely present)
    pub exact_length: Option<u64>,
}

impl MagnetUri {
    /// Parse a magnet URI string
    pub fn parse(uri: &str) -> Result<Self> {
        let query = uri.strip_prefix("magnet:?").ok_or_else(|| {
            EngineError::protocol(
                ProtocolErrorKind::InvalidMagnet,
                "URI must start with 'magnet:?'",
            )
        })?;

        let mut info_hash: Option<Sha1Hash> = None;
        let mut display_name: Option<String> = None;
        let mut trackers = Vec::new();
        let mut exact_length: Option<u64> = None;

        for param in query.split('&') {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            let value = url_decode(value);

            match key {
                "xt" => {
                    if let Some(hash) = parse_btih(&value) {
                        info_hash = Some(hash);
                    }
                }
                "dn" => display_name = Some(value),
                "tr" => {
                    if !value.is_empty() {
                        trackers.push(value);
                    }
                }
                "xl" => exact_length = value.parse().ok(),
                _ => {}
            }
        }

        let info_hash = info_hash.ok_or_else(|| {
            EngineError::protocol(
                ProtocolErrorKind::InvalidMagnet,
                "missing or invalid 'xt' parameter (info hash)",
            )
        })?;

        Ok(MagnetUri {
            info_hash,
            display_name,
            trackers,
            exact_length,
        })
    }

    /// Get the info_hash as a hex string
    pub fn info_hash_hex(&self) -> String {
        self.info_hash.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Get display name or a default based on info_hash
    pub fn name(&self) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(|| self.info_hash_hex())
    }

    /// Check if this is a "trackerless" magnet (relies on DHT)
    pub fn is_trackerless(&self) -> bool {
        self.trackers.is_empty()
    }
}

/// Parse an info hash from an xt parameter.
///
/// Supports both hex (40 chars) and base32 (32 chars) formats.
fn parse_btih(xt: &str) -> Option<Sha1Hash> {
    let hash_str = xt.strip_prefix("urn:btih:")?;

    match hash_str.len() {
        40 => {
            let bytes: Vec<u8> = (0..40)
                .step_by(2)
                .filter_map(|i| u8::from_str_radix(&hash_str[i..i + 2], 16).ok())
                .collect();

            if bytes.len() == 20 {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(&bytes);
                Some(hash)
            } else {
                None
            }
        }
        32 => base32_decode(hash_str),
        _ => None,
    }
}

/// Decode base32 (RFC 4648) to a 20-byte hash
fn base32_decode(input: &str) -> Option<Sha1Hash> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

    let input = input.to_uppercase();
    let mut bits = 0u64;
    let mut bit_count = 0u32;
    let mut output = Vec::with_capacity(20);

    for &c in input.as_bytes() {
        let val = ALPHABET.iter().position(|&x| x == c)? as u64;
        bits = (bits << 5) | val;
        bit_count += 5;

        while bit_count >= 8 {
            bit_count -= 8;
            output.push((bits >> bit_count) as u8);
            bits &= (1 << bit_count) - 1;
        }
    }

    if output.len() == 20 {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&output);
        Some(hash)
    } else {
        None
    }
}

/// URL-decode a query parameter value
fn url_decode(s: &str) -> String {
    let mut bytes = Vec::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '%' {
            let mut hex = String::with_capacity(2);
            for _ in 0..2 {
                match chars.peek() {
                    Some(&h) if h.is_ascii_hexdigit() => hex.push(chars.next().unwrap()),
                    _ => break,
                }
            }
            if hex.len() == 2 {
                if let Ok(byte) = u8::from_str_radix(&hex, 16) {
                    bytes.push(byte);
                    continue;
                }
            }
            bytes.push(b'%');
            bytes.extend(hex.as_bytes());
        } else if c == '+' {
            bytes.push(b' ');
        } else {
            let mut buf = [0u8; 4];
            bytes.extend(c.encode_utf8(&mut buf).as_bytes());
        }
    }

    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_basic_magnet() {
        let uri = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567";
        let magnet = MagnetUri::parse(uri).unwrap();

        assert_eq!(
            magnet.info_hash_hex(),
            "0123456789abcdef0123456789abcdef01234567"
        );
        assert!(magnet.display_name.is_none());
        assert!(magnet.is_trackerless());
    }

    #[test]
    fn parse_full_magnet() {
        let uri = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567\
                   &dn=Test+File\
                   &tr=http%3A%2F%2Ftracker.example.com%2Fannounce\
                   &tr=udp%3A%2F%2Ftracker2.example.com%3A6969\
                   &xl=1234";

        let magnet = MagnetUri::parse(uri).unwrap();

        assert_eq!(magnet.display_name, Some("Test File".to_string()));
        assert_eq!(magnet.trackers.len(), 2);
        assert_eq!(magnet.trackers[0], "http://tracker.example.com/announce");
        assert_eq!(magnet.trackers[1], "udp://tracker2.example.com:6969");
        assert_eq!(magnet.exact_length, Some(1234));
    }

    #[test]
    fn parse_base32_hash() {
        let uri = "magnet:?xt=urn:btih:AAAQEAYEAUDAOCAJBIFQYDIOB4IBCEQT";
        let magnet = MagnetUri::parse(uri).unwrap();
        assert_eq!(magnet.info_hash.len(), 20);
    }

    #[test]
    fn invalid_magnets_are_rejected() {
        assert!(MagnetUri::parse("http://example.com").is_err());
        assert!(MagnetUri::parse("magnet:?dn=Test").is_err());
        assert!(MagnetUri::parse("magnet:?xt=urn:btih:invalid").is_err());
    }

    #[test]
    fn name_falls_back_to_hash() {
        let uri = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567";
        let magnet = MagnetUri::parse(uri).unwrap();
        assert_eq!(magnet.name(), magnet.info_hash_hex());
    }
}
