//! Bencode codec
//!
//! A small bencode parser/encoder that keeps raw byte access, which the
//! infohash computation needs (SHA-1 over the exact `info` dict bytes).
//!
//! Bencode format:
//! - Integers:   `i<number>e`        Example: `i42e`
//! - Strings:    `<length>:<data>`   Example: `4:spam`
//! - Lists:      `l<items>e`         Example: `l4:spami42ee`
//! - Dicts:      `d<pairs>e`         Example: `d3:cow3:moo4:spam4:eggse`

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{EngineError, ProtocolErrorKind, Result};

/// Maximum allowed length for a bencode string (100 MiB). Bounds memory
/// allocation from malicious torrents and DHT replies.
const MAX_STRING_LENGTH: usize = 100 * 1024 * 1024;

/// A bencode value
#[derive(Clone, PartialEq, Eq)]
pub enum BencodeValue {
    /// Integer value (can be negative)
    Integer(i64),
    /// Byte string (not necessarily valid UTF-8)
    Bytes(Vec<u8>),
    /// List of values
    List(Vec<BencodeValue>),
    /// Dictionary with byte string keys (sorted by key)
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl fmt::Debug for BencodeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(n) => write!(f, "Integer({})", n),
            Self::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) if s.len() <= 50 => write!(f, "Bytes(\"{}\")", s),
                _ => write!(f, "Bytes([{} bytes])", b.len()),
            },
            Self::List(l) => f.debug_tuple("List").field(l).finish(),
            Self::Dict(d) => {
                let readable: BTreeMap<String, &BencodeValue> = d
                    .iter()
                    .map(|(k, v)| (String::from_utf8_lossy(k).to_string(), v))
                    .collect();
                f.debug_tuple("Dict").field(&readable).finish()
            }
        }
    }
}

/// Result of parsing bencode, includes the remaining unparsed bytes
pub struct ParseResult<'a> {
    /// The parsed value
    pub value: BencodeValue,
    /// The remaining unparsed bytes
    pub remaining: &'a [u8],
}

fn parse_err(message: impl Into<String>) -> EngineError {
    EngineError::protocol(ProtocolErrorKind::BencodeParse, message)
}

impl BencodeValue {
    /// Parse bencode from bytes, returning the value and any trailing bytes.
    pub fn parse(data: &[u8]) -> Result<ParseResult<'_>> {
        match data.first() {
            None => Err(parse_err("empty input")),
            Some(b'i') => Self::parse_integer(data),
            Some(b'l') => Self::parse_list(data),
            Some(b'd') => Self::parse_dict(data),
            Some(b'0'..=b'9') => Self::parse_bytes(data),
            Some(&c) => Err(parse_err(format!(
                "invalid bencode type marker: {:?}",
                c as char
            ))),
        }
    }

    /// Parse a complete bencode value, rejecting trailing data.
    pub fn parse_exact(data: &[u8]) -> Result<Self> {
        let result = Self::parse(data)?;
        if !result.remaining.is_empty() {
            return Err(parse_err(format!(
                "trailing data: {} bytes",
                result.remaining.len()
            )));
        }
        Ok(result.value)
    }

    fn parse_integer(data: &[u8]) -> Result<ParseResult<'_>> {
        let end = data[1..]
            .iter()
            .position(|&c| c == b'e')
            .ok_or_else(|| parse_err("unterminated integer"))?
            + 1;

        let num_str = std::str::from_utf8(&data[1..end])
            .map_err(|_| parse_err("invalid integer encoding"))?;

        // Canonical form: no leading zeros, no negative zero.
        if (num_str.len() > 1 && num_str.starts_with('0'))
            || num_str == "-0"
            || (num_str.starts_with("-0") && num_str.len() > 2)
        {
            return Err(parse_err(format!("non-canonical integer: {}", num_str)));
        }

        let value = num_str
            .parse::<i64>()
            .map_err(|_| parse_err("integer parse error"))?;

        Ok(ParseResult {
            value: BencodeValue::Integer(value),
            remaining: &data[end + 1..],
        })
    }

    fn parse_bytes(data: &[u8]) -> Result<ParseResult<'_>> {
        let colon = data
            .iter()
            .position(|&c| c == b':')
            .ok_or_else(|| parse_err("expected colon in string"))?;

        let len = std::str::from_utf8(&data[..colon])
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| parse_err("invalid string length"))?;

        if len > MAX_STRING_LENGTH {
            return Err(parse_err(format!(
                "string length {} exceeds maximum {}",
                len, MAX_STRING_LENGTH
            )));
        }

        let start = colon + 1;
        let end = start + len;
        if end > data.len() {
            return Err(parse_err(format!(
                "string length {} exceeds available data {}",
                len,
                data.len() - start
            )));
        }

        Ok(ParseResult {
            value: BencodeValue::Bytes(data[start..end].to_vec()),
            remaining: &data[end..],
        })
    }

    fn parse_list(data: &[u8]) -> Result<ParseResult<'_>> {
        let mut items = Vec::new();
        let mut remaining = &data[1..];

        while !remaining.is_empty() && remaining[0] != b'e' {
            let result = Self::parse(remaining)?;
            items.push(result.value);
            remaining = result.remaining;
        }

        if remaining.is_empty() {
            return Err(parse_err("unterminated list"));
        }

        Ok(ParseResult {
            value: BencodeValue::List(items),
            remaining: &remaining[1..],
        })
    }

    fn parse_dict(data: &[u8]) -> Result<ParseResult<'_>> {
        let mut items = BTreeMap::new();
        let mut remaining = &data[1..];
        let mut last_key: Option<Vec<u8>> = None;

        while !remaining.is_empty() && remaining[0] != b'e' {
            let key_result = Self::parse_bytes(remaining)?;
            let key = match key_result.value {
                BencodeValue::Bytes(k) => k,
                _ => return Err(parse_err("dict key must be a string")),
            };

            // Keys must arrive in sorted order (canonical encoding).
            if let Some(ref lk) = last_key {
                if &key <= lk {
                    return Err(parse_err("dict keys not in sorted order"));
                }
            }
            last_key = Some(key.clone());
            remaining = key_result.remaining;

            let value_result = Self::parse(remaining)?;
            items.insert(key, value_result.value);
            remaining = value_result.remaining;
        }

        if remaining.is_empty() {
            return Err(parse_err("unterminated dict"));
        }

        Ok(ParseResult {
            value: BencodeValue::Dict(items),
            remaining: &remaining[1..],
        })
    }

    /// Encode to bencode bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_to(&mut buf);
        buf
    }

    /// Encode to an existing buffer
    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Integer(n) => {
                buf.push(b'i');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.push(b'e');
            }
            Self::Bytes(b) => {
                buf.extend_from_slice(b.len().to_string().as_bytes());
                buf.push(b':');
                buf.extend_from_slice(b);
            }
            Self::List(l) => {
                buf.push(b'l');
                for item in l {
                    item.encode_to(buf);
                }
                buf.push(b'e');
            }
            Self::Dict(d) => {
                buf.push(b'd');
                for (k, v) in d {
                    buf.extend_from_slice(k.len().to_string().as_bytes());
                    buf.push(b':');
                    buf.extend_from_slice(k);
                    v.encode_to(buf);
                }
                buf.push(b'e');
            }
        }
    }

    // Accessor methods

    /// Get as string (UTF-8)
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Self::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Get as integer
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Get as unsigned integer
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Self::Integer(n) if *n >= 0 => Some(*n as u64),
            _ => None,
        }
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Get as list
    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    /// Get as dict
    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            Self::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Get dict value by key
    pub fn get(&self, key: &str) -> Option<&BencodeValue> {
        match self {
            Self::Dict(d) => d.get(key.as_bytes()),
            _ => None,
        }
    }
}

/// Find the raw bytes of the "info" dictionary in a torrent file.
///
/// The infohash is the SHA-1 of these exact bytes, so they are located by
/// walking the top-level dict entries positionally rather than re-encoding.
pub fn find_info_dict_bytes(data: &[u8]) -> Result<&[u8]> {
    if data.first() != Some(&b'd') {
        return Err(EngineError::protocol(
            ProtocolErrorKind::InvalidTorrent,
            "root is not a dict",
        ));
    }

    let mut remaining = &data[1..];
    while !remaining.is_empty() && remaining[0] != b'e' {
        let key_result = BencodeValue::parse(remaining)?;
        let is_info = matches!(&key_result.value, BencodeValue::Bytes(k) if k == b"info");
        let value_start = key_result.remaining;

        let value_result = BencodeValue::parse(value_start)?;
        if is_info {
            let len = value_start.len() - value_result.remaining.len();
            return Ok(&value_start[..len]);
        }
        remaining = value_result.remaining;
    }

    Err(EngineError::protocol(
        ProtocolErrorKind::InvalidTorrent,
        "missing 'info' key",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_integers() {
        let result = BencodeValue::parse(b"i42e").unwrap();
        assert_eq!(result.value, BencodeValue::Integer(42));
        assert!(result.remaining.is_empty());

        assert_eq!(
            BencodeValue::parse(b"i-42e").unwrap().value,
            BencodeValue::Integer(-42)
        );
        assert_eq!(
            BencodeValue::parse(b"i0e").unwrap().value,
            BencodeValue::Integer(0)
        );

        // Non-canonical forms are rejected.
        assert!(BencodeValue::parse(b"i03e").is_err());
        assert!(BencodeValue::parse(b"i-0e").is_err());
    }

    #[test]
    fn parse_byte_strings() {
        let result = BencodeValue::parse(b"4:spam").unwrap();
        assert_eq!(result.value, BencodeValue::Bytes(b"spam".to_vec()));

        assert_eq!(
            BencodeValue::parse(b"0:").unwrap().value,
            BencodeValue::Bytes(vec![])
        );

        let result = BencodeValue::parse(b"5:\x00\x01\x02\x03\x04").unwrap();
        assert_eq!(result.value, BencodeValue::Bytes(vec![0, 1, 2, 3, 4]));

        // Declared length past the end of input.
        assert!(BencodeValue::parse(b"9:ab").is_err());
    }

    #[test]
    fn parse_lists_and_dicts() {
        let result = BencodeValue::parse(b"l4:spami42ee").unwrap();
        let items = result.value.as_list().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1], BencodeValue::Integer(42));

        let result = BencodeValue::parse(b"d3:cow3:moo4:spam4:eggse").unwrap();
        assert_eq!(
            result.value.get("cow"),
            Some(&BencodeValue::Bytes(b"moo".to_vec()))
        );

        // Unsorted keys violate canonical form.
        assert!(BencodeValue::parse(b"d4:spam4:eggs3:cow3:mooe").is_err());

        // Unterminated containers.
        assert!(BencodeValue::parse(b"l4:spam").is_err());
        assert!(BencodeValue::parse(b"d3:cow3:moo").is_err());
    }

    #[test]
    fn encode_round_trip() {
        let original = b"d5:itemsli1ei2ei3ee4:name4:test5:valuei42ee";
        let value = BencodeValue::parse_exact(original).unwrap();
        assert_eq!(value.encode(), original.to_vec());

        assert_eq!(value.get("name").and_then(|v| v.as_string()), Some("test"));
        assert_eq!(value.get("value").and_then(|v| v.as_int()), Some(42));
    }

    #[test]
    fn info_dict_bytes_are_exact() {
        let data = b"d8:announce3:url4:infod6:lengthi100e4:name1:ae5:other1:xe";
        let info = find_info_dict_bytes(data).unwrap();
        assert_eq!(info, b"d6:lengthi100e4:name1:ae");

        assert!(find_info_dict_bytes(b"d8:announce3:urle").is_err());
    }

    #[test]
    fn info_key_inside_nested_value_is_not_matched() {
        // A value that contains the bytes "4:info" must not confuse the
        // locator; only the top-level key counts.
        let data = b"d1:a6:4:info4:infod6:lengthi1e4:name1:bee";
        let info = find_info_dict_bytes(data).unwrap();
        assert_eq!(info, b"d6:lengthi1e4:name1:be");
    }
}
