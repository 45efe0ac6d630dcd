//! Tracker announce client
//!
//! HTTP(S) announces (BEP 3, compact responses) and the UDP
//! connect/announce two-step (BEP 15). The swarm only consumes the peer
//! list and the re-announce interval; everything else about the exchange
//! stays inside this module.

use std::net::SocketAddr;
use std::time::Duration;

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use super::bencode::BencodeValue;
use super::metainfo::Sha1Hash;
use super::pex::parse_compact_peers_v4;
use crate::error::{EngineError, NetworkErrorKind, ProtocolErrorKind, Result};

/// Default timeout for tracker requests
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Magic constant opening every UDP tracker exchange
const UDP_PROTOCOL_ID: i64 = 0x41727101980;

/// Announce interval clamp: keeps a hostile tracker from demanding spam
/// announces or parking us for hours.
const MIN_ANNOUNCE_INTERVAL: u32 = 60;
const MAX_ANNOUNCE_INTERVAL: u32 = 3600;

/// Announce event type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    None,
    Started,
    Stopped,
    Completed,
}

impl AnnounceEvent {
    fn to_http_string(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
        }
    }

    fn to_udp_id(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Completed => 1,
            Self::Started => 2,
            Self::Stopped => 3,
        }
    }
}

/// Announce request parameters
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: Sha1Hash,
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
    pub numwant: u32,
}

/// Announce response from a tracker
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    /// Seconds until the next announce
    pub interval: u32,
    /// Seeder count, when reported
    pub seeders: Option<u32>,
    /// Leecher count, when reported
    pub leechers: Option<u32>,
    /// Batch of candidate peers
    pub peers: Vec<SocketAddr>,
}

/// Tracker client for HTTP and UDP trackers
pub struct TrackerClient {
    http_client: reqwest::Client,
    peer_id: [u8; 20],
    timeout: Duration,
}

impl TrackerClient {
    /// Create a new tracker client with a random peer ID
    pub fn new() -> Result<Self> {
        Self::with_peer_id(generate_peer_id())
    }

    /// Create a tracker client with a specific peer ID
    pub fn with_peer_id(peer_id: [u8; 20]) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| {
                EngineError::network(
                    NetworkErrorKind::Other,
                    format!("failed to create HTTP client: {}", e),
                )
            })?;

        Ok(Self {
            http_client,
            peer_id,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn peer_id(&self) -> &[u8; 20] {
        &self.peer_id
    }

    /// Announce to a tracker, auto-detecting HTTP vs UDP
    pub async fn announce(
        &self,
        tracker_url: &str,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse> {
        if tracker_url.starts_with("http://") || tracker_url.starts_with("https://") {
            self.announce_http(tracker_url, request).await
        } else if tracker_url.starts_with("udp://") {
            self.announce_udp(tracker_url, request).await
        } else {
            Err(EngineError::protocol(
                ProtocolErrorKind::TrackerError,
                format!("unsupported tracker protocol: {}", tracker_url),
            ))
        }
    }

    /// Announce to an HTTP tracker (BEP 3)
    pub async fn announce_http(
        &self,
        tracker_url: &str,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse> {
        let mut url = tracker_url.to_string();
        url.push(if url.contains('?') { '&' } else { '?' });

        url.push_str("info_hash=");
        for byte in &request.info_hash {
            url.push_str(&format!("%{:02X}", byte));
        }
        url.push_str("&peer_id=");
        for byte in &request.peer_id {
            url.push_str(&format!("%{:02X}", byte));
        }

        url.push_str(&format!("&port={}", request.port));
        url.push_str(&format!("&uploaded={}", request.uploaded));
        url.push_str(&format!("&downloaded={}", request.downloaded));
        url.push_str(&format!("&left={}", request.left));
        url.push_str("&compact=1");
        url.push_str(&format!("&numwant={}", request.numwant));

        let event_str = request.event.to_http_string();
        if !event_str.is_empty() {
            url.push_str(&format!("&event={}", event_str));
        }

        let response = self.http_client.get(&url).send().await.map_err(|e| {
            EngineError::network(
                NetworkErrorKind::Other,
                format!("tracker request failed: {}", e),
            )
        })?;

        if !response.status().is_success() {
            return Err(EngineError::protocol(
                ProtocolErrorKind::TrackerError,
                format!("tracker returned status: {}", response.status()),
            ));
        }

        let body = response.bytes().await.map_err(|e| {
            EngineError::network(
                NetworkErrorKind::Other,
                format!("failed to read tracker response: {}", e),
            )
        })?;

        parse_http_response(&body)
    }

    /// Announce to a UDP tracker (BEP 15)
    pub async fn announce_udp(
        &self,
        tracker_url: &str,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse> {
        let url = tracker_url.strip_prefix("udp://").ok_or_else(|| {
            EngineError::protocol(ProtocolErrorKind::TrackerError, "invalid UDP tracker URL")
        })?;
        let host_port = url.split('/').next().unwrap_or(url);

        let addr = tokio::net::lookup_host(host_port)
            .await
            .map_err(|e| {
                EngineError::network(
                    NetworkErrorKind::DnsResolution,
                    format!("failed to resolve tracker: {}", e),
                )
            })?
            .next()
            .ok_or_else(|| {
                EngineError::network(NetworkErrorKind::DnsResolution, "no addresses for tracker")
            })?;

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(addr).await.map_err(|e| {
            EngineError::network(
                NetworkErrorKind::ConnectionRefused,
                format!("failed to connect to tracker: {}", e),
            )
        })?;

        let connection_id = self.udp_connect(&socket).await?;
        self.udp_announce(&socket, connection_id, request).await
    }

    /// UDP connect step: establishes a connection id for the announce
    async fn udp_connect(&self, socket: &UdpSocket) -> Result<i64> {
        let transaction_id: i32 = rand::rng().random();

        let mut request = Vec::with_capacity(16);
        request.extend_from_slice(&UDP_PROTOCOL_ID.to_be_bytes());
        request.extend_from_slice(&0u32.to_be_bytes()); // action: connect
        request.extend_from_slice(&transaction_id.to_be_bytes());

        socket.send(&request).await.map_err(|e| {
            EngineError::network(NetworkErrorKind::Other, format!("UDP send failed: {}", e))
        })?;

        let mut response = [0u8; 16];
        let len = timeout(self.timeout, socket.recv(&mut response))
            .await
            .map_err(|_| {
                EngineError::network(NetworkErrorKind::Timeout, "UDP tracker connect timeout")
            })?
            .map_err(|e| {
                EngineError::network(NetworkErrorKind::Other, format!("UDP recv failed: {}", e))
            })?;

        if len < 16 {
            return Err(EngineError::protocol(
                ProtocolErrorKind::TrackerError,
                "UDP connect response too short",
            ));
        }

        let action = i32::from_be_bytes([response[0], response[1], response[2], response[3]]);
        let resp_transaction_id =
            i32::from_be_bytes([response[4], response[5], response[6], response[7]]);
        let connection_id = i64::from_be_bytes(response[8..16].try_into().unwrap());

        if action != 0 {
            return Err(EngineError::protocol(
                ProtocolErrorKind::TrackerError,
                format!("UDP connect error: action {}", action),
            ));
        }
        if resp_transaction_id != transaction_id {
            return Err(EngineError::protocol(
                ProtocolErrorKind::TrackerError,
                "UDP transaction ID mismatch",
            ));
        }

        Ok(connection_id)
    }

    /// UDP announce step
    async fn udp_announce(
        &self,
        socket: &UdpSocket,
        connection_id: i64,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse> {
        let transaction_id: i32 = rand::rng().random();

        // Fixed 98-byte announce request.
        let mut req = Vec::with_capacity(98);
        req.extend_from_slice(&connection_id.to_be_bytes());
        req.extend_from_slice(&1u32.to_be_bytes()); // action: announce
        req.extend_from_slice(&transaction_id.to_be_bytes());
        req.extend_from_slice(&request.info_hash);
        req.extend_from_slice(&request.peer_id);
        req.extend_from_slice(&request.downloaded.to_be_bytes());
        req.extend_from_slice(&request.left.to_be_bytes());
        req.extend_from_slice(&request.uploaded.to_be_bytes());
        req.extend_from_slice(&request.event.to_udp_id().to_be_bytes());
        req.extend_from_slice(&0u32.to_be_bytes()); // IP: default
        req.extend_from_slice(&0u32.to_be_bytes()); // key
        req.extend_from_slice(&request.numwant.to_be_bytes());
        req.extend_from_slice(&request.port.to_be_bytes());

        socket.send(&req).await.map_err(|e| {
            EngineError::network(
                NetworkErrorKind::Other,
                format!("UDP announce send failed: {}", e),
            )
        })?;

        // 20-byte header plus 6 bytes per peer; 4 KiB covers ~678 peers.
        let mut response = [0u8; 4096];
        let len = timeout(self.timeout, socket.recv(&mut response))
            .await
            .map_err(|_| {
                EngineError::network(NetworkErrorKind::Timeout, "UDP tracker announce timeout")
            })?
            .map_err(|e| {
                EngineError::network(NetworkErrorKind::Other, format!("UDP recv failed: {}", e))
            })?;

        if len < 8 {
            return Err(EngineError::protocol(
                ProtocolErrorKind::TrackerError,
                "UDP announce response too short",
            ));
        }

        let action = i32::from_be_bytes([response[0], response[1], response[2], response[3]]);
        let resp_transaction_id =
            i32::from_be_bytes([response[4], response[5], response[6], response[7]]);

        if action == 3 {
            let error_msg = if len > 8 {
                String::from_utf8_lossy(&response[8..len]).to_string()
            } else {
                String::from("(no message)")
            };
            return Err(EngineError::protocol(
                ProtocolErrorKind::TrackerError,
                format!("UDP tracker error: {}", error_msg),
            ));
        }
        if action != 1 {
            return Err(EngineError::protocol(
                ProtocolErrorKind::TrackerError,
                format!("UDP announce unexpected action: {}", action),
            ));
        }
        if len < 20 {
            return Err(EngineError::protocol(
                ProtocolErrorKind::TrackerError,
                "UDP announce response too short",
            ));
        }
        if resp_transaction_id != transaction_id {
            return Err(EngineError::protocol(
                ProtocolErrorKind::TrackerError,
                "UDP transaction ID mismatch",
            ));
        }

        let interval = u32::from_be_bytes([response[8], response[9], response[10], response[11]])
            .clamp(MIN_ANNOUNCE_INTERVAL, MAX_ANNOUNCE_INTERVAL);
        let leechers = u32::from_be_bytes([response[12], response[13], response[14], response[15]]);
        let seeders = u32::from_be_bytes([response[16], response[17], response[18], response[19]]);

        let peers = parse_compact_peers_v4(&response[20..len]);

        Ok(AnnounceResponse {
            interval,
            seeders: Some(seeders),
            leechers: Some(leechers),
            peers,
        })
    }
}

/// Parse a bencoded HTTP tracker response
fn parse_http_response(data: &[u8]) -> Result<AnnounceResponse> {
    let value = BencodeValue::parse_exact(data).map_err(|_| {
        EngineError::protocol(
            ProtocolErrorKind::TrackerError,
            "invalid tracker response encoding",
        )
    })?;

    if let Some(failure) = value.get("failure reason").and_then(|v| v.as_string()) {
        return Err(EngineError::protocol(
            ProtocolErrorKind::TrackerError,
            format!("tracker error: {}", failure),
        ));
    }

    let interval = value
        .get("interval")
        .and_then(|v| v.as_uint())
        .ok_or_else(|| {
            EngineError::protocol(
                ProtocolErrorKind::TrackerError,
                "missing 'interval' in tracker response",
            )
        })? as u32;
    let interval = interval.clamp(MIN_ANNOUNCE_INTERVAL, MAX_ANNOUNCE_INTERVAL);

    let seeders = value.get("complete").and_then(|v| v.as_uint()).map(|v| v as u32);
    let leechers = value
        .get("incomplete")
        .and_then(|v| v.as_uint())
        .map(|v| v as u32);

    let peers = match value.get("peers") {
        // Compact format: packed 6-byte entries.
        Some(BencodeValue::Bytes(data)) => {
            if !data.len().is_multiple_of(6) {
                return Err(EngineError::protocol(
                    ProtocolErrorKind::TrackerError,
                    "invalid compact peers length",
                ));
            }
            parse_compact_peers_v4(data)
        }

        // Dictionary format.
        Some(BencodeValue::List(list)) => {
            let mut peers = Vec::new();
            for item in list {
                let ip = item.get("ip").and_then(|v| v.as_string());
                let port = item.get("port").and_then(|v| v.as_uint());
                if let (Some(ip), Some(port)) = (ip, port) {
                    if let Ok(addr) = format!("{}:{}", ip, port).parse() {
                        peers.push(addr);
                    }
                }
            }
            peers
        }

        None => Vec::new(),

        _ => {
            return Err(EngineError::protocol(
                ProtocolErrorKind::TrackerError,
                "invalid peers format",
            ))
        }
    };

    Ok(AnnounceResponse {
        interval,
        seeders,
        leechers,
        peers,
    })
}

/// Generate a random peer ID in Azureus style: `-RT0001-` + 12 random bytes
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[0..8].copy_from_slice(b"-RT0001-");
    for byte in &mut peer_id[8..] {
        *byte = rand::rng().random_range(0x21..0x7F);
    }
    peer_id
}
