//! Engine configuration
//!
//! This module contains all configuration options for the swarm engine.
//! Every timeout in the concurrency model is an independent knob.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the swarm engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory to save downloads
    pub download_dir: PathBuf,

    /// Capacity of the event broadcast channel
    pub event_capacity: usize,

    /// Swarm configuration shared by all torrents
    pub swarm: SwarmConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("."),
            event_capacity: 256,
            swarm: SwarmConfig::default(),
        }
    }
}

/// Per-swarm configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmConfig {
    /// Maximum number of connected peers per torrent
    pub max_peers: usize,

    /// Concurrent connect+handshake slots in the worker pool
    pub connect_slots: usize,

    /// Port advertised to trackers and the DHT
    pub listen_port: u16,

    /// TCP connect timeout
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Handshake exchange timeout
    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,

    /// Outstanding block request timeout (normal requests)
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,

    /// Outstanding block request timeout (aggressive/focus requests)
    #[serde(with = "duration_secs")]
    pub aggressive_request_timeout: Duration,

    /// Metadata piece request timeout (BEP 9)
    #[serde(with = "duration_secs")]
    pub metadata_request_timeout: Duration,

    /// Maximum outstanding block requests per peer (batch size)
    pub requests_per_peer: usize,

    /// Expired requests tolerated before a peer is disconnected
    pub retry_budget: u32,

    /// Expired aggressive requests tolerated before disconnect
    pub aggressive_retry_budget: u32,

    /// Outstanding metadata requests across the whole swarm
    pub metadata_request_budget: u32,

    /// Remaining-block count at which endgame mode starts
    pub endgame_block_threshold: u64,

    /// Keep-alive interval for idle connections
    #[serde(with = "duration_secs")]
    pub keepalive_interval: Duration,

    /// Scheduler dispatch sub-tick in milliseconds
    pub dispatch_interval_ms: u64,

    /// Timeout sweep interval in milliseconds
    pub sweep_interval_ms: u64,

    /// Statistics window in seconds
    pub stats_interval_secs: u64,

    /// Re-announce when the known-peer count falls below this
    pub peer_low_water: usize,

    /// Peers requested per tracker announce
    pub tracker_numwant: u32,

    /// Tracker re-announce interval (0 = honour the tracker's)
    pub announce_interval_secs: u64,

    /// DHT discovery configuration
    pub dht: DhtConfig,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            max_peers: 50,
            connect_slots: 10,
            listen_port: 6881,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_secs(30),
            aggressive_request_timeout: Duration::from_secs(8),
            metadata_request_timeout: Duration::from_secs(20),
            requests_per_peer: 16,
            retry_budget: 8,
            aggressive_retry_budget: 3,
            metadata_request_budget: 4,
            endgame_block_threshold: 64,
            keepalive_interval: Duration::from_secs(120),
            dispatch_interval_ms: 250,
            sweep_interval_ms: 1000,
            stats_interval_secs: 2,
            peer_low_water: 10,
            tracker_numwant: 50,
            announce_interval_secs: 0,
            dht: DhtConfig::default(),
        }
    }
}

/// DHT discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhtConfig {
    /// Enable DHT peer discovery
    pub enabled: bool,

    /// Bootstrap node addresses
    pub bootstrap_nodes: Vec<String>,

    /// Nodes queried in parallel per lookup round
    pub query_parallelism: usize,

    /// Per-query UDP response timeout
    #[serde(with = "duration_secs")]
    pub query_timeout: Duration,

    /// Lookup rounds between distance-metric flips (0 = never flip)
    pub metric_flip: u32,

    /// Lookup rounds before the node table is cleared and reseeded
    pub max_rounds_per_seed: u32,

    /// Pause between lookup rounds
    #[serde(with = "duration_secs")]
    pub round_interval: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bootstrap_nodes: vec![
                "router.bittorrent.com:6881".to_string(),
                "router.utorrent.com:6881".to_string(),
                "dht.transmissionbt.com:6881".to_string(),
                "dht.aelitis.com:6881".to_string(),
            ],
            query_parallelism: 8,
            query_timeout: Duration::from_secs(4),
            metric_flip: 4,
            max_rounds_per_seed: 32,
            round_interval: Duration::from_secs(1),
        }
    }
}

/// Serialize Durations as whole seconds for config files.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sane() {
        let config = SwarmConfig::default();
        assert!(config.max_peers > 0);
        assert!(config.connect_slots <= config.max_peers);
        assert!(config.aggressive_request_timeout < config.request_timeout);
        assert!(!config.dht.bootstrap_nodes.is_empty());
    }

}
