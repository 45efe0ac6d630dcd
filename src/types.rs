//! Core engine types
//!
//! Identifiers, session states, and progress/statistics snapshots shared
//! between the engine facade and its consumers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a torrent session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TorrentId(Uuid);

impl TorrentId {
    /// Create a new random torrent ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TorrentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TorrentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Current state of a torrent session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum SessionState {
    /// Fetching metadata over the wire (magnet sessions)
    Metadata,
    /// Actively downloading pieces
    Downloading,
    /// All pieces verified and written
    Finished,
    /// Stopped by the user
    Stopped,
    /// Stopped with an unrecoverable error
    Error {
        kind: String,
        message: String,
        retryable: bool,
    },
}

impl SessionState {
    /// Check if the session is still doing work
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Metadata | Self::Downloading)
    }

    /// Check if the session reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Stopped | Self::Error { .. })
    }
}

/// Progress information for a torrent session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Total size in bytes (unknown until metadata is available)
    pub total_size: Option<u64>,
    /// Bytes verified and handed to storage
    pub completed_size: u64,
    /// Pieces verified and written
    pub pieces_have: u32,
    /// Total piece count (0 until metadata is available)
    pub pieces_total: u32,
    /// Current download speed in bytes/sec
    pub download_speed: u64,
    /// Smoothed average download speed in bytes/sec
    pub average_speed: u64,
    /// Number of connected peers
    pub connections: u32,
    /// Estimated time remaining in seconds
    pub eta_seconds: Option<u64>,
}

impl ProgressSnapshot {
    /// Calculate progress percentage (0.0 - 100.0)
    pub fn percentage(&self) -> f64 {
        match self.total_size {
            Some(total) if total > 0 => (self.completed_size as f64 / total as f64) * 100.0,
            _ => 0.0,
        }
    }
}

/// Accumulated swarm statistics
///
/// Counters are observability only; control flow reacts to them solely
/// through the retry budgets already applied at the peer level.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SwarmStats {
    /// Payload bytes accepted into piece buffers
    pub bytes_downloaded: u64,
    /// Payload bytes discarded as duplicates or late arrivals
    pub bytes_dropped: u64,
    /// Pieces that failed SHA-1 verification
    pub hash_failures: u64,
    /// Block requests that expired without a response
    pub request_timeouts: u64,
    /// Block requests explicitly rejected by peers
    pub request_rejects: u64,
    /// Per-state peer counts from the last scheduler sweep
    pub peers: PeerStateCounts,
}

/// Peer population broken down by connection state
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PeerStateCounts {
    pub new: u32,
    pub connecting: u32,
    pub connected: u32,
    pub ready: u32,
    pub downloading: u32,
    pub failed: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn torrent_id_is_unique_and_displayable() {
        let a = TorrentId::new();
        let b = TorrentId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 32);
    }

    #[test]
    fn session_state_classification() {
        assert!(SessionState::Metadata.is_active());
        assert!(SessionState::Downloading.is_active());
        assert!(SessionState::Finished.is_terminal());
        assert!(SessionState::Error {
            kind: "protocol".into(),
            message: "metadata hash mismatch".into(),
            retryable: false,
        }
        .is_terminal());
    }

    #[test]
    fn percentage_handles_unknown_total() {
        let snapshot = ProgressSnapshot::default();
        assert_eq!(snapshot.percentage(), 0.0);

        let snapshot = ProgressSnapshot {
            total_size: Some(200),
            completed_size: 50,
            ..Default::default()
        };
        assert_eq!(snapshot.percentage(), 25.0);
    }
}
