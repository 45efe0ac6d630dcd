//! Swarm events
//!
//! Push notifications emitted by the engine. Front-ends subscribe through
//! [`crate::SwarmEngine::subscribe`] and never poll internal state.

use serde::{Deserialize, Serialize};

use crate::types::{ProgressSnapshot, SessionState, SwarmStats, TorrentId};

/// Events emitted by the swarm engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SwarmEvent {
    /// Torrent was added
    Added { id: TorrentId },
    /// Torrent started its control loop
    Started { id: TorrentId },
    /// Metadata for a magnet session was assembled and verified
    MetadataReceived { id: TorrentId, name: String },
    /// State changed
    StateChanged {
        id: TorrentId,
        old_state: SessionState,
        new_state: SessionState,
    },
    /// Periodic statistics update
    StatsUpdated {
        id: TorrentId,
        progress: ProgressSnapshot,
        stats: SwarmStats,
    },
    /// A focus region finished downloading
    FocusDone { id: TorrentId, focus_id: u64 },
    /// All pieces verified and the final file materialized
    Completed { id: TorrentId },
    /// Session stopped with an error
    Failed {
        id: TorrentId,
        error: String,
        retryable: bool,
    },
    /// Torrent was removed
    Removed { id: TorrentId },
}
