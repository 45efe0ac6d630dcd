//! # riptide
//!
//! A leech-only BitTorrent swarm engine.
//!
//! ## Features
//!
//! - **Peer wire protocol**: BEP 3 with the fast extension (BEP 6) and the
//!   extension protocol (BEP 10)
//! - **Magnet links**: metadata fetched over the wire (BEP 9) and verified
//!   against the infohash before use
//! - **DHT**: trackerless peer discovery over KRPC (BEP 5)
//! - **Streaming reads**: priority windows that pull pieces ahead of a
//!   sequential consumer
//! - **Async**: built on Tokio; one task per peer, no blocking in the
//!   scheduler loop
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use riptide::{SwarmEngine, EngineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = SwarmEngine::new(EngineConfig::default());
//!
//!     let id = engine.add_magnet("magnet:?xt=urn:btih:...").await?;
//!
//!     let mut events = engine.subscribe();
//!     while let Ok(event) = events.recv().await {
//!         println!("Event: {:?}", event);
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod bitfield;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod storage;
pub mod torrent;
pub mod types;

pub use bitfield::Bitfield;
pub use config::{DhtConfig, EngineConfig, SwarmConfig};
pub use engine::SwarmEngine;
pub use error::{EngineError, NetworkErrorKind, ProtocolErrorKind, Result, StorageErrorKind};
pub use events::SwarmEvent;
pub use storage::PartFile;
pub use types::{ProgressSnapshot, SessionState, SwarmStats, TorrentId};

pub use torrent::{
    DhtDiscovery, DistanceMetric, MagnetUri, MetadataFetcher, Metainfo, PeerMessage, PeerState,
    PieceStore, SwarmSession, TrackerClient, BLOCK_SIZE,
};
