//! Swarm engine facade
//!
//! [`SwarmEngine`] owns every torrent session, hands out the event bus and
//! routes front-end operations to sessions. Sessions are fully isolated
//! from each other: each gets its own connect pool, DHT loop and piece
//! tables, so several swarms coexist in one process without cross-talk.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::SwarmEvent;
use crate::torrent::{MagnetUri, Metainfo, SwarmSession};
use crate::types::{ProgressSnapshot, SessionState, SwarmStats, TorrentId};

/// Multi-torrent swarm engine
pub struct SwarmEngine {
    config: EngineConfig,
    sessions: RwLock<HashMap<TorrentId, Arc<SwarmSession>>>,
    event_tx: broadcast::Sender<SwarmEvent>,
}

impl SwarmEngine {
    /// Create an engine; no background work starts until a torrent is added.
    pub fn new(config: EngineConfig) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(16));
        Arc::new(Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            event_tx,
        })
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<SwarmEvent> {
        self.event_tx.subscribe()
    }

    /// Add a torrent from .torrent file bytes and start it.
    pub async fn add_torrent(&self, torrent_bytes: &[u8]) -> Result<TorrentId> {
        let metainfo = Metainfo::parse(torrent_bytes)?;
        self.ensure_new(&metainfo.info_hash)?;

        let id = TorrentId::new();
        let session = SwarmSession::from_metainfo(
            id,
            metainfo,
            self.config.download_dir.clone(),
            self.config.swarm.clone(),
            self.event_tx.clone(),
        )
        .await?;

        self.sessions.write().insert(id, Arc::clone(&session));
        let _ = self.event_tx.send(SwarmEvent::Added { id });
        session.start();
        Ok(id)
    }

    /// Add a torrent from a magnet URI and start it.
    pub async fn add_magnet(&self, uri: &str) -> Result<TorrentId> {
        let magnet = MagnetUri::parse(uri)?;
        self.ensure_new(&magnet.info_hash)?;

        let id = TorrentId::new();
        let session = SwarmSession::from_magnet(
            id,
            magnet,
            self.config.download_dir.clone(),
            self.config.swarm.clone(),
            self.event_tx.clone(),
        )?;

        self.sessions.write().insert(id, Arc::clone(&session));
        let _ = self.event_tx.send(SwarmEvent::Added { id });
        session.start();
        Ok(id)
    }

    fn ensure_new(&self, info_hash: &[u8; 20]) -> Result<()> {
        let sessions = self.sessions.read();
        if sessions.values().any(|s| s.info_hash() == info_hash) {
            return Err(EngineError::invalid_input(
                "torrent",
                "torrent already added",
            ));
        }
        Ok(())
    }

    /// Look up a running session
    pub fn session(&self, id: TorrentId) -> Option<Arc<SwarmSession>> {
        self.sessions.read().get(&id).cloned()
    }

    /// All session ids
    pub fn torrents(&self) -> Vec<TorrentId> {
        self.sessions.read().keys().copied().collect()
    }

    /// Current state of a session
    pub fn state(&self, id: TorrentId) -> Result<SessionState> {
        Ok(self.require(id)?.state())
    }

    /// Progress snapshot of a session
    pub fn progress(&self, id: TorrentId) -> Result<ProgressSnapshot> {
        Ok(self.require(id)?.progress())
    }

    /// Accumulated statistics of a session
    pub fn stats(&self, id: TorrentId) -> Result<SwarmStats> {
        Ok(self.require(id)?.stats())
    }

    /// Stop a torrent, leaving it in the engine
    pub async fn stop(&self, id: TorrentId) -> Result<()> {
        self.require(id)?.stop().await;
        Ok(())
    }

    /// Stop and remove a torrent
    pub async fn remove(&self, id: TorrentId) -> Result<()> {
        let session = self
            .sessions
            .write()
            .remove(&id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        session.stop().await;
        let _ = self.event_tx.send(SwarmEvent::Removed { id });
        Ok(())
    }

    /// Stop every session
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<SwarmSession>> =
            self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.stop().await;
        }
    }

    fn require(&self, id: TorrentId) -> Result<Arc<SwarmSession>> {
        self.session(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_magnet_registers_a_session() {
        let engine = SwarmEngine::new(EngineConfig {
            download_dir: std::env::temp_dir(),
            ..Default::default()
        });

        let mut events = engine.subscribe();
        let id = engine
            .add_magnet("magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=x")
            .await
            .unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            SwarmEvent::Added { .. }
        ));
        assert_eq!(engine.torrents(), vec![id]);
        assert_eq!(engine.state(id).unwrap(), SessionState::Metadata);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_infohash_is_rejected() {
        let engine = SwarmEngine::new(EngineConfig {
            download_dir: std::env::temp_dir(),
            ..Default::default()
        });

        let uri = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567";
        engine.add_magnet(uri).await.unwrap();
        assert!(engine.add_magnet(uri).await.is_err());

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_torrent_is_not_found() {
        let engine = SwarmEngine::new(EngineConfig::default());
        let id = TorrentId::new();
        assert!(matches!(
            engine.progress(id),
            Err(EngineError::NotFound(_))
        ));
        assert!(engine.remove(id).await.is_err());
    }
}
