//! Bounded map of peer connection records for one call

use super::record::{CloseHandle, PeerConnectionRecord};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

/// Registry entry: the record plus what is needed without locking it
#[derive(Clone)]
pub struct PeerSlot {
    pub record: Arc<Mutex<PeerConnectionRecord>>,
    pub closer: CloseHandle,
    pub connection_id: String,
}

impl std::fmt::Debug for PeerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSlot")
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}

impl PeerSlot {
    pub fn new(record: PeerConnectionRecord) -> Self {
        let closer = record.close_handle();
        let connection_id = record.connection_id().to_string();
        Self {
            record: Arc::new(Mutex::new(record)),
            closer,
            connection_id,
        }
    }
}

/// Peers of the active call in a mesh topology
///
/// The map lock is only held for lookups and inserts; per-peer work happens
/// under each record's own mutex.
pub struct PeerRegistry {
    peers: RwLock<HashMap<String, PeerSlot>>,
    max_peers: usize,
}

impl PeerRegistry {
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            max_peers,
        }
    }

    pub fn max_peers(&self) -> usize {
        self.max_peers
    }

    /// Insert a slot unless the peer already has one
    ///
    /// Returns the slot now registered for the peer and whether it is the
    /// one passed in. Fails when the mesh is full.
    pub async fn insert_if_absent(&self, peer_id: &str, slot: PeerSlot) -> Result<(PeerSlot, bool)> {
        let mut peers = self.peers.write().await;

        if let Some(existing) = peers.get(peer_id) {
            return Ok((existing.clone(), false));
        }

        if peers.len() >= self.max_peers {
            return Err(Error::MaxPeersReached(self.max_peers));
        }

        info!("Adding peer to registry: {}", peer_id);
        peers.insert(peer_id.to_string(), slot.clone());
        Ok((slot, true))
    }

    /// Swap in a new slot for a peer, returning the old one
    pub async fn replace(&self, peer_id: &str, slot: PeerSlot) -> Option<PeerSlot> {
        self.peers.write().await.insert(peer_id.to_string(), slot)
    }

    pub async fn get(&self, peer_id: &str) -> Result<PeerSlot> {
        self.try_get(peer_id)
            .await
            .ok_or_else(|| Error::UnknownPeer(peer_id.to_string()))
    }

    pub async fn try_get(&self, peer_id: &str) -> Option<PeerSlot> {
        self.peers.read().await.get(peer_id).cloned()
    }

    pub async fn remove(&self, peer_id: &str) -> Option<PeerSlot> {
        let removed = self.peers.write().await.remove(peer_id);
        if removed.is_some() {
            info!("Removing peer from registry: {}", peer_id);
        }
        removed
    }

    /// Remove and return every slot
    pub async fn drain_all(&self) -> Vec<(String, PeerSlot)> {
        self.peers.write().await.drain().collect()
    }

    /// Peer ids in sorted order
    pub async fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.peers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn slots(&self) -> Vec<(String, PeerSlot)> {
        let mut slots: Vec<_> = self
            .peers
            .read()
            .await
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();
        slots.sort_by(|a, b| a.0.cmp(&b.0));
        slots
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    pub async fn contains(&self, peer_id: &str) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }
}
