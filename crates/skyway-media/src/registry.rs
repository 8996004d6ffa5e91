//! Per-peer connection entries, one per remote peer id.

use std::collections::HashMap;

use skyway_shared::types::{ConnectionId, IceConnectionState, PeerId, PeerState, Role, SignalingState};
use tracing::debug;

/// Registry record for one remote participant.
#[derive(Debug)]
pub struct PeerEntry<H> {
    pub id: PeerId,
    /// `None` while the record is pending (created on `enter`)
    pub connection: Option<H>,
    pub generation: Option<ConnectionId>,
    pub role: Role,
    pub state: PeerState,
    pub ice_state: IceConnectionState,
    pub signaling_state: SignalingState,
    pub channels: Vec<String>,
    /// Set after a negotiation failure; no further handshake steps run
    pub inert: bool,
    pub gathering_done: bool,
}

impl<H> PeerEntry<H> {
    pub fn pending(id: PeerId, role: Role) -> Self {
        Self {
            id,
            connection: None,
            generation: None,
            role,
            state: PeerState::Unknown,
            ice_state: IceConnectionState::New,
            signaling_state: SignalingState::Stable,
            channels: Vec::new(),
            inert: false,
            gathering_done: false,
        }
    }

    pub fn negotiating(id: PeerId, connection: H, generation: ConnectionId, role: Role) -> Self {
        Self {
            connection: Some(connection),
            generation: Some(generation),
            state: PeerState::Negotiating(role),
            ..Self::pending(id, role)
        }
    }

    pub fn is_pending(&self) -> bool {
        self.connection.is_none()
    }

    /// The live connection if `generation` still refers to it
    pub fn connection_for(&self, generation: ConnectionId) -> Option<&H> {
        match self.generation {
            Some(current) if current == generation => self.connection.as_ref(),
            _ => None,
        }
    }

    pub fn track_channel(&mut self, label: &str) {
        if !self.channels.iter().any(|l| l == label) {
            self.channels.push(label.to_string());
        }
    }

    pub fn forget_channel(&mut self, label: &str) {
        self.channels.retain(|l| l != label);
    }
}

/// Peers of the current room, at most one entry per id.
#[derive(Debug)]
pub struct PeerRegistry<H> {
    peers: HashMap<PeerId, PeerEntry<H>>,
}

impl<H> Default for PeerRegistry<H> {
    fn default() -> Self {
        Self {
            peers: HashMap::new(),
        }
    }
}

impl<H> PeerRegistry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `entry.id`. The replaced entry is
    /// returned so its connection can be closed.
    pub fn upsert(&mut self, entry: PeerEntry<H>) -> Option<PeerEntry<H>> {
        let replaced = self.peers.insert(entry.id.clone(), entry);
        if let Some(old) = &replaced {
            debug!(peer = %old.id.short(), "Replaced peer entry");
        }
        replaced
    }

    pub fn remove(&mut self, id: &PeerId) -> Option<PeerEntry<H>> {
        let removed = self.peers.remove(id);
        if removed.is_some() {
            debug!(peer = %id.short(), "Removed peer entry");
        }
        removed
    }

    pub fn get(&self, id: &PeerId) -> Option<&PeerEntry<H>> {
        self.peers.get(id)
    }

    pub fn get_mut(&mut self, id: &PeerId) -> Option<&mut PeerEntry<H>> {
        self.peers.get_mut(id)
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Sorted snapshot of the current ids
    pub fn ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Visit every entry present when the call started. Entries removed by
    /// an earlier visit are skipped.
    pub fn for_each<F>(&mut self, mut f: F)
    where
        F: FnMut(&mut PeerEntry<H>),
    {
        for id in self.ids() {
            if let Some(entry) = self.peers.get_mut(&id) {
                f(entry);
            }
        }
    }

    pub fn connected_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self
            .peers
            .values()
            .filter(|p| p.state == PeerState::Connected)
            .map(|p| p.id.clone())
            .collect();
        ids.sort();
        ids
    }
}
