//! In-memory connector that records every submitted op.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use skyway_shared::error::NegotiationError;
use skyway_shared::types::{ConnectionId, PeerId};

use crate::connection::{ConnectionConfig, PeerConnection, PeerConnector, PeerOp};

#[derive(Debug, Clone, PartialEq)]
pub struct OpRecord {
    pub peer: PeerId,
    pub connection: ConnectionId,
    pub op: PeerOp,
}

#[derive(Debug, Default)]
struct Shared {
    ops: Vec<OpRecord>,
    opened: Vec<(PeerId, ConnectionId)>,
    refuse: HashSet<PeerId>,
}

#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    shared: Arc<Mutex<Shared>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `open` fail for `peer`
    pub fn refuse(&self, peer: PeerId) {
        self.lock().refuse.insert(peer);
    }

    /// Drain the recorded ops
    pub fn take_ops(&self) -> Vec<OpRecord> {
        std::mem::take(&mut self.lock().ops)
    }

    pub fn opened(&self) -> Vec<(PeerId, ConnectionId)> {
        self.lock().opened.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
pub struct MockConnection {
    peer: PeerId,
    id: ConnectionId,
    shared: Arc<Mutex<Shared>>,
}

impl PeerConnection for MockConnection {
    fn execute(&self, op: PeerOp) {
        let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        shared.ops.push(OpRecord {
            peer: self.peer.clone(),
            connection: self.id,
            op,
        });
    }
}

impl PeerConnector for MockConnector {
    type Connection = MockConnection;

    fn open(
        &mut self,
        peer: &PeerId,
        id: ConnectionId,
        _config: &ConnectionConfig,
    ) -> Result<MockConnection, NegotiationError> {
        let mut shared = self.lock();
        if shared.refuse.contains(peer) {
            return Err(NegotiationError::PeerConnection(format!("refused {peer}")));
        }
        shared.opened.push((peer.clone(), id));
        Ok(MockConnection {
            peer: peer.clone(),
            id,
            shared: Arc::clone(&self.shared),
        })
    }
}
