use std::collections::{BTreeMap, HashMap};

use taskmesh_types::PeerId;

/// Fair round-robin set of candidate workers.
///
/// Peers are ordered by an insertion sequence number; `dequeue` hands out the
/// lowest sequence and re-inserts that peer with a fresh one, so the peer
/// moves to the back. Insertion order is the only fairness criterion.
#[derive(Debug, Default, Clone)]
pub struct PeerQueue {
    order: BTreeMap<u64, PeerId>,
    positions: HashMap<PeerId, u64>,
    next_seq: u64,
}

impl PeerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a peer at the back. No-op (returns `false`) if already present.
    pub fn add_peer(&mut self, id: PeerId) -> bool {
        if self.positions.contains_key(&id) {
            return false;
        }
        self.push_back(id);
        true
    }

    /// Take the peer at the front and rotate it to the back.
    /// `None` when the queue is empty; callers defer dispatch.
    pub fn dequeue(&mut self) -> Option<PeerId> {
        let (_, peer) = self.order.pop_first()?;
        self.positions.remove(&peer);
        self.push_back(peer.clone());
        Some(peer)
    }

    /// Remove a peer (banned or disconnected). Returns whether it was present.
    pub fn remove(&mut self, id: &PeerId) -> bool {
        match self.positions.remove(id) {
            Some(seq) => {
                self.order.remove(&seq);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.positions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Peers in the order they will be handed out.
    pub fn peers(&self) -> Vec<PeerId> {
        self.order.values().cloned().collect()
    }

    fn push_back(&mut self, id: PeerId) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.positions.insert(id.clone(), seq);
        self.order.insert(seq, id);
    }
}
