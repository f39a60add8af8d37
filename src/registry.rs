//! Module that keeps track of the peers currently in the group.

use crate::message::PeerId;
use std::collections::BTreeMap;

/// Handle used to reach one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHandle {
    pub id: PeerId,
    pub address: String,
}

/// Live peers of the group, excluding the local one.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: BTreeMap<PeerId, String>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Function that inserts (or re-addresses) a peer. Returns `true` if the peer is new.
    pub fn insert(&mut self, id: PeerId, address: impl Into<String>) -> bool {
        self.peers.insert(id, address.into()).is_none()
    }

    /// Function that drops a peer. Returns `true` if the peer was known.
    pub fn remove(&mut self, id: PeerId) -> bool {
        self.peers.remove(&id).is_some()
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Ids of all known peers, in increasing order.
    pub fn list_peers(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    pub fn peer(&self, id: PeerId) -> Option<PeerHandle> {
        self.peers.get(&id).map(|address| PeerHandle {
            id,
            address: address.clone(),
        })
    }

    /// Handles of all known peers, in increasing id order.
    pub fn handles(&self) -> Vec<PeerHandle> {
        self.peers
            .iter()
            .map(|(id, address)| PeerHandle {
                id: *id,
                address: address.clone(),
            })
            .collect()
    }

    /// The known peer with the lowest id.
    pub fn lowest(&self) -> Option<PeerHandle> {
        self.peers.keys().next().and_then(|id| self.peer(*id))
    }
}

impl FromIterator<(PeerId, String)> for PeerRegistry {
    fn from_iter<T: IntoIterator<Item = (PeerId, String)>>(iter: T) -> Self {
        Self {
            peers: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_remove() {
        let mut registry = PeerRegistry::new();

        assert!(registry.insert(5, "127.0.0.1:7005"));
        assert!(!registry.insert(5, "127.0.0.1:8005"));
        assert_eq!(registry.peer(5).unwrap().address, "127.0.0.1:8005");

        assert!(registry.remove(5));
        assert!(!registry.remove(5));
        assert!(registry.is_empty());
    }

    #[test]
    fn peers_are_listed_in_id_order() {
        let registry: PeerRegistry = [(9, "c"), (2, "a"), (4, "b")]
            .into_iter()
            .map(|(id, address)| (id, address.to_string()))
            .collect();

        assert_eq!(registry.list_peers(), vec![2, 4, 9]);
        assert_eq!(registry.lowest().unwrap().id, 2);
        assert_eq!(registry.handles().last().unwrap().address, "c");
    }
}
