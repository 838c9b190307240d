//! Kademlia routing table
//!
//! 256 k-buckets indexed by common prefix length with the local id. Each
//! bucket keeps at most `k` contacts, least recently seen at the front.

use crate::crypto::PeerId;
use crate::dht::distance::{Distance, BUCKET_COUNT};
use crate::network::multiaddr::PeerAddrInfo;
use std::collections::VecDeque;

/// Default bucket size
pub const K: usize = 20;

/// Result of offering a contact to the table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Already known; moved to the tail and addresses merged
    Refreshed,
    /// Bucket full: `oldest` should be pinged before `candidate` can enter
    Full {
        oldest: PeerAddrInfo,
        candidate: PeerAddrInfo,
    },
    /// The local peer is never stored
    SelfEntry,
}

#[derive(Debug, Default)]
struct Bucket {
    contacts: VecDeque<PeerAddrInfo>,
}

impl Bucket {
    fn position(&self, peer: &PeerId) -> Option<usize> {
        self.contacts.iter().position(|c| c.id == *peer)
    }

    fn touch(&mut self, contact: PeerAddrInfo, k: usize) -> InsertOutcome {
        if let Some(pos) = self.position(&contact.id) {
            if let Some(mut existing) = self.contacts.remove(pos) {
                for addr in contact.addrs {
                    if !existing.addrs.contains(&addr) {
                        existing.addrs.push(addr);
                    }
                }
                self.contacts.push_back(existing);
            }
            return InsertOutcome::Refreshed;
        }

        if self.contacts.len() < k {
            self.contacts.push_back(contact);
            return InsertOutcome::Inserted;
        }

        match self.contacts.front() {
            Some(oldest) => InsertOutcome::Full {
                oldest: oldest.clone(),
                candidate: contact,
            },
            // k == 0: nothing can ever be stored
            None => InsertOutcome::Full {
                oldest: contact.clone(),
                candidate: contact,
            },
        }
    }

    fn refresh(&mut self, peer: &PeerId) -> bool {
        match self.position(peer).and_then(|pos| self.contacts.remove(pos)) {
            Some(contact) => {
                self.contacts.push_back(contact);
                true
            }
            None => false,
        }
    }

    fn remove(&mut self, peer: &PeerId) -> Option<PeerAddrInfo> {
        self.position(peer).and_then(|pos| self.contacts.remove(pos))
    }
}

pub struct RoutingTable {
    local: PeerId,
    k: usize,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(local: PeerId, k: usize) -> Self {
        Self {
            local,
            k,
            buckets: (0..BUCKET_COUNT).map(|_| Bucket::default()).collect(),
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local
    }

    fn bucket_index(&self, peer: &PeerId) -> Option<usize> {
        Distance::between(&self.local, peer).bucket_index()
    }

    /// Offer a contact seen alive
    pub fn insert(&mut self, contact: PeerAddrInfo) -> InsertOutcome {
        let Some(index) = self.bucket_index(&contact.id) else {
            return InsertOutcome::SelfEntry;
        };
        self.buckets[index].touch(contact, self.k)
    }

    /// Settle a [`InsertOutcome::Full`] once the oldest contact was pinged.
    ///
    /// Alive: the oldest moves to the tail and the candidate is dropped.
    /// Dead: the oldest is evicted and the candidate takes a free slot.
    /// Returns whether the candidate was inserted.
    pub fn resolve_full(&mut self, oldest: &PeerId, candidate: PeerAddrInfo, alive: bool) -> bool {
        let Some(index) = self.bucket_index(&candidate.id) else {
            return false;
        };
        let bucket = &mut self.buckets[index];

        if alive {
            bucket.refresh(oldest);
            return false;
        }

        if bucket.remove(oldest).is_some() {
            log::debug!("Evicted unresponsive peer {} from routing table", oldest);
        }
        if bucket.position(&candidate.id).is_some() || bucket.contacts.len() >= self.k {
            return false;
        }
        bucket.contacts.push_back(candidate);
        true
    }

    pub fn remove(&mut self, peer: &PeerId) -> Option<PeerAddrInfo> {
        let index = self.bucket_index(peer)?;
        self.buckets[index].remove(peer)
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeerAddrInfo> {
        let index = self.bucket_index(peer)?;
        let bucket = &self.buckets[index];
        bucket.position(peer).and_then(|pos| bucket.contacts.get(pos))
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.get(peer).is_some()
    }

    /// Up to `count` contacts ordered by XOR distance to `target`
    pub fn closest(&self, target: &PeerId, count: usize) -> Vec<PeerAddrInfo> {
        let mut all: Vec<&PeerAddrInfo> = self
            .buckets
            .iter()
            .flat_map(|bucket| bucket.contacts.iter())
            .collect();
        all.sort_by_key(|contact| Distance::between(&contact.id, target));
        all.into_iter().take(count).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.contacts.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
