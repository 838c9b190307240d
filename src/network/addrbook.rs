//! Address book
//!
//! Maps peer ids to the addresses they were seen at. Every address carries
//! its own expiry; sightings only ever add addresses or push expiries out.

use crate::crypto::PeerId;
use crate::network::multiaddr::{Multiaddr, PeerAddrInfo};
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Addresses that never expire (bootstrap seeds)
pub const PERMANENT_ADDR_TTL: Duration = Duration::MAX;

/// Addresses learned from DHT lookups (10 minutes)
pub const DHT_ADDR_TTL: Duration = Duration::from_secs(10 * 60);

/// Addresses of peers we held a connection with (30 minutes)
pub const CONNECTED_ADDR_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone)]
struct AddrEntry {
    /// `None` = permanent
    expiry: Option<Instant>,
    last_seen: Instant,
}

impl AddrEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expiry.map_or(true, |expiry| expiry > now)
    }
}

fn later(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        _ => None,
    }
}

/// Snapshot of what is known about one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub addrs: BTreeSet<Multiaddr>,
    /// Latest expiry among the addresses, `None` if any is permanent
    pub expiry: Option<Instant>,
}

impl PeerRecord {
    /// Record for addresses valid for `ttl` from now
    pub fn new(peer_id: PeerId, addrs: impl IntoIterator<Item = Multiaddr>, ttl: Duration) -> Self {
        Self {
            peer_id,
            addrs: addrs.into_iter().map(|a| a.without_peer()).collect(),
            expiry: Instant::now().checked_add(ttl),
        }
    }

    pub fn to_addr_info(&self) -> PeerAddrInfo {
        PeerAddrInfo::new(self.peer_id, self.addrs.iter().cloned().collect())
    }
}

/// Thread-safe peer id → addresses map
#[derive(Default)]
pub struct AddressBook {
    peers: RwLock<HashMap<PeerId, HashMap<Multiaddr, AddrEntry>>>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `addrs` into the peer's record, valid for `ttl`.
    ///
    /// Known addresses keep the later of the two expiries; a permanent
    /// address stays permanent.
    pub async fn add_addresses(&self, peer: PeerId, addrs: &[Multiaddr], ttl: Duration) {
        if addrs.is_empty() {
            return;
        }

        let now = Instant::now();
        let expiry = now.checked_add(ttl);

        let mut peers = self.peers.write().await;
        let entries = peers.entry(peer).or_default();
        for addr in addrs {
            let addr = addr.without_peer();
            match entries.get_mut(&addr) {
                Some(entry) => {
                    entry.last_seen = now;
                    entry.expiry = later(entry.expiry, expiry);
                }
                None => {
                    entries.insert(
                        addr,
                        AddrEntry {
                            expiry,
                            last_seen: now,
                        },
                    );
                }
            }
        }
    }

    pub async fn add_info(&self, info: &PeerAddrInfo, ttl: Duration) {
        self.add_addresses(info.id, &info.addrs, ttl).await;
    }

    /// Non-expired addresses of `peer`; empty when unknown
    pub async fn addresses_for(&self, peer: &PeerId) -> BTreeSet<Multiaddr> {
        let now = Instant::now();
        let peers = self.peers.read().await;
        peers
            .get(peer)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(_, entry)| entry.is_live(now))
                    .map(|(addr, _)| addr.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Non-expired addresses, most recently seen first
    pub async fn dial_candidates(&self, peer: &PeerId) -> Vec<Multiaddr> {
        let now = Instant::now();
        let peers = self.peers.read().await;
        let Some(entries) = peers.get(peer) else {
            return Vec::new();
        };

        let mut live: Vec<(&Multiaddr, &AddrEntry)> =
            entries.iter().filter(|(_, e)| e.is_live(now)).collect();
        live.sort_by(|a, b| b.1.last_seen.cmp(&a.1.last_seen).then_with(|| a.0.cmp(b.0)));
        live.into_iter().map(|(addr, _)| addr.clone()).collect()
    }

    /// The peer's live addresses, or `None` when nothing valid is known
    pub async fn record(&self, peer: &PeerId) -> Option<PeerRecord> {
        let now = Instant::now();
        let peers = self.peers.read().await;
        let entries = peers.get(peer)?;

        let mut addrs = BTreeSet::new();
        let mut expiry = Some(now);
        for (addr, entry) in entries.iter().filter(|(_, e)| e.is_live(now)) {
            addrs.insert(addr.clone());
            expiry = later(expiry, entry.expiry);
        }

        if addrs.is_empty() {
            return None;
        }
        Some(PeerRecord {
            peer_id: *peer,
            addrs,
            expiry,
        })
    }

    pub async fn remove(&self, peer: &PeerId) -> bool {
        self.peers.write().await.remove(peer).is_some()
    }

    /// Drop expired addresses and records left empty; returns how many
    /// addresses were removed
    pub async fn gc(&self) -> usize {
        let now = Instant::now();
        let mut peers = self.peers.write().await;
        let mut removed = 0;

        peers.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|_, entry| entry.is_live(now));
            removed += before - entries.len();
            !entries.is_empty()
        });

        if removed > 0 {
            log::debug!("Address book gc removed {} expired addresses", removed);
        }
        removed
    }

    /// Tracked records, expired ones included until the next gc
    pub async fn record_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Peers with at least one live address
    pub async fn peers(&self) -> Vec<PeerId> {
        let now = Instant::now();
        let peers = self.peers.read().await;
        peers
            .iter()
            .filter(|(_, entries)| entries.values().any(|e| e.is_live(now)))
            .map(|(peer, _)| *peer)
            .collect()
    }
}
