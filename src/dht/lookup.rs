//! Iterative peer lookup
//!
//! A lookup starts from the closest contacts in the routing table and asks
//! every not-yet-queried candidate, in parallel, for the peers it knows
//! closest to the target. It ends as soon as the target shows up, or when a
//! round brings nothing strictly closer than what was already known.

use crate::crypto::PeerId;
use crate::dht::distance::Distance;
use crate::dht::routing::{InsertOutcome, RoutingTable, K};
use crate::dht::rpc::RpcError;
use crate::network::addrbook::{PeerRecord, DHT_ADDR_TTL, PERMANENT_ADDR_TTL};
use crate::network::multiaddr::PeerAddrInfo;
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Default lookup parallelism
pub const ALPHA: usize = 3;

#[derive(Error, Debug)]
pub enum LookupError {
    #[error("Peer {0} not found")]
    PeerNotFound(PeerId),
    #[error("Lookup for {target} gave up after {rounds} rounds")]
    Timeout { target: PeerId, rounds: usize },
    #[error("Lookup cancelled")]
    Cancelled,
    #[error("Routing table is empty")]
    NoPeers,
}

#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Bucket size and candidate set size
    pub k: usize,
    /// Contacts a lookup starts from
    pub alpha: usize,
    /// Bound on each FIND_NODE / PING exchange
    pub query_timeout: Duration,
    /// Rounds before a lookup gives up
    pub max_rounds: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: K,
            alpha: ALPHA,
            query_timeout: Duration::from_secs(5),
            max_rounds: 20,
        }
    }
}

/// How the DHT talks to remote peers
#[async_trait]
pub trait KadNetwork: Send + Sync + 'static {
    /// Ask `peer` for the contacts it knows closest to `target`
    async fn find_node(&self, peer: &PeerAddrInfo, target: &PeerId) -> Result<Vec<PeerAddrInfo>, RpcError>;

    /// Check that `peer` is alive
    async fn ping(&self, peer: &PeerAddrInfo) -> Result<(), RpcError>;
}

enum LookupOutcome {
    Found(PeerAddrInfo),
    Exhausted,
}

/// Insert `contact` into the candidate list, merging addresses of a known id
fn merge_candidate(candidates: &mut Vec<PeerAddrInfo>, contact: PeerAddrInfo) {
    match candidates.iter_mut().find(|c| c.id == contact.id) {
        Some(existing) => {
            for addr in contact.addrs {
                if !existing.addrs.contains(&addr) {
                    existing.addrs.push(addr);
                }
            }
        }
        None => candidates.push(contact),
    }
}

pub struct Dht<N: KadNetwork> {
    local: PeerAddrInfo,
    table: Arc<Mutex<RoutingTable>>,
    network: Arc<N>,
    config: DhtConfig,
}

impl<N: KadNetwork> Dht<N> {
    pub fn new(local: PeerAddrInfo, network: Arc<N>, config: DhtConfig) -> Self {
        Self {
            table: Arc::new(Mutex::new(RoutingTable::new(local.id, config.k))),
            local,
            network,
            config,
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local.id
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    pub async fn routing_table_len(&self) -> usize {
        self.table.lock().await.len()
    }

    pub async fn contains(&self, peer: &PeerId) -> bool {
        self.table.lock().await.contains(peer)
    }

    pub async fn closest(&self, target: &PeerId, count: usize) -> Vec<PeerAddrInfo> {
        self.table.lock().await.closest(target, count)
    }

    pub async fn remove(&self, peer: &PeerId) -> Option<PeerAddrInfo> {
        self.table.lock().await.remove(peer)
    }

    /// Record a contact seen alive. A full bucket pings its oldest entry in
    /// the background and lets the result decide who stays.
    pub async fn observe(&self, contact: PeerAddrInfo) {
        if contact.addrs.is_empty() {
            return;
        }

        let outcome = self.table.lock().await.insert(contact);
        if let InsertOutcome::Full { oldest, candidate } = outcome {
            let network = self.network.clone();
            let table = self.table.clone();
            let timeout = self.config.query_timeout;
            tokio::spawn(async move {
                let alive = matches!(
                    tokio::time::timeout(timeout, network.ping(&oldest)).await,
                    Ok(Ok(()))
                );
                table.lock().await.resolve_full(&oldest.id, candidate, alive);
            });
        }
    }

    /// Resolve `target` to its addresses
    pub async fn find_peer(&self, target: &PeerId, cancel: &CancellationToken) -> Result<PeerRecord, LookupError> {
        if *target == self.local.id {
            return Ok(PeerRecord::new(
                self.local.id,
                self.local.addrs.clone(),
                PERMANENT_ADDR_TTL,
            ));
        }

        if let Some(contact) = self.table.lock().await.get(target).cloned() {
            log::debug!("Peer {} found in routing table", target);
            return Ok(PeerRecord::new(contact.id, contact.addrs, DHT_ADDR_TTL));
        }

        match self.run_lookup(*target, cancel).await? {
            LookupOutcome::Found(contact) => {
                log::info!("Found peer {} via DHT", target);
                Ok(PeerRecord::new(contact.id, contact.addrs, DHT_ADDR_TTL))
            }
            LookupOutcome::Exhausted => Err(LookupError::PeerNotFound(*target)),
        }
    }

    /// Seed the routing table with `connected` and look ourselves up to
    /// learn about our neighbourhood. Only cancellation is an error.
    pub async fn bootstrap(&self, connected: &[PeerAddrInfo], cancel: &CancellationToken) -> Result<usize, LookupError> {
        for contact in connected {
            self.observe(contact.clone()).await;
        }

        match self.run_lookup(self.local.id, cancel).await {
            Ok(_) => {}
            Err(LookupError::Cancelled) => return Err(LookupError::Cancelled),
            Err(e) => log::debug!("Self lookup ended: {}", e),
        }

        let size = self.routing_table_len().await;
        log::info!("DHT bootstrap complete, {} peers in routing table", size);
        Ok(size)
    }

    async fn run_lookup(&self, target: PeerId, cancel: &CancellationToken) -> Result<LookupOutcome, LookupError> {
        let mut candidates = self.table.lock().await.closest(&target, self.config.alpha);
        let Some(first) = candidates.first() else {
            return Err(LookupError::NoPeers);
        };

        let mut best = Distance::between(&first.id, &target);
        let mut queried: HashSet<PeerId> = HashSet::new();
        let mut round = 0;

        loop {
            let pending: Vec<PeerAddrInfo> = candidates
                .iter()
                .filter(|c| !queried.contains(&c.id))
                .cloned()
                .collect();
            if pending.is_empty() {
                return Ok(LookupOutcome::Exhausted);
            }

            round += 1;
            if round > self.config.max_rounds {
                return Err(LookupError::Timeout {
                    target,
                    rounds: self.config.max_rounds,
                });
            }
            queried.extend(pending.iter().map(|c| c.id));
            log::debug!(
                "Lookup {} round {}: querying {} peers",
                target.short(),
                round,
                pending.len()
            );

            let queries = pending.iter().map(|peer| async move {
                let response =
                    tokio::time::timeout(self.config.query_timeout, self.network.find_node(peer, &target)).await;
                (peer, response)
            });
            let responses = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LookupError::Cancelled),
                responses = join_all(queries) => responses,
            };

            let mut found = None;
            for (peer, response) in responses {
                match response {
                    Ok(Ok(contacts)) => {
                        self.observe(peer.clone()).await;
                        for contact in contacts {
                            if contact.id == self.local.id || contact.addrs.is_empty() {
                                continue;
                            }
                            if contact.id == target {
                                found = Some(contact.clone());
                            }
                            merge_candidate(&mut candidates, contact);
                        }
                    }
                    Ok(Err(e)) => {
                        log::debug!("FIND_NODE to {} failed: {}", peer.id, e);
                        self.table.lock().await.remove(&peer.id);
                    }
                    Err(_) => {
                        log::debug!("FIND_NODE to {} timed out", peer.id);
                        self.table.lock().await.remove(&peer.id);
                    }
                }
            }

            if let Some(contact) = found {
                return Ok(LookupOutcome::Found(contact));
            }

            candidates.sort_by_key(|c| Distance::between(&c.id, &target));
            candidates.truncate(self.config.k);

            match candidates.first().map(|c| Distance::between(&c.id, &target)) {
                Some(distance) if distance < best => best = distance,
                _ => return Ok(LookupOutcome::Exhausted),
            }
        }
    }

    /// Answer an inbound FIND_NODE
    pub async fn handle_find_node(&self, from: Option<PeerAddrInfo>, target: &PeerId) -> Vec<PeerAddrInfo> {
        if let Some(from) = from {
            self.observe(from).await;
        }

        let mut contacts = self.table.lock().await.closest(target, self.config.k);
        if *target == self.local.id {
            contacts.insert(0, self.local.clone());
            contacts.truncate(self.config.k);
        }
        contacts
    }

    /// Answer an inbound PING
    pub async fn handle_ping(&self, from: PeerAddrInfo) {
        self.observe(from).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PEER_ID_LEN;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn id(first: u8, last: u8) -> PeerId {
        let mut bytes = [0u8; PEER_ID_LEN];
        bytes[0] = first;
        bytes[PEER_ID_LEN - 1] = last;
        PeerId::from_bytes(bytes)
    }

    fn contact(peer: PeerId) -> PeerAddrInfo {
        let port = 1000 + peer.as_bytes()[0] as u16;
        PeerAddrInfo::new(
            peer,
            vec![format!("/ip4/127.0.0.1/tcp/{}", port).parse().unwrap()],
        )
    }

    #[derive(Default)]
    struct MockNetwork {
        responses: std::sync::Mutex<HashMap<PeerId, Vec<PeerAddrInfo>>>,
        dead: std::sync::Mutex<HashSet<PeerId>>,
        delay: Option<Duration>,
        queries: AtomicUsize,
    }

    impl MockNetwork {
        fn knows(&self, peer: PeerId, contacts: &[PeerId]) {
            self.responses
                .lock()
                .unwrap()
                .insert(peer, contacts.iter().map(|c| contact(*c)).collect());
        }

        fn kill(&self, peer: PeerId) {
            self.dead.lock().unwrap().insert(peer);
        }

        fn is_dead(&self, peer: &PeerId) -> bool {
            self.dead.lock().unwrap().contains(peer)
        }
    }

    #[async_trait]
    impl KadNetwork for MockNetwork {
        async fn find_node(&self, peer: &PeerAddrInfo, _target: &PeerId) -> Result<Vec<PeerAddrInfo>, RpcError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.is_dead(&peer.id) {
                return Err(RpcError::NoResponse);
            }
            let contacts = self.responses.lock().unwrap().get(&peer.id).cloned();
            Ok(contacts.unwrap_or_default())
        }

        async fn ping(&self, peer: &PeerAddrInfo) -> Result<(), RpcError> {
            if self.is_dead(&peer.id) {
                return Err(RpcError::NoResponse);
            }
            Ok(())
        }
    }

    const LOCAL: (u8, u8) = (0xFF, 0);
    const TARGET: (u8, u8) = (0, 1);

    fn dht(network: Arc<MockNetwork>, config: DhtConfig) -> Dht<MockNetwork> {
        Dht::new(contact(id(LOCAL.0, LOCAL.1)), network, config)
    }

    #[tokio::test]
    async fn test_finds_peer_through_hops() {
        let target = id(TARGET.0, TARGET.1);
        let (a, b, c) = (id(0x40, 0), id(0x10, 0), id(0x04, 0));
        let network = Arc::new(MockNetwork::default());
        network.knows(a, &[b]);
        network.knows(b, &[c]);
        network.knows(c, &[target]);

        let dht = dht(network.clone(), DhtConfig::default());
        dht.observe(contact(a)).await;

        let record = dht.find_peer(&target, &CancellationToken::new()).await.unwrap();
        assert_eq!(record.peer_id, target);
        assert_eq!(record.to_addr_info().addrs, contact(target).addrs);
        assert_eq!(network.queries.load(Ordering::SeqCst), 3);

        // Responders were recorded
        assert!(dht.contains(&b).await);
        assert!(dht.contains(&c).await);
    }

    #[tokio::test]
    async fn test_known_target_needs_no_queries() {
        let target = id(TARGET.0, TARGET.1);
        let network = Arc::new(MockNetwork::default());
        let dht = dht(network.clone(), DhtConfig::default());
        dht.observe(contact(target)).await;

        let record = dht.find_peer(&target, &CancellationToken::new()).await.unwrap();
        assert_eq!(record.peer_id, target);
        assert_eq!(network.queries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_closer_peers_means_not_found() {
        let target = id(TARGET.0, TARGET.1);
        let a = id(0x40, 0);
        let network = Arc::new(MockNetwork::default());
        network.knows(a, &[id(0x80, 0)]);

        let dht = dht(network, DhtConfig::default());
        dht.observe(contact(a)).await;

        assert!(matches!(
            dht.find_peer(&target, &CancellationToken::new()).await,
            Err(LookupError::PeerNotFound(p)) if p == target
        ));
    }

    #[tokio::test]
    async fn test_failed_responder_is_evicted() {
        let target = id(TARGET.0, TARGET.1);
        let a = id(0x40, 0);
        let network = Arc::new(MockNetwork::default());
        network.kill(a);

        let dht = dht(network, DhtConfig::default());
        dht.observe(contact(a)).await;

        assert!(matches!(
            dht.find_peer(&target, &CancellationToken::new()).await,
            Err(LookupError::PeerNotFound(_))
        ));
        assert!(!dht.contains(&a).await);
    }

    #[tokio::test]
    async fn test_empty_table() {
        let dht = dht(Arc::new(MockNetwork::default()), DhtConfig::default());
        let target = id(TARGET.0, TARGET.1);
        assert!(matches!(
            dht.find_peer(&target, &CancellationToken::new()).await,
            Err(LookupError::NoPeers)
        ));
    }

    #[tokio::test]
    async fn test_round_limit() {
        let target = id(TARGET.0, TARGET.1);
        let (a, b, c) = (id(0x40, 0), id(0x10, 0), id(0x04, 0));
        let network = Arc::new(MockNetwork::default());
        network.knows(a, &[b]);
        network.knows(b, &[c]);
        network.knows(c, &[target]);

        let config = DhtConfig {
            max_rounds: 2,
            ..DhtConfig::default()
        };
        let dht = dht(network, config);
        dht.observe(contact(a)).await;

        assert!(matches!(
            dht.find_peer(&target, &CancellationToken::new()).await,
            Err(LookupError::Timeout { rounds: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_cancellation_discards_in_flight_queries() {
        let network = Arc::new(MockNetwork {
            delay: Some(Duration::from_secs(10)),
            ..MockNetwork::default()
        });
        let config = DhtConfig {
            query_timeout: Duration::from_secs(30),
            ..DhtConfig::default()
        };
        let dht = dht(network, config);
        dht.observe(contact(id(0x40, 0))).await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let target = id(TARGET.0, TARGET.1);
        assert!(matches!(
            dht.find_peer(&target, &cancel).await,
            Err(LookupError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_slow_peer_times_out() {
        let network = Arc::new(MockNetwork {
            delay: Some(Duration::from_secs(10)),
            ..MockNetwork::default()
        });
        let config = DhtConfig {
            query_timeout: Duration::from_millis(20),
            ..DhtConfig::default()
        };
        let dht = dht(network, config);
        let a = id(0x40, 0);
        dht.observe(contact(a)).await;

        let target = id(TARGET.0, TARGET.1);
        assert!(matches!(
            dht.find_peer(&target, &CancellationToken::new()).await,
            Err(LookupError::PeerNotFound(_))
        ));
        assert!(!dht.contains(&a).await);
    }

    #[tokio::test]
    async fn test_bootstrap_learns_neighbours() {
        let (a, b) = (id(0x40, 0), id(0xF0, 0));
        let network = Arc::new(MockNetwork::default());
        network.knows(a, &[b]);

        let dht = dht(network, DhtConfig::default());
        let size = dht
            .bootstrap(&[contact(a)], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(size, 2);
        assert!(dht.contains(&b).await);
    }

    #[tokio::test]
    async fn test_bootstrap_without_peers_is_not_an_error() {
        let dht = dht(Arc::new(MockNetwork::default()), DhtConfig::default());
        assert_eq!(dht.bootstrap(&[], &CancellationToken::new()).await.unwrap(), 0);

        let cancel = CancellationToken::new();
        cancel.cancel();
        dht.observe(contact(id(0x40, 0))).await;
        assert!(matches!(
            dht.bootstrap(&[], &cancel).await,
            Err(LookupError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_find_node_answers_include_self_for_own_id() {
        let dht = dht(Arc::new(MockNetwork::default()), DhtConfig::default());
        let a = id(0x40, 0);
        let local = id(LOCAL.0, LOCAL.1);

        let contacts = dht.handle_find_node(Some(contact(a)), &local).await;
        assert_eq!(contacts[0].id, local);
        assert!(contacts.iter().any(|c| c.id == a));
        assert!(dht.contains(&a).await);
    }

    #[tokio::test]
    async fn test_full_bucket_evicts_dead_oldest() {
        let network = Arc::new(MockNetwork::default());
        let config = DhtConfig {
            k: 1,
            ..DhtConfig::default()
        };
        let dht = dht(network.clone(), config);
        let (oldest, newcomer) = (id(0x40, 1), id(0x40, 2));

        dht.observe(contact(oldest)).await;
        network.kill(oldest);
        dht.observe(contact(newcomer)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!dht.contains(&oldest).await);
        assert!(dht.contains(&newcomer).await);
    }

    #[tokio::test]
    async fn test_full_bucket_keeps_live_oldest() {
        let network = Arc::new(MockNetwork::default());
        let config = DhtConfig {
            k: 1,
            ..DhtConfig::default()
        };
        let dht = dht(network, config);
        let (oldest, newcomer) = (id(0x40, 1), id(0x40, 2));

        dht.observe(contact(oldest)).await;
        dht.observe(contact(newcomer)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(dht.contains(&oldest).await);
        assert!(!dht.contains(&newcomer).await);
    }
}
