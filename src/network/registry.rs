//! Connection registry
//!
//! Tracks the live connection to each peer and the streams opened over it.
//! Outbound streams are keyed by protocol and reused by senders; inbound
//! streams are keyed by stream id and only tracked so they can be torn down
//! with their connection.

use crate::crypto::PeerId;
use crate::network::multiaddr::PeerAddrInfo;
use crate::network::transport::{Connection, Direction, Stream, StreamError};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Outcome of [`ConnectionRegistry::register`]
pub enum Registered {
    /// The new connection is now the tracked one
    Stored(Arc<Connection>),
    /// A connection was already tracked and won the tie break; the new one
    /// has been closed
    Duplicate { kept: Arc<Connection> },
}

impl Registered {
    pub fn connection(&self) -> &Arc<Connection> {
        match self {
            Registered::Stored(conn) => conn,
            Registered::Duplicate { kept } => kept,
        }
    }
}

struct PeerEntry {
    connection: Arc<Connection>,
    outbound: HashMap<String, Arc<Stream>>,
    inbound: HashMap<u64, Arc<Stream>>,
}

impl PeerEntry {
    fn new(connection: Arc<Connection>) -> Self {
        Self {
            connection,
            outbound: HashMap::new(),
            inbound: HashMap::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.inbound.is_empty()
    }

    fn drop_outbound(&mut self) {
        for (_, stream) in self.outbound.drain() {
            stream.mark_closed();
        }
    }

    fn close(self) {
        self.connection.close();
        for stream in self.outbound.values().chain(self.inbound.values()) {
            stream.mark_closed();
        }
    }
}

/// Which of two connections between the same peers survives.
///
/// Connections dialed from opposite sides: keep the one dialed by the peer
/// with the smaller id, so both ends agree. Same side: keep the existing one.
fn keep_existing(existing: &Connection, incoming: &Connection) -> bool {
    if existing.is_closed() {
        return false;
    }
    if existing.dialer() == incoming.dialer() {
        return true;
    }
    existing.dialer() < incoming.dialer()
}

/// Live connections and streams, one connection per remote peer
#[derive(Default)]
pub struct ConnectionRegistry {
    peers: RwLock<HashMap<PeerId, PeerEntry>>,
    /// Serializes stream creation per (peer, protocol)
    open_locks: Mutex<HashMap<(PeerId, String), Arc<Mutex<()>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `conn`, applying the simultaneous-connect tie break
    pub async fn register(&self, conn: Connection) -> Registered {
        let peer = conn.remote_peer();
        let conn = Arc::new(conn);
        let mut peers = self.peers.write().await;

        if let Some(entry) = peers.get_mut(&peer) {
            if keep_existing(&entry.connection, &conn) {
                log::debug!(
                    "Dropping duplicate {:?} connection to {}",
                    conn.direction(),
                    peer
                );
                conn.close();
                return Registered::Duplicate {
                    kept: entry.connection.clone(),
                };
            }

            let old = std::mem::replace(&mut entry.connection, conn.clone());
            old.close();
            entry.drop_outbound();
            log::debug!("Replaced connection {} to {} with {}", old.id(), peer, conn.id());
            return Registered::Stored(conn);
        }

        log::info!(
            "Connected to peer {} ({}, {})",
            peer,
            conn.remote_addr(),
            match conn.direction() {
                Direction::Inbound => "inbound",
                Direction::Outbound => "outbound",
            }
        );
        peers.insert(peer, PeerEntry::new(conn.clone()));
        Registered::Stored(conn)
    }

    /// The open connection to `peer`, if any
    pub async fn connection(&self, peer: &PeerId) -> Option<Arc<Connection>> {
        let peers = self.peers.read().await;
        peers
            .get(peer)
            .map(|entry| entry.connection.clone())
            .filter(|conn| !conn.is_closed())
    }

    pub async fn is_connected(&self, peer: &PeerId) -> bool {
        self.connection(peer).await.is_some()
    }

    /// A reusable outbound stream tagged with `protocol`
    pub async fn existing_stream(&self, peer: &PeerId, protocol: &str) -> Option<Arc<Stream>> {
        let peers = self.peers.read().await;
        let entry = peers.get(peer)?;
        if entry.connection.is_closed() {
            return None;
        }
        entry
            .outbound
            .get(protocol)
            .filter(|stream| !stream.is_closed())
            .cloned()
    }

    /// Track an outbound stream. A live stream already tracked for the
    /// protocol wins and the new one is closed.
    pub async fn register_stream(&self, peer: &PeerId, stream: Stream) -> Result<Arc<Stream>, StreamError> {
        let mut peers = self.peers.write().await;
        let entry = match peers.get_mut(peer) {
            Some(entry) if !entry.connection.is_closed() => entry,
            _ => {
                stream.mark_closed();
                return Err(StreamError::ConnectionClosed);
            }
        };

        if let Some(existing) = entry.outbound.get(stream.protocol()) {
            if !existing.is_closed() {
                stream.mark_closed();
                return Ok(existing.clone());
            }
        }

        let stream = Arc::new(stream);
        entry
            .outbound
            .insert(stream.protocol().to_string(), stream.clone());
        Ok(stream)
    }

    /// Track an accepted inbound stream; `None` when no connection to the
    /// peer is tracked (the stream is still usable)
    pub async fn register_inbound_stream(&self, peer: &PeerId, stream: Arc<Stream>) -> Option<Arc<Stream>> {
        let mut peers = self.peers.write().await;
        let entry = peers.get_mut(peer)?;
        entry.inbound.insert(stream.id(), stream.clone());
        Some(stream)
    }

    /// Forget a stream. The peer entry goes too once its connection is
    /// closed and no streams are left.
    pub async fn remove_stream(&self, peer: &PeerId, stream_id: u64) -> bool {
        let mut peers = self.peers.write().await;
        let Some(entry) = peers.get_mut(peer) else {
            return false;
        };

        let mut removed = entry.inbound.remove(&stream_id).is_some();
        if !removed {
            let before = entry.outbound.len();
            entry.outbound.retain(|_, s| s.id() != stream_id);
            removed = entry.outbound.len() != before;
        }

        if entry.connection.is_closed() && entry.is_empty() {
            peers.remove(peer);
            log::debug!("Removed closed connection to {}", peer);
        }
        removed
    }

    /// Drop the outbound stream `stream_id` for `protocol` so the next send
    /// opens a fresh one. A newer stream tracked for the protocol is left
    /// alone.
    pub async fn evict_stream(&self, peer: &PeerId, protocol: &str, stream_id: u64) -> Option<Arc<Stream>> {
        let mut peers = self.peers.write().await;
        let entry = peers.get_mut(peer)?;
        if entry.outbound.get(protocol)?.id() != stream_id {
            return None;
        }
        let stream = entry.outbound.remove(protocol)?;
        stream.mark_closed();
        log::debug!("Evicted {} stream to {}", protocol, peer);
        Some(stream)
    }

    /// Close the connection to `peer` and every stream on it.
    ///
    /// Everything happens under the write lock, so no caller can pick up a
    /// stream of a connection that is being closed.
    pub async fn close(&self, peer: &PeerId) -> bool {
        let mut peers = self.peers.write().await;
        match peers.remove(peer) {
            Some(entry) => {
                entry.close();
                log::info!("Closed connection to {}", peer);
                true
            }
            None => false,
        }
    }

    /// The transport reported connection `conn_id` closed
    pub async fn connection_closed(&self, peer: &PeerId, conn_id: u64) {
        let mut peers = self.peers.write().await;
        let Some(entry) = peers.get_mut(peer) else {
            return;
        };
        // A newer connection may have replaced this one
        if entry.connection.id() != conn_id {
            return;
        }

        entry.connection.close();
        entry.drop_outbound();
        if entry.inbound.is_empty() {
            peers.remove(peer);
        }
        log::info!("Connection to {} closed", peer);
    }

    /// Live streams to `peer` tagged with `protocol`, both directions
    pub async fn stream_count(&self, peer: &PeerId, protocol: &str) -> usize {
        let peers = self.peers.read().await;
        peers
            .get(peer)
            .map(|entry| {
                entry
                    .outbound
                    .values()
                    .chain(entry.inbound.values())
                    .filter(|s| s.protocol() == protocol && !s.is_closed())
                    .count()
            })
            .unwrap_or(0)
    }

    /// Remote peers with an open connection
    pub async fn connected_peers(&self) -> Vec<PeerAddrInfo> {
        let peers = self.peers.read().await;
        peers
            .values()
            .filter(|entry| !entry.connection.is_closed())
            .map(|entry| entry.connection.remote_info())
            .collect()
    }

    /// Close everything
    pub async fn close_all(&self) {
        let mut peers = self.peers.write().await;
        let count = peers.len();
        for (_, entry) in peers.drain() {
            entry.close();
        }
        if count > 0 {
            log::info!("Closed {} connections", count);
        }
    }

    /// Return the stream for (peer, protocol), running `open` to create one
    /// if none is tracked.
    ///
    /// Concurrent callers for the same key wait on one lock, so `open` runs
    /// at most once at a time per key and later callers reuse its result.
    pub async fn get_or_create_stream<F, Fut, E>(
        &self,
        peer: &PeerId,
        protocol: &str,
        open: F,
    ) -> Result<Arc<Stream>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Stream, E>>,
        E: From<StreamError>,
    {
        if let Some(stream) = self.existing_stream(peer, protocol).await {
            return Ok(stream);
        }

        let key = (*peer, protocol.to_string());
        let lock = {
            let mut locks = self.open_locks.lock().await;
            locks.entry(key.clone()).or_default().clone()
        };

        let result = {
            let _guard = lock.lock().await;
            match self.existing_stream(peer, protocol).await {
                Some(stream) => Ok(stream),
                None => match open().await {
                    Ok(stream) => self.register_stream(peer, stream).await.map_err(E::from),
                    Err(e) => Err(e),
                },
            }
        };

        // Only the map and this call still hold the lock: nobody is waiting
        let mut locks = self.open_locks.lock().await;
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(&key);
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PeerIdentity;
    use crate::network::transport::testing;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        local: PeerIdentity,
        remote: PeerId,
    }

    fn fixture(local_seed: u64, remote_seed: u64) -> Fixture {
        Fixture {
            local: PeerIdentity::generate(local_seed).unwrap(),
            remote: PeerIdentity::generate(remote_seed).unwrap().peer_id(),
        }
    }

    #[tokio::test]
    async fn test_register_and_close() {
        let f = fixture(201, 202);
        let local = testing::local_peer(&f.local);
        let registry = ConnectionRegistry::new();

        let (conn, _far) = testing::connection(&local, f.remote, Direction::Outbound).await;
        let registered = registry.register(conn).await;
        assert!(matches!(registered, Registered::Stored(_)));
        assert!(registry.is_connected(&f.remote).await);
        assert_eq!(registry.connected_peers().await.len(), 1);

        let (stream, _remote_end) =
            testing::stream_pair(1, "/test/1", f.remote, f.local.peer_id()).await;
        let stream = registry.register_stream(&f.remote, stream).await.unwrap();

        assert!(registry.close(&f.remote).await);
        assert!(registered.connection().is_closed());
        assert!(stream.is_closed());
        assert!(registry.existing_stream(&f.remote, "/test/1").await.is_none());
        assert!(!registry.close(&f.remote).await);
    }

    #[tokio::test]
    async fn test_tie_break_keeps_connection_dialed_by_smaller_id() {
        let f = fixture(203, 204);
        let local = testing::local_peer(&f.local);
        let smaller = f.local.peer_id().min(f.remote);

        // Try both registration orders
        for first in [Direction::Outbound, Direction::Inbound] {
            let second = match first {
                Direction::Outbound => Direction::Inbound,
                Direction::Inbound => Direction::Outbound,
            };
            let registry = ConnectionRegistry::new();
            let (a, _a_far) = testing::connection(&local, f.remote, first).await;
            let (b, _b_far) = testing::connection(&local, f.remote, second).await;

            registry.register(a).await;
            registry.register(b).await;

            let kept = registry.connection(&f.remote).await.unwrap();
            assert_eq!(kept.dialer(), smaller);
            assert_eq!(registry.connected_peers().await.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_same_direction_duplicate_keeps_existing() {
        let f = fixture(205, 206);
        let local = testing::local_peer(&f.local);
        let registry = ConnectionRegistry::new();

        let (a, _a_far) = testing::connection(&local, f.remote, Direction::Outbound).await;
        let (b, _b_far) = testing::connection(&local, f.remote, Direction::Outbound).await;
        let a_id = a.id();

        registry.register(a).await;
        match registry.register(b).await {
            Registered::Duplicate { kept } => assert_eq!(kept.id(), a_id),
            Registered::Stored(_) => panic!("duplicate should not replace"),
        }
    }

    #[tokio::test]
    async fn test_closed_connection_is_replaced() {
        let f = fixture(207, 208);
        let local = testing::local_peer(&f.local);
        let registry = ConnectionRegistry::new();

        let (a, _a_far) = testing::connection(&local, f.remote, Direction::Outbound).await;
        registry.register(a).await.connection().close();
        assert!(registry.connection(&f.remote).await.is_none());

        let (b, _b_far) = testing::connection(&local, f.remote, Direction::Outbound).await;
        let b_id = b.id();
        assert!(matches!(registry.register(b).await, Registered::Stored(_)));
        assert_eq!(registry.connection(&f.remote).await.unwrap().id(), b_id);
    }

    #[tokio::test]
    async fn test_streams_need_a_connection() {
        let f = fixture(209, 210);
        let registry = ConnectionRegistry::new();
        let (stream, _remote_end) =
            testing::stream_pair(1, "/test/1", f.remote, f.local.peer_id()).await;

        assert!(matches!(
            registry.register_stream(&f.remote, stream).await,
            Err(StreamError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_get_or_create_opens_once() {
        let f = fixture(211, 212);
        let local = testing::local_peer(&f.local);
        let registry = Arc::new(ConnectionRegistry::new());
        let (conn, _far) = testing::connection(&local, f.remote, Direction::Outbound).await;
        registry.register(conn).await;

        let opens = Arc::new(AtomicUsize::new(0));
        let far_ends = Arc::new(std::sync::Mutex::new(Vec::new()));
        let remote = f.remote;
        let local_id = f.local.peer_id();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let opens = opens.clone();
            let far_ends = far_ends.clone();
            tasks.push(tokio::spawn(async move {
                registry
                    .get_or_create_stream(&remote, "/test/1", move || async move {
                        opens.fetch_add(1, Ordering::SeqCst);
                        let (stream, remote_end) =
                            testing::stream_pair(1, "/test/1", remote, local_id).await;
                        far_ends.lock().unwrap().push(remote_end);
                        Ok::<_, StreamError>(stream)
                    })
                    .await
                    .unwrap()
                    .id()
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap(), 1);
        }

        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(registry.stream_count(&remote, "/test/1").await, 1);
    }

    #[tokio::test]
    async fn test_evicted_stream_is_recreated() {
        let f = fixture(213, 214);
        let local = testing::local_peer(&f.local);
        let registry = ConnectionRegistry::new();
        let (conn, _far) = testing::connection(&local, f.remote, Direction::Outbound).await;
        registry.register(conn).await;

        let (stream, _end1) = testing::stream_pair(1, "/test/1", f.remote, f.local.peer_id()).await;
        registry.register_stream(&f.remote, stream).await.unwrap();
        assert!(registry.evict_stream(&f.remote, "/test/1", 1).await.is_some());
        assert!(registry.existing_stream(&f.remote, "/test/1").await.is_none());

        let (stream, _end2) = testing::stream_pair(2, "/test/1", f.remote, f.local.peer_id()).await;
        let stream = registry
            .get_or_create_stream(&f.remote, "/test/1", move || async move {
                Ok::<_, StreamError>(stream)
            })
            .await
            .unwrap();
        assert_eq!(stream.id(), 2);
        assert_eq!(registry.stream_count(&f.remote, "/test/1").await, 1);
    }

    #[tokio::test]
    async fn test_stale_eviction_spares_newer_stream() {
        let f = fixture(217, 218);
        let local = testing::local_peer(&f.local);
        let registry = ConnectionRegistry::new();
        let (conn, _far) = testing::connection(&local, f.remote, Direction::Outbound).await;
        registry.register(conn).await;

        let (first, _end1) = testing::stream_pair(1, "/test/1", f.remote, f.local.peer_id()).await;
        let first = registry.register_stream(&f.remote, first).await.unwrap();
        assert!(registry.evict_stream(&f.remote, "/test/1", first.id()).await.is_some());

        let (second, _end2) = testing::stream_pair(2, "/test/1", f.remote, f.local.peer_id()).await;
        registry.register_stream(&f.remote, second).await.unwrap();

        // A second holder of the first stream fails its write later
        assert!(registry.evict_stream(&f.remote, "/test/1", first.id()).await.is_none());
        let current = registry.existing_stream(&f.remote, "/test/1").await.unwrap();
        assert_eq!(current.id(), 2);
        assert!(!current.is_closed());
        assert_eq!(registry.stream_count(&f.remote, "/test/1").await, 1);
    }

    #[tokio::test]
    async fn test_transport_close_keeps_inbound_until_drained() {
        let f = fixture(215, 216);
        let local = testing::local_peer(&f.local);
        let registry = ConnectionRegistry::new();
        let (conn, _far) = testing::connection(&local, f.remote, Direction::Inbound).await;
        let conn_id = registry.register(conn).await.connection().id();

        let (_opener, inbound) = testing::stream_pair(7, "/test/1", f.local.peer_id(), f.remote).await;
        registry
            .register_inbound_stream(&f.remote, Arc::new(inbound))
            .await
            .unwrap();

        registry.connection_closed(&f.remote, conn_id).await;
        assert!(registry.connection(&f.remote).await.is_none());
        assert_eq!(registry.stream_count(&f.remote, "/test/1").await, 1);

        assert!(registry.remove_stream(&f.remote, 7).await);
        assert_eq!(registry.stream_count(&f.remote, "/test/1").await, 0);
        assert!(!registry.remove_stream(&f.remote, 7).await);
    }
}
