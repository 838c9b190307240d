//! Dial-and-register glue
//!
//! Bootstrap, DHT queries and `send` all reach peers through the swarm, so a
//! peer is dialed at most once at a time and every connection ends up in the
//! registry with a watcher that notices when it dies.

use crate::crypto::PeerId;
use crate::network::addrbook::{AddressBook, CONNECTED_ADDR_TTL};
use crate::network::multiaddr::{Multiaddr, PeerAddrInfo};
use crate::network::registry::{ConnectionRegistry, Registered};
use crate::network::transport::{Connection, DialError, Host};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub struct Swarm {
    host: Host,
    address_book: Arc<AddressBook>,
    registry: Arc<ConnectionRegistry>,
    dial_timeout: Duration,
    dial_locks: Mutex<HashMap<PeerId, Arc<Mutex<()>>>>,
}

impl Swarm {
    pub fn new(
        host: Host,
        address_book: Arc<AddressBook>,
        registry: Arc<ConnectionRegistry>,
        dial_timeout: Duration,
    ) -> Self {
        Self {
            host,
            address_book,
            registry,
            dial_timeout,
            dial_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.host.peer_id()
    }

    pub fn local_info(&self) -> PeerAddrInfo {
        self.host.local_info()
    }

    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.host.listen_addrs()
    }

    /// Listen addresses with our `/p2p/` suffix
    pub fn full_addrs(&self) -> Vec<Multiaddr> {
        self.local_info().p2p_addrs()
    }

    pub fn address_book(&self) -> &Arc<AddressBook> {
        &self.address_book
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Return the open connection to `info.id`, dialing its addresses in
    /// order until one works
    pub async fn connect(&self, info: &PeerAddrInfo) -> Result<Arc<Connection>, DialError> {
        if info.id == self.local_peer_id() {
            return Err(DialError::SelfDial);
        }
        if let Some(conn) = self.registry.connection(&info.id).await {
            return Ok(conn);
        }

        let lock = {
            let mut locks = self.dial_locks.lock().await;
            locks.entry(info.id).or_default().clone()
        };
        let result = {
            let _guard = lock.lock().await;
            self.dial_addrs(info).await
        };

        // Only the map and this call still hold the lock: nobody is waiting
        let mut locks = self.dial_locks.lock().await;
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(&info.id);
        }

        result
    }

    async fn dial_addrs(&self, info: &PeerAddrInfo) -> Result<Arc<Connection>, DialError> {
        // Someone else may have connected while we waited
        if let Some(conn) = self.registry.connection(&info.id).await {
            return Ok(conn);
        }

        let mut last_error = None;
        for addr in &info.addrs {
            match self.host.dial(&info.id, addr, self.dial_timeout).await {
                Ok(conn) => return Ok(self.adopt(conn).await),
                Err(e) => {
                    log::debug!("Dial to {} via {} failed: {}", info.id, addr, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(DialError::NoAddresses(info.id)))
    }

    /// Connect using whatever the address book knows about `peer`
    pub async fn connect_known(&self, peer: &PeerId) -> Result<Arc<Connection>, DialError> {
        let addrs = self.address_book.dial_candidates(peer).await;
        self.connect(&PeerAddrInfo::new(*peer, addrs)).await
    }

    /// Register a fresh connection (either direction) and watch it
    pub async fn adopt(&self, conn: Connection) -> Arc<Connection> {
        let remote = conn.remote_info();
        let registered = self.registry.register(conn).await;

        if let Registered::Stored(conn) = &registered {
            self.address_book.add_info(&remote, CONNECTED_ADDR_TTL).await;

            let registry = self.registry.clone();
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.closed().await;
                registry.connection_closed(&conn.remote_peer(), conn.id()).await;
            });
        }

        registered.connection().clone()
    }

    /// Stop listening and drop every connection
    pub async fn shutdown(&self) {
        self.host.close();
        self.registry.close_all().await;
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn test_connect_registers_once() {
        let (a, a_events) = swarm(301).await;
        let (b, b_events) = swarm(302).await;
        adopt_inbound(a.clone(), a_events);
        adopt_inbound(b.clone(), b_events);

        let info = b.local_info();
        let (first, second) = tokio::join!(a.connect(&info), a.connect(&info));
        assert_eq!(first.unwrap().id(), second.unwrap().id());
        assert!(a.dial_locks.lock().await.is_empty());

        assert!(a.registry().is_connected(&b.local_peer_id()).await);
        assert_eq!(
            a.address_book().addresses_for(&b.local_peer_id()).await.len(),
            1
        );

        // The remote side registers the inbound connection
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(b.registry().is_connected(&a.local_peer_id()).await);
    }

    #[tokio::test]
    async fn test_connect_tries_every_address() {
        let (a, _a_events) = swarm(303).await;
        let (b, b_events) = swarm(304).await;
        adopt_inbound(b.clone(), b_events);

        let dead = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = Multiaddr::new(dead.local_addr().unwrap());
        drop(dead);

        let mut info = b.local_info();
        info.addrs.insert(0, dead_addr);
        assert!(a.connect(&info).await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_without_addresses() {
        let (a, _a_events) = swarm(305).await;
        let peer = PeerId::random();
        assert!(matches!(
            a.connect_known(&peer).await,
            Err(DialError::NoAddresses(p)) if p == peer
        ));
        assert!(a.dial_locks.lock().await.is_empty());
        assert!(matches!(
            a.connect(&a.local_info()).await,
            Err(DialError::SelfDial)
        ));
    }

    #[tokio::test]
    async fn test_closed_connection_leaves_registry() {
        let (a, _a_events) = swarm(306).await;
        let (b, b_events) = swarm(307).await;
        adopt_inbound(b.clone(), b_events);

        let conn = a.connect(&b.local_info()).await.unwrap();
        conn.close();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!a.registry().is_connected(&b.local_peer_id()).await);
        assert!(a.registry().connected_peers().await.is_empty());
    }
}
