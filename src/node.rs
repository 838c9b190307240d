//! Overlay node
//!
//! Wires identity, transport, address book, connection registry, DHT and the
//! stream protocol together and exposes the public API.

use crate::config::{ConfigError, NodeConfig};
use crate::crypto::{KeyError, PeerId, PeerIdentity};
use crate::dht::{serve_inbound, Dht, LookupError, KAD_PROTOCOL};
use crate::network::addrbook::{AddressBook, PeerRecord, DHT_ADDR_TTL};
use crate::network::bootstrap::{BootstrapError, Bootstrapper};
use crate::network::multiaddr::{Multiaddr, PeerAddrInfo};
use crate::network::protocol::{SendError, StreamProtocol};
use crate::network::registry::ConnectionRegistry;
use crate::network::swarm::Swarm;
use crate::network::transport::{DialError, Host, InboundEvent};
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Identity error: {0}")]
    Key(#[from] KeyError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Could not listen: {0}")]
    Listen(#[from] std::io::Error),
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    #[error(transparent)]
    Lookup(#[from] LookupError),
    #[error(transparent)]
    Dial(#[from] DialError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error("Node already started")]
    AlreadyStarted,
    #[error("Node stopped")]
    Stopped,
}

/// A running overlay node
pub struct Node {
    config: NodeConfig,
    identity: Arc<PeerIdentity>,
    seeds: Vec<PeerAddrInfo>,
    swarm: Arc<Swarm>,
    dht: Arc<Dht<Swarm>>,
    protocol: Arc<StreamProtocol>,
    shutdown: CancellationToken,
    /// Taken by the first `start`
    events: Mutex<Option<mpsc::Receiver<InboundEvent>>>,
}

impl Node {
    /// Validate `config`, create the identity and bind the listener
    pub async fn new(config: NodeConfig) -> Result<Self, NodeError> {
        let seeds = config.validate()?;
        let identity = Arc::new(PeerIdentity::generate(config.key_seed)?);

        let (host, events) = Host::listen(identity.clone(), config.bind_addr(), config.dial_timeout).await?;
        let swarm = Arc::new(Swarm::new(
            host,
            Arc::new(AddressBook::new()),
            Arc::new(ConnectionRegistry::new()),
            config.dial_timeout,
        ));
        let dht = Arc::new(Dht::new(swarm.local_info(), swarm.clone(), config.dht_config()));

        let shutdown = CancellationToken::new();
        let protocol = Arc::new(StreamProtocol::new(
            config.protocol.clone(),
            swarm.clone(),
            dht.clone(),
            shutdown.child_token(),
        ));

        log::info!("Created node {}", identity.peer_id());

        Ok(Self {
            config,
            identity,
            seeds,
            swarm,
            dht,
            protocol,
            shutdown,
            events: Mutex::new(Some(events)),
        })
    }

    /// Start serving and run the startup sequence in the background.
    ///
    /// `done` fires once bootstrap and the DHT self lookup finished. A fatal
    /// startup error is sent on the error channel instead and `done` is
    /// dropped unsignalled.
    pub fn start(&self) -> (oneshot::Receiver<()>, mpsc::Receiver<NodeError>) {
        let (done_tx, done_rx) = oneshot::channel();
        let (err_tx, err_rx) = mpsc::channel(4);

        if self.shutdown.is_cancelled() {
            let _ = err_tx.try_send(NodeError::Stopped);
            return (done_rx, err_rx);
        }
        let events = match self.events.lock() {
            Ok(mut events) => events.take(),
            Err(_) => None,
        };
        let Some(events) = events else {
            let _ = err_tx.try_send(NodeError::AlreadyStarted);
            return (done_rx, err_rx);
        };

        tokio::spawn(run_events(
            events,
            self.swarm.clone(),
            self.dht.clone(),
            self.protocol.clone(),
            self.shutdown.clone(),
        ));
        tokio::spawn(run_addr_gc(
            self.swarm.address_book().clone(),
            self.config.addr_gc_interval,
            self.shutdown.clone(),
        ));

        let swarm = self.swarm.clone();
        let dht = self.dht.clone();
        let seeds = self.seeds.clone();
        let no_bootstrap = self.config.no_bootstrap;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            match run_startup(swarm, dht, seeds, no_bootstrap, shutdown).await {
                Ok(()) => {
                    let _ = done_tx.send(());
                }
                Err(e) => {
                    log::error!("Node startup failed: {}", e);
                    let _ = err_tx.send(e).await;
                }
            }
        });

        (done_rx, err_rx)
    }

    /// [`start`](Node::start) and wait for the outcome
    pub async fn started(&self) -> Result<(), NodeError> {
        let (done, mut errors) = self.start();
        match done.await {
            Ok(()) => Ok(()),
            Err(_) => Err(errors.recv().await.unwrap_or(NodeError::Stopped)),
        }
    }

    /// Cancel background work, close every connection and stop listening.
    /// Calling it again does nothing.
    pub async fn stop(&self) -> Result<(), NodeError> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        self.shutdown.cancel();
        self.swarm.shutdown().await;
        log::info!("Node {} stopped", self.peer_id());
        Ok(())
    }

    /// Resolve `peer` through the DHT
    pub async fn find_peer(&self, peer: &PeerId) -> Result<PeerRecord, NodeError> {
        self.find_peer_with(peer, &self.shutdown).await
    }

    pub async fn find_peer_with(&self, peer: &PeerId, cancel: &CancellationToken) -> Result<PeerRecord, NodeError> {
        let record = self.dht.find_peer(peer, cancel).await?;
        self.swarm
            .address_book()
            .add_info(&record.to_addr_info(), DHT_ADDR_TTL)
            .await;
        Ok(record)
    }

    /// Dial the peer in `record` and keep the connection
    pub async fn connect(&self, record: &PeerRecord) -> Result<(), NodeError> {
        let conn = self.swarm.connect(&record.to_addr_info()).await?;
        self.dht.observe(conn.remote_info()).await;
        Ok(())
    }

    /// Send `payload` on the configured protocol
    pub async fn send(&self, peer: &PeerId, payload: impl Into<Bytes>) -> Result<(), NodeError> {
        self.protocol.send(peer, payload.into()).await?;
        Ok(())
    }

    pub async fn send_on(&self, peer: &PeerId, protocol: &str, payload: impl Into<Bytes>) -> Result<(), NodeError> {
        self.protocol.send_on(peer, protocol, payload.into()).await?;
        Ok(())
    }

    pub async fn register_handler<F>(&self, protocol: &str, handler: F)
    where
        F: Fn(PeerId, Bytes) + Send + Sync + 'static,
    {
        self.protocol.register_handler(protocol, handler).await;
    }

    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.swarm.listen_addrs()
    }

    /// Listen addresses with the `/p2p/` suffix, ready to hand out as
    /// bootstrap addresses
    pub fn full_addrs(&self) -> Vec<Multiaddr> {
        self.swarm.full_addrs()
    }

    pub fn address_book(&self) -> &Arc<AddressBook> {
        self.swarm.address_book()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.swarm.registry()
    }

    pub fn dht(&self) -> &Arc<Dht<Swarm>> {
        &self.dht
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_startup(
    swarm: Arc<Swarm>,
    dht: Arc<Dht<Swarm>>,
    seeds: Vec<PeerAddrInfo>,
    no_bootstrap: bool,
    shutdown: CancellationToken,
) -> Result<(), NodeError> {
    if no_bootstrap {
        log::info!("Bootstrap disabled");
    } else {
        Bootstrapper::new(swarm.clone()).connect(&seeds, &shutdown).await?;
    }

    let connected = swarm.registry().connected_peers().await;
    dht.bootstrap(&connected, &shutdown).await?;

    for addr in swarm.full_addrs() {
        log::info!("Node address can be reached at {}", addr);
    }
    Ok(())
}

async fn run_events(
    mut events: mpsc::Receiver<InboundEvent>,
    swarm: Arc<Swarm>,
    dht: Arc<Dht<Swarm>>,
    protocol: Arc<StreamProtocol>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            InboundEvent::Connection(conn) => {
                let remote = conn.remote_info();
                swarm.adopt(conn).await;
                dht.observe(remote).await;
            }
            InboundEvent::Stream(stream) if stream.protocol() == KAD_PROTOCOL => {
                tokio::spawn(serve_inbound(stream, dht.clone(), shutdown.clone()));
            }
            InboundEvent::Stream(stream) => {
                let protocol = protocol.clone();
                tokio::spawn(async move { protocol.dispatch(stream).await });
            }
        }
    }

    log::debug!("Inbound event loop stopped");
}

async fn run_addr_gc(address_book: Arc<AddressBook>, period: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                address_book.gc().await;
            }
        }
    }
}
