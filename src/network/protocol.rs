//! Application stream protocol
//!
//! Handlers are registered per protocol id. Outbound payloads travel as one
//! frame each over a stream that is opened once per (peer, protocol) and
//! reused by later sends.

use crate::crypto::PeerId;
use crate::dht::{Dht, LookupError};
use crate::network::addrbook::DHT_ADDR_TTL;
use crate::network::swarm::Swarm;
use crate::network::transport::{Connection, DialError, InboundStream, Stream, StreamError};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Default application protocol id
pub const DEFAULT_PROTOCOL: &str = "/dotcon/0.5";

/// Called with the sender and the payload of every inbound frame
pub type Handler = Arc<dyn Fn(PeerId, Bytes) + Send + Sync>;

/// Why no stream to a peer could be obtained
#[derive(Error, Debug)]
pub enum OpenError {
    #[error(transparent)]
    Dial(#[from] DialError),
    #[error(transparent)]
    Lookup(#[from] LookupError),
    #[error(transparent)]
    Stream(#[from] StreamError),
}

#[derive(Error, Debug)]
pub enum SendError {
    #[error("Could not reach peer {peer}: {source}")]
    DialFailed {
        peer: PeerId,
        #[source]
        source: OpenError,
    },
    #[error("Write to peer {peer} failed: {source}")]
    WriteFailed {
        peer: PeerId,
        #[source]
        source: StreamError,
    },
}

pub struct StreamProtocol {
    default_protocol: String,
    swarm: Arc<Swarm>,
    dht: Arc<Dht<Swarm>>,
    handlers: RwLock<HashMap<String, Handler>>,
    shutdown: CancellationToken,
}

impl StreamProtocol {
    pub fn new(
        default_protocol: impl Into<String>,
        swarm: Arc<Swarm>,
        dht: Arc<Dht<Swarm>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            default_protocol: default_protocol.into(),
            swarm,
            dht,
            handlers: RwLock::new(HashMap::new()),
            shutdown,
        }
    }

    pub fn default_protocol(&self) -> &str {
        &self.default_protocol
    }

    /// Install the handler for `protocol`, replacing any previous one
    pub async fn register_handler<F>(&self, protocol: &str, handler: F)
    where
        F: Fn(PeerId, Bytes) + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write().await;
        if handlers.insert(protocol.to_string(), Arc::new(handler)).is_some() {
            log::warn!("Replaced handler for protocol {}", protocol);
        } else {
            log::info!("Registered handler for protocol {}", protocol);
        }
    }

    /// Send `payload` on the default protocol
    pub async fn send(&self, peer: &PeerId, payload: Bytes) -> Result<(), SendError> {
        self.send_on(peer, &self.default_protocol, payload).await
    }

    /// Send `payload` as one frame, reusing the open stream for
    /// (peer, protocol) when there is one
    pub async fn send_on(&self, peer: &PeerId, protocol: &str, payload: Bytes) -> Result<(), SendError> {
        let registry = self.swarm.registry();
        let stream = registry
            .get_or_create_stream(peer, protocol, || self.open_stream(peer, protocol))
            .await
            .map_err(|source| SendError::DialFailed { peer: *peer, source })?;

        self.write_or_evict(peer, &stream, payload).await
    }

    /// Write one frame on `stream`; on failure the stream is closed and
    /// forgotten so no later send picks it up
    pub(crate) async fn write_or_evict(&self, peer: &PeerId, stream: &Stream, payload: Bytes) -> Result<(), SendError> {
        if let Err(source) = stream.write_frame(payload).await {
            stream.mark_closed();
            self.swarm
                .registry()
                .evict_stream(peer, stream.protocol(), stream.id())
                .await;
            return Err(SendError::WriteFailed { peer: *peer, source });
        }

        log::debug!("Sent frame on {} to {}", stream.protocol(), peer);
        Ok(())
    }

    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> Result<Stream, OpenError> {
        let conn = self.ensure_connection(peer).await?;
        Ok(conn.open_stream(protocol).await?)
    }

    /// Registry first, then the address book, then a DHT lookup. The peer
    /// lands in the routing table either way.
    async fn ensure_connection(&self, peer: &PeerId) -> Result<Arc<Connection>, OpenError> {
        let conn = match self.swarm.connect_known(peer).await {
            Ok(conn) => conn,
            Err(e) => {
                if !matches!(e, DialError::NoAddresses(_)) {
                    log::debug!("Known addresses of {} failed: {}", peer, e);
                }
                log::info!("Looking up {} before sending", peer);
                let record = self.dht.find_peer(peer, &self.shutdown).await?;
                let info = record.to_addr_info();
                self.swarm
                    .address_book()
                    .add_info(&info, DHT_ADDR_TTL)
                    .await;
                self.swarm.connect(&info).await?
            }
        };

        self.dht.observe(conn.remote_info()).await;
        Ok(conn)
    }

    /// Route an inbound stream to its handler, or reject it
    pub async fn dispatch(&self, inbound: InboundStream) {
        let handler = self.handlers.read().await.get(inbound.protocol()).cloned();
        let Some(handler) = handler else {
            log::warn!(
                "Rejecting stream for unregistered protocol {} from {}",
                inbound.protocol(),
                inbound.remote_peer()
            );
            inbound.reject("protocol not supported").await;
            return;
        };

        let peer = inbound.remote_peer();
        let stream = match inbound.accept().await {
            Ok(stream) => Arc::new(stream),
            Err(e) => {
                log::warn!("Could not accept stream from {}: {}", peer, e);
                return;
            }
        };

        let registry = self.swarm.registry().clone();
        if registry
            .register_inbound_stream(&peer, stream.clone())
            .await
            .is_none()
        {
            log::debug!("Serving untracked {} stream from {}", stream.protocol(), peer);
        }

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    frame = stream.read_frame() => frame,
                };
                match frame {
                    Ok(Some(frame)) => handler(peer, frame.freeze()),
                    Ok(None) => break,
                    Err(e) => {
                        log::debug!("Stream from {} failed: {}", peer, e);
                        break;
                    }
                }
            }
            stream.close().await;
            registry.remove_stream(&peer, stream.id()).await;
        });
    }
}
