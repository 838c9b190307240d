//! DHT wire protocol
//!
//! Each request opens a short-lived stream tagged [`KAD_PROTOCOL`] over the
//! peer's connection, writes one JSON request and reads one reply.

use crate::crypto::PeerId;
use crate::dht::lookup::{Dht, KadNetwork};
use crate::network::message::Message;
use crate::network::multiaddr::PeerAddrInfo;
use crate::network::swarm::Swarm;
use crate::network::transport::{DialError, InboundStream, StreamError};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Protocol id of DHT streams
pub const KAD_PROTOCOL: &str = "/overlay/kad/1.0.0";

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Dial failed: {0}")]
    Dial(#[from] DialError),
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),
    #[error("Peer closed the stream without answering")]
    NoResponse,
    #[error("Unexpected {0} reply")]
    Unexpected(&'static str),
}

impl Swarm {
    async fn request(&self, peer: &PeerAddrInfo, request: &Message) -> Result<Message, RpcError> {
        let conn = self.connect(peer).await?;
        let stream = conn.open_stream(KAD_PROTOCOL).await?;
        stream.write_message(request).await?;
        let reply = stream.read_message().await?.ok_or(RpcError::NoResponse)?;
        stream.close().await;
        Ok(reply)
    }
}

#[async_trait]
impl KadNetwork for Swarm {
    async fn find_node(&self, peer: &PeerAddrInfo, target: &PeerId) -> Result<Vec<PeerAddrInfo>, RpcError> {
        log::debug!("FIND_NODE {} -> {}", target.short(), peer.id.short());
        match self.request(peer, &Message::FindNode { target: *target }).await? {
            Message::Nodes(contacts) => Ok(contacts),
            other => Err(RpcError::Unexpected(other.type_name())),
        }
    }

    async fn ping(&self, peer: &PeerAddrInfo) -> Result<(), RpcError> {
        let nonce: u64 = rand::random();
        match self.request(peer, &Message::Ping(nonce)).await? {
            Message::Pong(n) if n == nonce => Ok(()),
            other => Err(RpcError::Unexpected(other.type_name())),
        }
    }
}

/// Answer DHT requests arriving on an inbound stream until the remote
/// closes it or `shutdown` fires
pub async fn serve_inbound(inbound: InboundStream, dht: Arc<Dht<Swarm>>, shutdown: CancellationToken) {
    let from = inbound.remote_info();
    let stream = match inbound.accept().await {
        Ok(stream) => stream,
        Err(e) => {
            log::debug!("Could not accept DHT stream from {}: {}", from.id, e);
            return;
        }
    };

    loop {
        let request = tokio::select! {
            _ = shutdown.cancelled() => break,
            request = stream.read_message() => request,
        };
        let request = match request {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                log::debug!("Bad DHT request from {}: {}", from.id, e);
                break;
            }
        };

        let reply = match request {
            Message::FindNode { target } => {
                Message::Nodes(dht.handle_find_node(Some(from.clone()), &target).await)
            }
            Message::Ping(nonce) => {
                dht.handle_ping(from.clone()).await;
                Message::Pong(nonce)
            }
            other => {
                log::warn!("Unexpected {} on DHT stream from {}", other.type_name(), from.id);
                break;
            }
        };

        if let Err(e) = stream.write_message(&reply).await {
            log::debug!("Could not answer {}: {}", from.id, e);
            break;
        }
    }

    stream.close().await;
}
