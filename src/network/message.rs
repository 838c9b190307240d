//! Wire messages for the overlay
//!
//! Control frames (handshake, stream negotiation, DHT RPC, keep-alive) are
//! JSON-encoded [`Message`] values. Application payloads on accepted streams
//! are raw frames and never pass through this type.

use crate::crypto::{verify_binding, verify_signature, KeyError, PeerId, PeerIdentity};
use crate::network::multiaddr::{Multiaddr, PeerAddrInfo};
use serde::{Deserialize, Serialize};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Magic bytes for message framing
pub const MAGIC: [u8; 4] = [0x4F, 0x56, 0x4C, 0x59]; // "OVLY"

/// Largest frame accepted by the codec (4 MiB)
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// What a freshly opened socket is for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Purpose {
    /// The long-lived control channel of a logical connection
    Connection,
    /// A protocol-tagged stream
    Stream { protocol: String },
}

/// First frame on every socket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub version: u32,
    pub peer_id: PeerId,
    /// Compressed public key, hex
    pub public_key: String,
    /// Where the sender accepts connections
    pub listen_addr: Multiaddr,
    pub purpose: Purpose,
    /// Compact ECDSA signature over the fields above, hex
    pub signature: String,
}

impl Hello {
    /// Build and sign a hello for the local identity
    pub fn new(identity: &PeerIdentity, listen_addr: Multiaddr, purpose: Purpose) -> Self {
        let mut hello = Self {
            version: PROTOCOL_VERSION,
            peer_id: identity.peer_id(),
            public_key: identity.public_key_hex(),
            listen_addr,
            purpose,
            signature: String::new(),
        };
        hello.signature = hex::encode(identity.sign(&hello.transcript()));
        hello
    }

    fn transcript(&self) -> Vec<u8> {
        let purpose = match &self.purpose {
            Purpose::Connection => "connection".to_string(),
            Purpose::Stream { protocol } => format!("stream:{}", protocol),
        };
        format!(
            "overlay-hello|{}|{}|{}|{}|{}",
            self.version, self.peer_id, self.public_key, self.listen_addr, purpose
        )
        .into_bytes()
    }

    /// Check the id/key binding and the signature
    pub fn verify(&self) -> Result<(), KeyError> {
        let public_key = verify_binding(&self.peer_id, &self.public_key)?;
        let signature = hex::decode(&self.signature).map_err(|_| KeyError::InvalidSignature)?;
        if !verify_signature(&public_key, &self.transcript(), &signature) {
            return Err(KeyError::InvalidSignature);
        }
        Ok(())
    }
}

/// Network message types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Handshake sent first on every socket
    Hello(Hello),

    /// The stream's protocol has a handler on the remote side
    StreamAccepted,

    /// The stream was refused; carries the reason
    StreamRejected(String),

    /// Ask for the peers closest to `target`
    FindNode { target: PeerId },

    /// Closest known peers, answer to `FindNode`
    Nodes(Vec<PeerAddrInfo>),

    /// Keep-alive ping
    Ping(u64),

    /// Keep-alive pong response
    Pong(u64),
}

impl Message {
    /// Serialize message to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize message from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Get message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Hello(_) => "Hello",
            Message::StreamAccepted => "StreamAccepted",
            Message::StreamRejected(_) => "StreamRejected",
            Message::FindNode { .. } => "FindNode",
            Message::Nodes(_) => "Nodes",
            Message::Ping(_) => "Ping",
            Message::Pong(_) => "Pong",
        }
    }
}
