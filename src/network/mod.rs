//! P2P networking
//!
//! # Features
//! - Multiaddr-style peer addresses
//! - Signed handshakes over framed TCP
//! - Protocol-tagged streams, reused per (peer, protocol)
//! - Address book with TTL expiry
//! - Bootstrap from a list of seed peers

pub mod addrbook;
pub mod bootstrap;
pub mod message;
pub mod multiaddr;
pub mod protocol;
pub mod registry;
pub mod swarm;
pub mod transport;

pub use addrbook::{AddressBook, PeerRecord, CONNECTED_ADDR_TTL, DHT_ADDR_TTL, PERMANENT_ADDR_TTL};
pub use bootstrap::{BootstrapError, Bootstrapper};
pub use message::{Hello, Message, Purpose, MAGIC, MAX_FRAME_SIZE, PROTOCOL_VERSION};
pub use multiaddr::{AddrParseError, Multiaddr, PeerAddrInfo};
pub use protocol::{Handler, OpenError, SendError, StreamProtocol, DEFAULT_PROTOCOL};
pub use registry::{ConnectionRegistry, Registered};
pub use swarm::Swarm;
pub use transport::{
    Connection, DialError, Direction, FrameCodec, Host, InboundEvent, InboundStream, Stream,
    StreamError,
};
