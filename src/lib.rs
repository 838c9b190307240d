//! Overlay-Node: a minimal peer-to-peer overlay in Rust
//!
//! This crate provides:
//! - secp256k1 peer identities, deterministic from a seed
//! - Bootstrap against a list of known peers
//! - Kademlia peer routing (find a peer's addresses by id)
//! - Protocol-tagged streams with per-peer stream reuse
//!
//! # Example
//!
//! ```no_run
//! use overlay_node::{Node, NodeConfig};
//!
//! # async fn run() -> Result<(), overlay_node::NodeError> {
//! let node = Node::new(NodeConfig {
//!     no_bootstrap: true,
//!     ..NodeConfig::default()
//! })
//! .await?;
//! node.register_handler("/dotcon/0.5", |peer, data| {
//!     println!("{} sent {} bytes", peer, data.len());
//! })
//! .await;
//! node.started().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crypto;
pub mod dht;
pub mod network;
pub mod node;

// Re-export commonly used types
pub use config::{ConfigError, NodeConfig, DEFAULT_PORT};
pub use crypto::{PeerId, PeerIdentity};
pub use dht::{Dht, DhtConfig, LookupError};
pub use network::{Multiaddr, PeerAddrInfo, PeerRecord, SendError};
pub use node::{Node, NodeError};
