//! Cryptographic identity for overlay peers
//!
//! This module provides:
//! - SHA-256 hashing
//! - secp256k1 key pairs (seeded or OS-random)
//! - Peer ids derived from public keys

pub mod hash;
pub mod keys;

pub use hash::sha256;
pub use keys::{
    public_key_from_hex, verify_binding, verify_signature, KeyError, PeerId, PeerIdentity,
    PEER_ID_LEN,
};
