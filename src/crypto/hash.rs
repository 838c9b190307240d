//! Hashing utilities
//!
//! Peer ids are SHA-256 digests, and handshake signatures are taken over a
//! SHA-256 digest of the signed transcript.

use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}
