//! Peer identity management
//!
//! Every host owns exactly one secp256k1 key pair. Its peer id is the
//! SHA-256 digest of the compressed public key, displayed in base58.

use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::hash::sha256;

/// Length of a peer id in bytes
pub const PEER_ID_LEN: usize = 32;

/// How many 32-byte draws are tried before key generation gives up
const MAX_KEY_ATTEMPTS: usize = 8;

/// Errors that can occur during key operations
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid peer id: {0}")]
    InvalidPeerId(String),
    #[error("Peer id does not match public key")]
    IdMismatch,
    #[error("Invalid signature")]
    InvalidSignature,
}

/// Stable identifier of a peer: SHA-256 of its compressed public key.
///
/// Ordering is plain byte order, which the connection registry uses to
/// break simultaneous-connect ties.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    /// Derive the peer id of a public key
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        Self(sha256(&public_key.serialize()))
    }

    pub fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// A random id with no key behind it (routing table fill, tests)
    pub fn random() -> Self {
        let mut bytes = [0u8; PEER_ID_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    pub fn to_base58(&self) -> String {
        bs58::encode(self.0).into_string()
    }

    /// First few characters, for log lines
    pub fn short(&self) -> String {
        let full = self.to_base58();
        full.chars().take(10).collect()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl FromStr for PeerId {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| KeyError::InvalidPeerId(e.to_string()))?;
        let bytes: [u8; PEER_ID_LEN] = bytes.try_into().map_err(|v: Vec<u8>| {
            KeyError::InvalidPeerId(format!("expected {} bytes, got {}", PEER_ID_LEN, v.len()))
        })?;
        Ok(Self(bytes))
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The local host's key pair and the peer id derived from it.
///
/// The secret key is never serialized and never leaves this struct; it is
/// only used to sign handshake transcripts.
#[derive(Clone)]
pub struct PeerIdentity {
    secret_key: SecretKey,
    public_key: PublicKey,
    peer_id: PeerId,
}

impl PeerIdentity {
    /// Generate an identity.
    ///
    /// A zero seed draws from the OS CSPRNG. Any other seed drives a
    /// deterministic generator, so the same seed always yields the same
    /// identity.
    pub fn generate(seed: u64) -> Result<Self, KeyError> {
        if seed == 0 {
            Self::generate_with(&mut OsRng)
        } else {
            Self::generate_with(&mut StdRng::seed_from_u64(seed))
        }
    }

    /// Generate an identity from an arbitrary randomness source
    pub fn generate_with<R: RngCore>(rng: &mut R) -> Result<Self, KeyError> {
        let mut bytes = [0u8; 32];
        for _ in 0..MAX_KEY_ATTEMPTS {
            rng.try_fill_bytes(&mut bytes)
                .map_err(|e| KeyError::KeyGeneration(e.to_string()))?;
            // Zero or above the curve order: draw again
            if let Ok(secret_key) = SecretKey::from_slice(&bytes) {
                return Ok(Self::from_secret_key(secret_key));
            }
        }
        Err(KeyError::KeyGeneration(format!(
            "no valid secret key after {} draws",
            MAX_KEY_ATTEMPTS
        )))
    }

    /// Create an identity from an existing secret key
    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);
        Self {
            secret_key,
            public_key,
            peer_id: PeerId::from_public_key(&public_key),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Get the public key as a hex string (compressed format)
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.serialize())
    }

    /// Sign arbitrary data; the SHA-256 digest of `data` is what gets signed
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        let secp = Secp256k1::new();
        let message = Message::from_digest(sha256(data));
        let signature = secp.sign_ecdsa(&message, &self.secret_key);
        signature.serialize_compact().to_vec()
    }
}

impl fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerIdentity")
            .field("peer_id", &self.peer_id)
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

/// Parse a public key from hex string
pub fn public_key_from_hex(hex_key: &str) -> Result<PublicKey, KeyError> {
    let bytes = hex::decode(hex_key).map_err(|_| KeyError::InvalidPublicKey)?;
    PublicKey::from_slice(&bytes).map_err(|_| KeyError::InvalidPublicKey)
}

/// Check that `public_key_hex` really is the key behind `peer_id`
pub fn verify_binding(peer_id: &PeerId, public_key_hex: &str) -> Result<PublicKey, KeyError> {
    let public_key = public_key_from_hex(public_key_hex)?;
    if PeerId::from_public_key(&public_key) != *peer_id {
        return Err(KeyError::IdMismatch);
    }
    Ok(public_key)
}

/// Verify a compact signature made by [`PeerIdentity::sign`]
pub fn verify_signature(public_key: &PublicKey, data: &[u8], signature: &[u8]) -> bool {
    let secp = Secp256k1::new();
    let message = Message::from_digest(sha256(data));
    match secp256k1::ecdsa::Signature::from_compact(signature) {
        Ok(sig) => secp.verify_ecdsa(&message, &sig, public_key).is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_identity_is_deterministic() {
        let a = PeerIdentity::generate(1).unwrap();
        let b = PeerIdentity::generate(1).unwrap();
        assert_eq!(a.peer_id(), b.peer_id());
        assert_eq!(a.public_key_hex(), b.public_key_hex());
    }

    #[test]
    fn test_distinct_seeds_give_distinct_ids() {
        let a = PeerIdentity::generate(1).unwrap();
        let b = PeerIdentity::generate(2).unwrap();
        assert_ne!(a.peer_id(), b.peer_id());
    }

    #[test]
    fn test_zero_seed_is_random() {
        let a = PeerIdentity::generate(0).unwrap();
        let b = PeerIdentity::generate(0).unwrap();
        assert_ne!(a.peer_id(), b.peer_id());
    }

    #[test]
    fn test_peer_id_base58_round_trip() {
        let id = PeerIdentity::generate(7).unwrap().peer_id();
        let parsed: PeerId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);

        assert!("not-base58-0OIl".parse::<PeerId>().is_err());
        assert!(bs58::encode([1u8; 8]).into_string().parse::<PeerId>().is_err());
    }

    #[test]
    fn test_sign_and_verify() {
        let identity = PeerIdentity::generate(3).unwrap();
        let signature = identity.sign(b"transcript");
        assert!(verify_signature(identity.public_key(), b"transcript", &signature));
        assert!(!verify_signature(identity.public_key(), b"tampered", &signature));
    }

    #[test]
    fn test_verify_binding() {
        let identity = PeerIdentity::generate(4).unwrap();
        let other = PeerIdentity::generate(5).unwrap();

        assert!(verify_binding(&identity.peer_id(), &identity.public_key_hex()).is_ok());
        assert!(matches!(
            verify_binding(&other.peer_id(), &identity.public_key_hex()),
            Err(KeyError::IdMismatch)
        ));
    }

    #[test]
    fn test_failing_rng_reports_key_generation_error() {
        struct Broken;
        impl RngCore for Broken {
            fn next_u32(&mut self) -> u32 {
                0
            }
            fn next_u64(&mut self) -> u64 {
                0
            }
            fn fill_bytes(&mut self, dest: &mut [u8]) {
                dest.fill(0);
            }
            fn try_fill_bytes(&mut self, _dest: &mut [u8]) -> Result<(), rand::Error> {
                Err(rand::Error::new(std::io::Error::other("entropy unavailable")))
            }
        }

        assert!(matches!(
            PeerIdentity::generate_with(&mut Broken),
            Err(KeyError::KeyGeneration(_))
        ));
    }

    #[test]
    fn test_all_zero_draws_are_rejected() {
        struct Zeros;
        impl RngCore for Zeros {
            fn next_u32(&mut self) -> u32 {
                0
            }
            fn next_u64(&mut self) -> u64 {
                0
            }
            fn fill_bytes(&mut self, dest: &mut [u8]) {
                dest.fill(0);
            }
            fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
                dest.fill(0);
                Ok(())
            }
        }

        assert!(matches!(
            PeerIdentity::generate_with(&mut Zeros),
            Err(KeyError::KeyGeneration(_))
        ));
    }
}
