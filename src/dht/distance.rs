//! XOR distance between peer ids

use crate::crypto::{PeerId, PEER_ID_LEN};
use std::fmt;

/// Number of k-buckets: one per possible common prefix length
pub const BUCKET_COUNT: usize = PEER_ID_LEN * 8;

/// 256-bit XOR distance, ordered as a big-endian integer
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance([u8; PEER_ID_LEN]);

impl Distance {
    pub fn between(a: &PeerId, b: &PeerId) -> Self {
        let (a, b) = (a.as_bytes(), b.as_bytes());
        let mut out = [0u8; PEER_ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = a[i] ^ b[i];
        }
        Self(out)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Length of the common prefix, i.e. leading zero bits of the distance.
    /// Higher means closer; `None` for a zero distance.
    pub fn bucket_index(&self) -> Option<usize> {
        self.0
            .iter()
            .position(|b| *b != 0)
            .map(|i| i * 8 + self.0[i].leading_zeros() as usize)
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({}..)", hex::encode(&self.0[..4]))
    }
}
