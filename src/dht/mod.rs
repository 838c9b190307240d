//! Kademlia DHT for peer discovery
//!
//! Only peer routing is implemented: peers are found by id through iterative
//! FIND_NODE lookups over an XOR-metric routing table. There is no value
//! storage.

pub mod distance;
pub mod lookup;
pub mod routing;
pub mod rpc;

pub use distance::Distance;
pub use lookup::{Dht, DhtConfig, KadNetwork, LookupError, ALPHA};
pub use routing::{InsertOutcome, RoutingTable, K};
pub use rpc::{serve_inbound, RpcError, KAD_PROTOCOL};
