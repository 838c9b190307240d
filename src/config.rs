//! Node configuration

use crate::dht::{DhtConfig, ALPHA, K};
use crate::network::multiaddr::{AddrParseError, PeerAddrInfo};
use crate::network::protocol::DEFAULT_PROTOCOL;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;

/// Default listen port
pub const DEFAULT_PORT: u16 = 5000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid bootstrap address: {0}")]
    InvalidBootstrapAddr(#[from] AddrParseError),
    #[error("Invalid protocol id {0:?}: must start with '/'")]
    InvalidProtocol(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Full `/…/p2p/<id>` addresses of the seed peers
    pub bootstrap_peers: Vec<String>,
    /// Interface to listen on
    pub listen_ip: IpAddr,
    /// Port to listen on; 0 picks a free one
    pub port: u16,
    /// 0 draws a random identity, anything else is deterministic
    pub key_seed: u64,
    /// Skip the bootstrap phase (first node of a network)
    pub no_bootstrap: bool,
    /// Protocol id used by `Node::send`
    pub protocol: String,
    /// Bound on a single dial, handshake or stream open
    pub dial_timeout: Duration,
    /// Bound on one DHT request
    pub query_timeout: Duration,
    pub max_lookup_rounds: usize,
    /// How often expired address book entries are dropped
    pub addr_gc_interval: Duration,
    /// Bucket size
    pub k: usize,
    /// Lookup parallelism
    pub alpha: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bootstrap_peers: Vec::new(),
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            key_seed: 0,
            no_bootstrap: false,
            protocol: DEFAULT_PROTOCOL.to_string(),
            dial_timeout: Duration::from_secs(10),
            query_timeout: Duration::from_secs(5),
            max_lookup_rounds: 20,
            addr_gc_interval: Duration::from_secs(60),
            k: K,
            alpha: ALPHA,
        }
    }
}

impl NodeConfig {
    /// Check the configuration and parse the bootstrap list
    pub fn validate(&self) -> Result<Vec<PeerAddrInfo>, ConfigError> {
        if !self.protocol.starts_with('/') {
            return Err(ConfigError::InvalidProtocol(self.protocol.clone()));
        }
        if self.k == 0 {
            return Err(ConfigError::Zero("k"));
        }
        if self.alpha == 0 {
            return Err(ConfigError::Zero("alpha"));
        }
        if self.max_lookup_rounds == 0 {
            return Err(ConfigError::Zero("max_lookup_rounds"));
        }
        if self.dial_timeout.is_zero() {
            return Err(ConfigError::Zero("dial_timeout"));
        }
        if self.query_timeout.is_zero() {
            return Err(ConfigError::Zero("query_timeout"));
        }
        if self.addr_gc_interval.is_zero() {
            return Err(ConfigError::Zero("addr_gc_interval"));
        }

        Ok(PeerAddrInfo::parse_all(&self.bootstrap_peers)?)
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_ip, self.port)
    }

    pub fn dht_config(&self) -> DhtConfig {
        DhtConfig {
            k: self.k,
            alpha: self.alpha,
            query_timeout: self.query_timeout,
            max_rounds: self.max_lookup_rounds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PeerIdentity;

    #[test]
    fn test_default_config_is_valid() {
        let config = NodeConfig::default();
        assert!(config.validate().unwrap().is_empty());
        assert_eq!(config.bind_addr(), "0.0.0.0:5000".parse().unwrap());
        assert_eq!(config.protocol, "/dotcon/0.5");
    }

    #[test]
    fn test_bootstrap_peers_are_parsed() {
        let id = PeerIdentity::generate(31).unwrap().peer_id();
        let config = NodeConfig {
            bootstrap_peers: vec![format!("/ip4/127.0.0.1/tcp/5000/ipfs/{}", id)],
            ..NodeConfig::default()
        };
        let seeds = config.validate().unwrap();
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds[0].id, id);
    }

    #[test]
    fn test_invalid_config() {
        let config = NodeConfig {
            bootstrap_peers: vec!["/ip4/127.0.0.1/tcp/5000".to_string()],
            ..NodeConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBootstrapAddr(AddrParseError::MissingPeerId))
        ));

        let config = NodeConfig {
            protocol: "dotcon".to_string(),
            ..NodeConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidProtocol(_))));

        let config = NodeConfig {
            alpha: 0,
            ..NodeConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Zero("alpha"))));

        let config = NodeConfig {
            addr_gc_interval: Duration::ZERO,
            ..NodeConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Zero("addr_gc_interval"))
        ));
    }
}
