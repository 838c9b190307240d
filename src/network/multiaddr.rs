//! Self-describing peer addresses
//!
//! Addresses use the multi-segment text format `/ip4/1.2.3.4/tcp/5000/p2p/<id>`.
//! `ip6` is accepted in place of `ip4`, and `ipfs` as an alias of `p2p`.

use crate::crypto::PeerId;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

/// Address parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddrParseError {
    #[error("Address must start with '/'")]
    MissingLeadingSlash,
    #[error("Unknown protocol segment: {0}")]
    UnknownProtocol(String),
    #[error("Missing value for /{0}")]
    MissingValue(&'static str),
    #[error("Invalid value for /{protocol}: {value}")]
    InvalidValue {
        protocol: &'static str,
        value: String,
    },
    #[error("Address needs an ip and a tcp segment")]
    IncompleteTransport,
    #[error("Address has no /p2p/ peer id")]
    MissingPeerId,
}

/// A TCP endpoint with an optional peer id suffix
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Multiaddr {
    socket: SocketAddr,
    peer: Option<PeerId>,
}

impl Multiaddr {
    pub fn new(socket: SocketAddr) -> Self {
        Self { socket, peer: None }
    }

    /// Same address with the `/p2p/` segment set
    pub fn with_peer(&self, peer: PeerId) -> Self {
        Self {
            socket: self.socket,
            peer: Some(peer),
        }
    }

    /// Same address with the `/p2p/` segment stripped
    pub fn without_peer(&self) -> Self {
        Self::new(self.socket)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.socket
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        self.peer
    }

    /// Replace a wildcard bind ip with loopback so the address can be dialed
    pub fn dialable(socket: SocketAddr) -> Self {
        let ip = match socket.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        };
        Self::new(SocketAddr::new(ip, socket.port()))
    }

    /// Every address a listener bound to `socket` can be reached on. A
    /// wildcard bind expands to the addresses of all interfaces that are up.
    pub fn reachable(socket: SocketAddr) -> Vec<Self> {
        if !socket.ip().is_unspecified() {
            return vec![Self::new(socket)];
        }

        let mut ips = Vec::new();
        for iface in netdev::get_interfaces() {
            if !iface.is_up() {
                continue;
            }
            ips.extend(iface.ipv4.iter().map(|net| IpAddr::V4(net.addr())));
            ips.extend(iface.ipv6.iter().map(|net| IpAddr::V6(net.addr())));
        }
        Self::expand_wildcard(socket, ips)
    }

    /// Keep the interface ips usable for a wildcard bind, routable ones
    /// first and loopback last
    fn expand_wildcard(socket: SocketAddr, ips: impl IntoIterator<Item = IpAddr>) -> Vec<Self> {
        let mut usable: Vec<IpAddr> = ips
            .into_iter()
            .filter(|ip| match ip {
                IpAddr::V4(v4) => !v4.is_link_local() && !v4.is_unspecified(),
                // An ip4 wildcard does not accept ip6
                IpAddr::V6(v6) => socket.is_ipv6() && !v6.is_unicast_link_local() && !v6.is_unspecified(),
            })
            .collect();
        usable.sort_by_key(|ip| (ip.is_loopback(), *ip));
        usable.dedup();

        if usable.is_empty() {
            log::warn!("No interface addresses found for {}, advertising loopback", socket);
            return vec![Self::dialable(socket)];
        }
        usable
            .into_iter()
            .map(|ip| Self::new(SocketAddr::new(ip, socket.port())))
            .collect()
    }
}

impl fmt::Display for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.socket.ip() {
            IpAddr::V4(ip) => write!(f, "/ip4/{}", ip)?,
            IpAddr::V6(ip) => write!(f, "/ip6/{}", ip)?,
        }
        write!(f, "/tcp/{}", self.socket.port())?;
        if let Some(peer) = &self.peer {
            write!(f, "/p2p/{}", peer)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Multiaddr({})", self)
    }
}

impl FromStr for Multiaddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .trim()
            .strip_prefix('/')
            .ok_or(AddrParseError::MissingLeadingSlash)?;

        let mut ip: Option<IpAddr> = None;
        let mut port: Option<u16> = None;
        let mut peer: Option<PeerId> = None;

        let mut segments = rest.split('/').filter(|s| !s.is_empty());
        while let Some(protocol) = segments.next() {
            match protocol {
                "ip4" => {
                    let value = segments.next().ok_or(AddrParseError::MissingValue("ip4"))?;
                    let parsed: Ipv4Addr = value.parse().map_err(|_| AddrParseError::InvalidValue {
                        protocol: "ip4",
                        value: value.to_string(),
                    })?;
                    ip = Some(IpAddr::V4(parsed));
                }
                "ip6" => {
                    let value = segments.next().ok_or(AddrParseError::MissingValue("ip6"))?;
                    let parsed: Ipv6Addr = value.parse().map_err(|_| AddrParseError::InvalidValue {
                        protocol: "ip6",
                        value: value.to_string(),
                    })?;
                    ip = Some(IpAddr::V6(parsed));
                }
                "tcp" => {
                    let value = segments.next().ok_or(AddrParseError::MissingValue("tcp"))?;
                    port = Some(value.parse().map_err(|_| AddrParseError::InvalidValue {
                        protocol: "tcp",
                        value: value.to_string(),
                    })?);
                }
                "p2p" | "ipfs" => {
                    let value = segments.next().ok_or(AddrParseError::MissingValue("p2p"))?;
                    peer = Some(value.parse().map_err(|_| AddrParseError::InvalidValue {
                        protocol: "p2p",
                        value: value.to_string(),
                    })?);
                }
                other => return Err(AddrParseError::UnknownProtocol(other.to_string())),
            }
        }

        match (ip, port) {
            (Some(ip), Some(port)) => Ok(Self {
                socket: SocketAddr::new(ip, port),
                peer,
            }),
            _ => Err(AddrParseError::IncompleteTransport),
        }
    }
}

impl Serialize for Multiaddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Multiaddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A peer id together with the addresses it can be reached at.
///
/// Produced from bootstrap strings and exchanged as DHT contacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddrInfo {
    pub id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

impl PeerAddrInfo {
    pub fn new(id: PeerId, addrs: Vec<Multiaddr>) -> Self {
        Self { id, addrs }
    }

    /// Split a full `/…/p2p/<id>` address into peer id and transport address
    pub fn from_p2p_addr(addr: &Multiaddr) -> Result<Self, AddrParseError> {
        let id = addr.peer_id().ok_or(AddrParseError::MissingPeerId)?;
        Ok(Self {
            id,
            addrs: vec![addr.without_peer()],
        })
    }

    /// Parse one bootstrap string
    pub fn parse(peer: &str) -> Result<Self, AddrParseError> {
        let addr: Multiaddr = peer.parse()?;
        Self::from_p2p_addr(&addr)
    }

    /// Parse a bootstrap list, merging entries that name the same peer
    pub fn parse_all<S: AsRef<str>>(peers: &[S]) -> Result<Vec<Self>, AddrParseError> {
        let mut infos: Vec<Self> = Vec::with_capacity(peers.len());
        for peer in peers {
            let info = Self::parse(peer.as_ref())?;
            match infos.iter_mut().find(|existing| existing.id == info.id) {
                Some(existing) => {
                    for addr in info.addrs {
                        if !existing.addrs.contains(&addr) {
                            existing.addrs.push(addr);
                        }
                    }
                }
                None => infos.push(info),
            }
        }
        Ok(infos)
    }

    /// Full addresses, each carrying the `/p2p/` suffix
    pub fn p2p_addrs(&self) -> Vec<Multiaddr> {
        self.addrs.iter().map(|a| a.with_peer(self.id)).collect()
    }
}
