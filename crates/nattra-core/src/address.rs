//! Node addresses
//!
//! An [`Address`] is an immutable `(ip, port, node id)` triple. A node may own
//! several addresses at once, e.g. the two sockets used by the STUN client.
//! NAT information is never attached to an address in place; a
//! [`PeerAddress`] pairs an address with its [`NatDescriptor`] instead.

use crate::nat::NatDescriptor;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Stable node identifier
///
/// Survives NAT rewriting of the IP and port, so it is the key used for
/// connection and pending-queue lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Generate a random node identifier
    #[must_use]
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Network address of a node endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// IP and port
    pub socket: SocketAddr,
    /// Owning node
    pub id: NodeId,
}

impl Address {
    /// Create a new address
    #[must_use]
    pub const fn new(socket: SocketAddr, id: NodeId) -> Self {
        Self { socket, id }
    }

    /// IP part
    #[must_use]
    pub fn ip(&self) -> IpAddr {
        self.socket.ip()
    }

    /// Port part
    #[must_use]
    pub fn port(&self) -> u16 {
        self.socket.port()
    }

    /// Same node, different socket
    #[must_use]
    pub fn with_socket(&self, socket: SocketAddr) -> Self {
        Self {
            socket,
            id: self.id,
        }
    }

    /// True if both addresses share ip, port and id
    #[must_use]
    pub fn same_base(&self, other: &Address) -> bool {
        self == other
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.socket, self.id)
    }
}

/// An address together with the NAT descriptor of the node behind it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    /// Advertised base address
    pub base: Address,
    /// Reachability class
    pub nat: NatDescriptor,
}

impl PeerAddress {
    /// Create a new peer address
    #[must_use]
    pub fn new(base: Address, nat: NatDescriptor) -> Self {
        Self { base, nat }
    }

    /// Node identifier of the peer
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.base.id
    }

    /// Parents able to relay hole-punching requests to this peer
    #[must_use]
    pub fn parents(&self) -> &[Address] {
        self.nat.parents()
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.base, self.nat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_base() {
        let a = Address::new("10.0.0.1:4000".parse().unwrap(), NodeId(1));
        let b = Address::new("10.0.0.1:4000".parse().unwrap(), NodeId(1));
        let c = a.with_socket("10.0.0.1:4001".parse().unwrap());

        assert!(a.same_base(&b));
        assert!(!a.same_base(&c));
        assert_eq!(c.id, NodeId(1));
    }

    #[test]
    fn test_address_display() {
        let a = Address::new("10.0.0.1:4000".parse().unwrap(), NodeId(0xab));
        assert_eq!(a.to_string(), "10.0.0.1:4000@00000000000000ab");
    }

    #[test]
    fn test_peer_address_parents() {
        let a = Address::new("10.0.0.1:4000".parse().unwrap(), NodeId(1));
        let peer = PeerAddress::new(a, NatDescriptor::Open);
        assert!(peer.parents().is_empty());
        assert_eq!(peer.id(), NodeId(1));
    }
}
