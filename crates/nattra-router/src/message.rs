//! Router-facing message and event types

use crate::error::RouterError;
use nattra_core::{Address, NodeId, PeerAddress};
use std::fmt;

/// Transport protocol of an application message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Datagram traffic, routed through NAT traversal
    Udp,
    /// Stream traffic, passed through untouched
    Tcp,
}

/// Outbound application message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppMessage {
    /// Local sender address
    pub src: Address,
    /// Destination and its NAT class
    pub dst: PeerAddress,
    /// Transport protocol
    pub protocol: Protocol,
    /// Opaque payload
    pub payload: Vec<u8>,
}

impl AppMessage {
    /// Create a UDP application message
    #[must_use]
    pub fn udp(src: Address, dst: PeerAddress, payload: Vec<u8>) -> Self {
        Self {
            src,
            dst,
            protocol: Protocol::Udp,
            payload,
        }
    }
}

/// Point-to-point address pair of an established connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Connection {
    /// Local base address to send from
    pub local: Address,
    /// Remote address to send to
    pub remote: Address,
    /// True if this node asked for the connection
    pub initiator: bool,
}

impl Connection {
    /// Node at the other end
    #[must_use]
    pub fn remote_id(&self) -> NodeId {
        self.remote.id
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.local, self.remote)
    }
}

/// Why a connection was removed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// Silent for a whole heartbeat check interval
    HeartbeatTimeout,
    /// The peer sent `Close`
    RemoteClosed,
    /// The failure detector suspected the peer
    Suspected,
    /// Closed through the local API
    Local,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeartbeatTimeout => write!(f, "heartbeat timeout"),
            Self::RemoteClosed => write!(f, "closed by peer"),
            Self::Suspected => write!(f, "suspected"),
            Self::Local => write!(f, "closed locally"),
        }
    }
}

/// Notification to the local application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterEvent {
    /// Application payload received for this node
    Deliver {
        /// Sender as seen on the wire
        src: Address,
        /// Opaque payload
        payload: Vec<u8>,
    },
    /// A connection was registered
    ConnectionOpened(Connection),
    /// A connection was removed
    ConnectionClosed {
        /// Removed connection
        connection: Connection,
        /// Why it was removed
        reason: CloseReason,
    },
    /// A connection attempt failed; its buffered messages were dropped
    ConnectionFailed {
        /// Unreachable node
        target: NodeId,
        /// Number of buffered messages dropped
        dropped: usize,
    },
    /// An outbound message was dropped
    Dropped {
        /// Destination of the message
        dst: NodeId,
        /// Why it was dropped
        reason: RouterError,
    },
}

/// Requests accepted by the router component
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterCommand {
    /// Route an application message
    Send(AppMessage),
    /// Close the connection to a node
    Close(NodeId),
    /// The failure detector suspects an address
    Suspect(Address),
    /// The local address or NAT class changed
    UpdateSelf(PeerAddress),
}
