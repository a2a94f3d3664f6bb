//! Wire message definitions
//!
//! The message set is closed: every datagram carries one [`Payload`] variant
//! and receiving components dispatch on it with `match`.

use crate::address::Address;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl $name {
            /// Generate a random identifier
            #[must_use]
            pub fn random() -> Self {
                Self(rand::random())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:x}", self.0)
            }
        }
    };
}

define_id!(
    /// Identifier of one classification run or one hole-punching session
    SessionId
);
define_id!(
    /// Identifier of one STUN echo probe
    EchoId
);
define_id!(
    /// Identifier of one hole-punching rendezvous message exchange
    MsgId
);
define_id!(
    /// Identifier of one direct-open handshake
    RequestId
);

/// Echo request semantics
///
/// The server answers from the same or a different IP, and the same or a
/// different port, than the one the request was sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EchoKind {
    /// Same IP, same port
    SipSp,
    /// Same IP, different port
    SipDp,
    /// Different IP, different port
    DipDp,
    /// Different IP, same port
    DipSp,
}

impl fmt::Display for EchoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SipSp => "SIP_SP",
            Self::SipDp => "SIP_DP",
            Self::DipDp => "DIP_DP",
            Self::DipSp => "DIP_SP",
        };
        f.write_str(name)
    }
}

/// STUN probe protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StunMessage {
    /// Ask a server to echo the observed source address
    EchoRequest {
        /// Probe id
        id: EchoId,
        /// Classification run
        session: SessionId,
        /// Reply semantics
        kind: EchoKind,
        /// Where the reply must go; rewritten by the forwarding server
        target: Option<Address>,
    },
    /// Echo of the observed source address
    EchoResponse {
        /// Probe id
        id: EchoId,
        /// Classification run
        session: SessionId,
        /// Reply semantics of the request
        kind: EchoKind,
        /// Client endpoint as seen by the server
        observed: Option<SocketAddr>,
    },
    /// The server cannot honour the request
    EchoReset {
        /// Probe id
        id: EchoId,
        /// Classification run
        session: SessionId,
        /// Reply semantics of the request
        kind: EchoKind,
    },
}

/// Simple hole-punching rendezvous
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShpMessage {
    /// Initiator asks a parent to relay an `Initiate` to `target`
    Relay {
        /// Initiator session
        session: SessionId,
        /// Rendezvous exchange
        msg: MsgId,
        /// Node to reach
        target: Address,
    },
    /// Parent tells a child to ping `connect_to`
    Initiate {
        /// Rendezvous exchange
        msg: MsgId,
        /// Initiator as observed by the parent
        connect_to: Address,
    },
    /// Target opens its NAT towards the initiator
    Ping {
        /// Rendezvous exchange
        msg: MsgId,
    },
    /// Initiator answers the ping through the punched hole
    Pong {
        /// Rendezvous exchange
        msg: MsgId,
    },
    /// Target confirms the hole, echoing the initiator's observed address
    Ready {
        /// Rendezvous exchange
        msg: MsgId,
        /// Initiator as observed by the target
        observed: Address,
    },
}

/// Direct-open handshake and connection liveness
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionMessage {
    /// Open a connection to an open node
    OpenRequest {
        /// Handshake id
        id: RequestId,
    },
    /// Acknowledge an open request
    OpenResponse {
        /// Handshake id
        id: RequestId,
        /// Requester as observed by the responder
        observed: Address,
    },
    /// Connection keepalive
    Heartbeat {
        /// Heartbeat round of the sender
        id: u64,
    },
    /// Explicit connection teardown
    Close,
}

/// Everything a datagram can carry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// STUN probe traffic
    Stun(StunMessage),
    /// Hole-punching traffic
    Shp(ShpMessage),
    /// Connection protocol traffic
    Connection(ConnectionMessage),
    /// Opaque application bytes
    Application(Vec<u8>),
}

impl Payload {
    /// Message type name used in logs
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Stun(StunMessage::EchoRequest { .. }) => "EchoRequest",
            Self::Stun(StunMessage::EchoResponse { .. }) => "EchoResponse",
            Self::Stun(StunMessage::EchoReset { .. }) => "EchoReset",
            Self::Shp(ShpMessage::Relay { .. }) => "Relay",
            Self::Shp(ShpMessage::Initiate { .. }) => "Initiate",
            Self::Shp(ShpMessage::Ping { .. }) => "Ping",
            Self::Shp(ShpMessage::Pong { .. }) => "Pong",
            Self::Shp(ShpMessage::Ready { .. }) => "Ready",
            Self::Connection(ConnectionMessage::OpenRequest { .. }) => "OpenRequest",
            Self::Connection(ConnectionMessage::OpenResponse { .. }) => "OpenResponse",
            Self::Connection(ConnectionMessage::Heartbeat { .. }) => "Heartbeat",
            Self::Connection(ConnectionMessage::Close) => "Close",
            Self::Application(_) => "Application",
        }
    }

    /// True for traffic consumed by the traversal layer itself
    #[must_use]
    pub fn is_internal(&self) -> bool {
        !matches!(self, Self::Application(_))
    }
}

/// An addressed UDP datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Sender
    pub src: Address,
    /// Receiver
    pub dst: Address,
    /// Content
    pub payload: Payload,
}

impl Datagram {
    /// Create a new datagram
    #[must_use]
    pub fn new(src: Address, dst: Address, payload: Payload) -> Self {
        Self { src, dst, payload }
    }

    /// Reply datagram with source and destination swapped
    #[must_use]
    pub fn reply(&self, payload: Payload) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
            payload,
        }
    }
}

impl fmt::Display for Datagram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.payload.message_type(), self.src, self.dst)
    }
}
