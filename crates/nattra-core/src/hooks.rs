//! Pluggable collaborators of the connection router
//!
//! The router never depends on a concrete hole-punching implementation or
//! failure detector; both are injected through these traits.

use crate::address::{Address, NodeId, PeerAddress};
use crate::context::{Context, TimerId};
use crate::message::Datagram;
use std::fmt;

/// Sub-state a hole-punching session was in when it ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PunchStage {
    /// Relay sent, waiting for the target's ping
    OpenConnection,
    /// Pong sent, waiting for the target's ready
    HolePunching,
}

impl fmt::Display for PunchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenConnection => write!(f, "open-connection"),
            Self::HolePunching => write!(f, "hole-punching"),
        }
    }
}

/// Outcome of an open-connection request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenConnection {
    /// A usable point-to-point pair was established
    Success {
        /// Local base address to send from
        local: Address,
        /// Remote address as reached through the punched hole
        remote: Address,
        /// True on the side that asked for the connection
        initiator: bool,
    },
    /// The rendezvous failed
    Failure {
        /// Node that could not be reached
        target: Address,
        /// Last sub-state before the failure
        stage: PunchStage,
    },
}

/// Hole-punching service used by the connection maker
pub trait HolePunch {
    /// Ask for a connection to a NAT'd target
    ///
    /// Returns false if no session could be started, e.g. the target has no
    /// parents. The service owns its own timeout budget.
    fn open_connection(&mut self, ctx: &mut dyn Context, target: &PeerAddress) -> bool;

    /// Abort every session this node started towards `target`
    ///
    /// Pending timers are cancelled and no outcome is reported for them.
    fn cancel(&mut self, ctx: &mut dyn Context, target: NodeId);

    /// The local address or parent list changed
    fn update_self(&mut self, self_peer: &PeerAddress);

    /// Handle a hole-punching datagram
    fn handle_datagram(&mut self, ctx: &mut dyn Context, datagram: &Datagram)
    -> Vec<OpenConnection>;

    /// True if `timer` belongs to this service
    fn owns_timer(&self, timer: TimerId) -> bool;

    /// Handle one of this service's timers
    fn handle_timeout(&mut self, ctx: &mut dyn Context, timer: TimerId) -> Vec<OpenConnection>;
}

/// Optional liveness detector used to accelerate connection teardown
pub trait FailureDetector {
    /// Start monitoring an address
    fn follow(&mut self, addr: &Address);

    /// Stop monitoring an address
    fn unfollow(&mut self, addr: &Address);
}

/// Failure detector that monitors nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFailureDetector;

impl FailureDetector for NoFailureDetector {
    fn follow(&mut self, _addr: &Address) {}

    fn unfollow(&mut self, _addr: &Address) {}
}
