//! NAT descriptors and traversal feasibility
//!
//! A [`NatDescriptor`] is the outcome of a classification run and describes
//! how a node can be reached:
//!
//! - **Open**: public address, directly reachable
//! - **Firewalled**: public address, but unsolicited inbound traffic is blocked
//! - **UdpBlocked**: no UDP reachability at all
//! - **Nated**: behind a NAT whose mapping, allocation and filtering
//!   behaviour has been measured
//!
//! [`feasibility`] decides from two descriptors whether traffic between the
//! nodes can be sent directly, needs hole punching, or cannot be delivered.

use crate::address::Address;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether a NAT reuses a public mapping across destinations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MappingPolicy {
    /// Same public endpoint for every destination
    EndpointIndependent,
    /// New public endpoint per destination IP
    HostDependent,
    /// New public endpoint per destination IP and port
    PortDependent,
}

/// Which inbound sources a NAT lets through an existing mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilteringPolicy {
    /// Any source
    EndpointIndependent,
    /// Sources whose IP was contacted
    HostDependent,
    /// Sources whose IP and port were contacted
    PortDependent,
}

/// How a NAT picks the public port of a new mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocationPolicy {
    /// Public port equals the private port
    PortPreservation,
    /// Public ports follow the private port with a fixed delta
    PortContiguity(u16),
    /// Unpredictable public port
    Random,
}

impl AllocationPolicy {
    /// Contiguity delta, present only for [`AllocationPolicy::PortContiguity`]
    #[must_use]
    pub fn delta(&self) -> Option<u16> {
        match self {
            Self::PortContiguity(delta) => Some(*delta),
            _ => None,
        }
    }
}

/// Measured behaviour of a NAT device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatBehavior {
    /// Mapping policy
    pub mapping: MappingPolicy,
    /// Port allocation policy
    pub allocation: AllocationPolicy,
    /// Inbound filtering policy
    pub filtering: FilteringPolicy,
    /// Rendezvous relays for this node
    pub parents: Vec<Address>,
}

impl NatBehavior {
    /// Behaviour without parents
    #[must_use]
    pub fn new(
        mapping: MappingPolicy,
        allocation: AllocationPolicy,
        filtering: FilteringPolicy,
    ) -> Self {
        Self {
            mapping,
            allocation,
            filtering,
            parents: Vec::new(),
        }
    }

    /// Replace the parent list
    #[must_use]
    pub fn with_parents(mut self, parents: Vec<Address>) -> Self {
        self.parents = parents;
        self
    }
}

/// Reachability class of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NatDescriptor {
    /// Directly reachable
    Open,
    /// Public address behind a blocking firewall
    Firewalled,
    /// No UDP connectivity
    UdpBlocked,
    /// Behind a NAT
    Nated(NatBehavior),
}

impl NatDescriptor {
    /// True for [`NatDescriptor::Open`]
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Measured NAT behaviour, if any
    #[must_use]
    pub fn behavior(&self) -> Option<&NatBehavior> {
        match self {
            Self::Nated(behavior) => Some(behavior),
            _ => None,
        }
    }

    /// Parents of a NAT'd node; empty for every other class
    #[must_use]
    pub fn parents(&self) -> &[Address] {
        match self {
            Self::Nated(behavior) => &behavior.parents,
            _ => &[],
        }
    }

    /// True if the node cannot be reached without rendezvous assistance
    #[must_use]
    pub fn needs_parents(&self) -> bool {
        matches!(self, Self::Nated(_))
    }

    /// Same descriptor with a new parent list
    ///
    /// Parents only apply to NAT'd nodes, other classes are returned as is.
    #[must_use]
    pub fn with_parents(self, parents: Vec<Address>) -> Self {
        match self {
            Self::Nated(behavior) => Self::Nated(behavior.with_parents(parents)),
            other => other,
        }
    }
}

impl fmt::Display for NatDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "Open"),
            Self::Firewalled => write!(f, "Firewalled"),
            Self::UdpBlocked => write!(f, "UDP blocked"),
            Self::Nated(b) => write!(
                f,
                "NAT(mapping={:?}, allocation={:?}, filtering={:?}, parents={})",
                b.mapping,
                b.allocation,
                b.filtering,
                b.parents.len()
            ),
        }
    }
}

/// Result of a traversal feasibility check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feasibility {
    /// At least one side is open
    Direct,
    /// Both sides NAT'd, simple hole punching can succeed
    HolePunchable,
    /// No supported way to connect
    Unfeasible,
}

/// Decide how `self_nat` can reach `target_nat`
///
/// Simple hole punching relies on a one-shot blind reflection, which needs an
/// endpoint-independent mapping on at least one side.
#[must_use]
pub fn feasibility(self_nat: &NatDescriptor, target_nat: &NatDescriptor) -> Feasibility {
    use NatDescriptor::{Nated, Open};

    match (self_nat, target_nat) {
        (Open, _) | (_, Open) => Feasibility::Direct,
        (Nated(a), Nated(b))
            if a.mapping == MappingPolicy::EndpointIndependent
                || b.mapping == MappingPolicy::EndpointIndependent =>
        {
            Feasibility::HolePunchable
        }
        _ => Feasibility::Unfeasible,
    }
}
