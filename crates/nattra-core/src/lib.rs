//! # NATTRA Core
//!
//! Shared building blocks of the NATTRA NAT traversal stack.
//!
//! This crate provides:
//! - Immutable node addresses and NAT descriptors
//! - The traversal feasibility table
//! - The closed set of wire messages and their codec
//! - The event-processing [`Context`] every component talks through
//! - Trait seams for hole punching and failure detection
//! - NAT policy emulators for deterministic test fixtures
//!
//! ## Example
//!
//! ```rust
//! use nattra_core::{Feasibility, NatDescriptor, feasibility};
//!
//! let verdict = feasibility(&NatDescriptor::Open, &NatDescriptor::Firewalled);
//! assert_eq!(verdict, Feasibility::Direct);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod address;
pub mod codec;
pub mod context;
pub mod emulation;
pub mod error;
pub mod hooks;
pub mod message;
pub mod nat;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use address::{Address, NodeId, PeerAddress};
pub use codec::WireCodec;
pub use context::{Component, Context, TimerId};
pub use error::{AllocationError, CodecError};
pub use hooks::{FailureDetector, HolePunch, NoFailureDetector, OpenConnection, PunchStage};
pub use message::{
    ConnectionMessage, Datagram, EchoId, EchoKind, MsgId, Payload, RequestId, SessionId,
    ShpMessage, StunMessage,
};
pub use nat::{
    AllocationPolicy, Feasibility, FilteringPolicy, MappingPolicy, NatBehavior, NatDescriptor,
    feasibility,
};
