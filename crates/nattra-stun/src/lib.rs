//! # NATTRA STUN
//!
//! NAT classification by echo probing.
//!
//! A [`StunClient`] drives one [`StunSession`] per classification run
//! against two cooperating [`StunServer`]s, each owning two addresses.
//! Three reachability tests decide the filtering policy, then eight
//! address measurement probes decide the mapping and allocation policies.
//!
//! ## Example
//!
//! ```rust
//! use nattra_core::{MappingPolicy, AllocationPolicy};
//! use nattra_stun::{determine_allocation_policy, determine_mapping_policy};
//!
//! let a = "203.0.113.1:40000".parse().unwrap();
//! assert_eq!(
//!     determine_mapping_policy(&[a, a, a, a]),
//!     MappingPolicy::EndpointIndependent
//! );
//! assert_eq!(
//!     determine_allocation_policy(&[(40000, 40004), (40001, 40003)]),
//!     AllocationPolicy::PortContiguity(2)
//! );
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod error;
pub mod policy;
pub mod server;
pub mod session;

pub use client::{DEFAULT_ECHO_TIMEOUT, NatDetected, StunClient, StunClientConfig, StunCommand};
pub use error::StunError;
pub use policy::{
    CONTIGUITY_TOLERANCE, classify_allocation, determine_allocation_policy,
    determine_mapping_policy,
};
pub use server::{StunServer, StunServerStats};
pub use session::{Classification, Phase, ServerPair, StunSession};
