//! # NATTRA SHP
//!
//! Simple hole punching through an open parent node.
//!
//! The initiator asks every parent of the target to relay a rendezvous
//! request. The target pings the initiator's observed address, opening
//! its own NAT, and the initiator answers through the punched hole.
//! Both sides report the resulting address pair as an
//! [`nattra_core::OpenConnection`] outcome.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod error;
pub mod parent;
pub mod session;

pub use client::{DEFAULT_COMPLETED_CAPACITY, DEFAULT_PUNCH_TIMEOUT, ShpClient, ShpConfig};
pub use error::ShpError;
pub use parent::ShpParent;
pub use session::{CompletedSet, InitiatorSession, TargetSession};
