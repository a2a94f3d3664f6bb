//! # NATTRA Router
//!
//! Connection routing across NATs.
//!
//! [`NatTraverser`] combines three parts:
//! - a traffic tracker that rewrites, forwards or buffers outbound messages
//! - a connection maker choosing a direct open or a hole punch per target
//! - a connection tracker keeping established connections alive with
//!   heartbeats and closing silent ones
//!
//! Hole punching is injected through [`nattra_core::HolePunch`], liveness
//! hints through [`nattra_core::FailureDetector`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod maker;
pub mod message;
pub mod router;
pub mod tracker;
pub mod traffic;

pub use config::RouterConfig;
pub use error::RouterError;
pub use maker::{Attempt, ConnectionMaker, MakerOutcome};
pub use message::{
    AppMessage, CloseReason, Connection, Protocol, RouterCommand, RouterEvent,
};
pub use router::{NatTraverser, RouterStats};
pub use tracker::ConnectionTracker;
pub use traffic::TrafficTracker;
