//! # NATTRA Transport
//!
//! Runs NATTRA components over real UDP sockets.
//!
//! This crate provides:
//! - A [`Transport`] abstraction and its tokio UDP implementation
//! - An [`EventLoop`] that drives any [`nattra_core::Component`], owning its
//!   sockets, timers and command channel

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod event_loop;
pub mod transport;
pub mod udp;

pub use config::TransportConfig;
pub use event_loop::{EventLoop, EventLoopHandle};
pub use transport::{Transport, TransportError, TransportResult, TransportStats};
pub use udp::AsyncUdpTransport;
