//! Event-processing context
//!
//! Components are plain state machines. They react to one datagram, timer
//! expiry or command at a time and talk to the outside world only through a
//! [`Context`]: sending datagrams and scheduling or cancelling timers. A
//! pending wait is an entry in a component map keyed by a [`TimerId`], never a
//! suspended task.

use crate::address::Address;
use crate::message::Datagram;
use std::fmt;
use std::time::Duration;

/// Opaque handle returned by a schedule call and consumed by cancel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// Side effects available to a component while it handles an event
pub trait Context {
    /// Send a datagram from `datagram.src`
    fn send(&mut self, datagram: Datagram);

    /// Fire once after `delay`
    fn schedule_once(&mut self, delay: Duration) -> TimerId;

    /// Fire after `delay`, then every `period`
    fn schedule_periodic(&mut self, delay: Duration, period: Duration) -> TimerId;

    /// Cancel a timer; cancelling an expired or unknown timer is a no-op
    fn cancel(&mut self, timer: TimerId);
}

/// A single-threaded event-driven node component
///
/// The driver guarantees that no two handlers of the same component run
/// concurrently.
pub trait Component {
    /// Requests from the local application
    type Command;
    /// Notifications to the local application
    type Event;

    /// Local addresses the driver must bind before starting
    fn local_addresses(&self) -> Vec<Address>;

    /// Called once before any other handler
    fn start(&mut self, ctx: &mut dyn Context) -> Vec<Self::Event>;

    /// A datagram arrived on one of the local addresses
    fn handle_datagram(&mut self, ctx: &mut dyn Context, datagram: Datagram) -> Vec<Self::Event>;

    /// A timer scheduled through `ctx` fired
    fn handle_timeout(&mut self, ctx: &mut dyn Context, timer: TimerId) -> Vec<Self::Event>;

    /// The local application issued a command
    fn handle_command(&mut self, ctx: &mut dyn Context, command: Self::Command)
    -> Vec<Self::Event>;
}
