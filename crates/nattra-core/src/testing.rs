//! Test support
//!
//! [`RecordingContext`] records every side effect so unit tests can drive a
//! component by hand and inspect what it sent and scheduled.

use crate::context::{Context, TimerId};
use crate::message::{Datagram, Payload};
use std::collections::BTreeMap;
use std::time::Duration;

/// A timer as scheduled by the component under test
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledTimer {
    /// Initial delay
    pub delay: Duration,
    /// Period, for periodic timers
    pub period: Option<Duration>,
}

/// A [`Context`] that records instead of acting
#[derive(Debug, Default)]
pub struct RecordingContext {
    /// Datagrams sent so far
    pub sent: Vec<Datagram>,
    /// Timers that were scheduled and not cancelled or fired
    pub active: BTreeMap<TimerId, ScheduledTimer>,
    /// Timers cancelled so far
    pub cancelled: Vec<TimerId>,
    next_timer: u64,
}

impl RecordingContext {
    /// Create an empty context
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain the sent datagrams
    pub fn take_sent(&mut self) -> Vec<Datagram> {
        std::mem::take(&mut self.sent)
    }

    /// Payloads of the sent datagrams, in order
    #[must_use]
    pub fn sent_payloads(&self) -> Vec<&Payload> {
        self.sent.iter().map(|d| &d.payload).collect()
    }

    /// True if the timer is scheduled and not cancelled
    #[must_use]
    pub fn is_active(&self, timer: TimerId) -> bool {
        self.active.contains_key(&timer)
    }

    /// Most recently scheduled timer that is still active
    #[must_use]
    pub fn last_timer(&self) -> Option<TimerId> {
        self.active.keys().next_back().copied()
    }

    /// Simulate expiry: one-shot timers stop being active, periodic ones stay
    pub fn fire(&mut self, timer: TimerId) {
        let one_shot = self
            .active
            .get(&timer)
            .is_some_and(|t| t.period.is_none());
        if one_shot {
            self.active.remove(&timer);
        }
    }

    fn allocate(&mut self, timer: ScheduledTimer) -> TimerId {
        self.next_timer += 1;
        let id = TimerId(self.next_timer);
        self.active.insert(id, timer);
        id
    }
}

impl Context for RecordingContext {
    fn send(&mut self, datagram: Datagram) {
        self.sent.push(datagram);
    }

    fn schedule_once(&mut self, delay: Duration) -> TimerId {
        self.allocate(ScheduledTimer {
            delay,
            period: None,
        })
    }

    fn schedule_periodic(&mut self, delay: Duration, period: Duration) -> TimerId {
        self.allocate(ScheduledTimer {
            delay,
            period: Some(period),
        })
    }

    fn cancel(&mut self, timer: TimerId) {
        if self.active.remove(&timer).is_some() {
            self.cancelled.push(timer);
        }
    }
}
