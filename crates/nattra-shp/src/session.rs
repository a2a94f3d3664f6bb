//! Rendezvous session state

use nattra_core::{Address, MsgId, PunchStage, SessionId, TimerId};
use std::collections::{HashSet, VecDeque};

/// Initiator side of one rendezvous
#[derive(Debug, Clone)]
pub struct InitiatorSession {
    /// Session id carried in the relay
    pub id: SessionId,
    /// Message id shared by every relay of this session
    pub msg: MsgId,
    /// Node being reached
    pub target: Address,
    /// Current sub-state
    pub stage: PunchStage,
    /// Pending message timeout
    pub timer: TimerId,
    /// Target as observed on its ping
    pub remote: Option<Address>,
}

impl InitiatorSession {
    /// New session waiting for the target's ping
    #[must_use]
    pub fn new(id: SessionId, msg: MsgId, target: Address, timer: TimerId) -> Self {
        Self {
            id,
            msg,
            target,
            stage: PunchStage::OpenConnection,
            timer,
            remote: None,
        }
    }
}

/// Target side of one rendezvous
#[derive(Debug, Clone)]
pub struct TargetSession {
    /// Message id of the initiate
    pub msg: MsgId,
    /// Initiator as observed by the parent
    pub connect_to: Address,
    /// Pending ping timeout
    pub timer: TimerId,
}

/// Bounded memory of finished message ids
///
/// Once full, the oldest id is forgotten first.
#[derive(Debug)]
pub struct CompletedSet {
    order: VecDeque<MsgId>,
    members: HashSet<MsgId>,
    capacity: usize,
}

impl CompletedSet {
    /// Create a set remembering at most `capacity` ids
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Remember an id
    pub fn insert(&mut self, msg: MsgId) {
        if self.capacity == 0 || !self.members.insert(msg) {
            return;
        }
        self.order.push_back(msg);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
    }

    /// True if the id finished recently
    #[must_use]
    pub fn contains(&self, msg: &MsgId) -> bool {
        self.members.contains(msg)
    }

    /// Number of remembered ids
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True if nothing is remembered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
