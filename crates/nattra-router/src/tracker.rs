//! Connection tracker
//!
//! Keeps every established connection in one of two disjoint maps. A
//! connection starts in `new`, is promoted to `open` by the next liveness
//! check and is closed by any later check that finds it silent.

use crate::config::RouterConfig;
use crate::message::{CloseReason, Connection};
use nattra_core::{
    ConnectionMessage, Context, Datagram, FailureDetector, NodeId, Payload, TimerId,
};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Connection liveness tracker
pub struct ConnectionTracker<F> {
    open: HashMap<NodeId, Connection>,
    fresh: HashMap<NodeId, Connection>,
    heard: HashSet<NodeId>,
    heartbeat_interval: Duration,
    check_interval: Duration,
    heartbeat_timer: Option<TimerId>,
    check_timer: Option<TimerId>,
    round: u64,
    detector: F,
}

impl<F: FailureDetector> ConnectionTracker<F> {
    /// Create a tracker reporting to `detector`
    #[must_use]
    pub fn new(config: &RouterConfig, detector: F) -> Self {
        Self {
            open: HashMap::new(),
            fresh: HashMap::new(),
            heard: HashSet::new(),
            heartbeat_interval: config.heartbeat_interval,
            check_interval: config.heartbeat_check_interval,
            heartbeat_timer: None,
            check_timer: None,
            round: 0,
            detector,
        }
    }

    /// Arm the periodic heartbeat and check timers
    pub fn start(&mut self, ctx: &mut dyn Context) {
        self.stop(ctx);
        self.heartbeat_timer =
            Some(ctx.schedule_periodic(self.heartbeat_interval, self.heartbeat_interval));
        self.check_timer = Some(ctx.schedule_periodic(self.check_interval, self.check_interval));
    }

    /// Cancel the periodic timers
    pub fn stop(&mut self, ctx: &mut dyn Context) {
        if let Some(timer) = self.heartbeat_timer.take() {
            ctx.cancel(timer);
        }
        if let Some(timer) = self.check_timer.take() {
            ctx.cancel(timer);
        }
    }

    /// Register a connection
    ///
    /// Returns true if the remote node had no connection yet. An existing
    /// connection to the same node is replaced in place and the detector
    /// moves to the new remote address.
    pub fn register(&mut self, connection: Connection) -> bool {
        let id = connection.remote_id();
        let existing = match self.open.get_mut(&id) {
            Some(existing) => Some(existing),
            None => self.fresh.get_mut(&id),
        };
        if let Some(existing) = existing {
            if existing.remote != connection.remote {
                self.detector.unfollow(&existing.remote);
                self.detector.follow(&connection.remote);
            }
            *existing = connection;
            return false;
        }

        self.detector.follow(&connection.remote);
        self.fresh.insert(id, connection);
        true
    }

    /// Connection to `id`, new or open
    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<&Connection> {
        self.open.get(&id).or_else(|| self.fresh.get(&id))
    }

    /// True if a connection to `id` exists
    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    /// True if the connection to `id` survived at least one check
    #[must_use]
    pub fn is_open(&self, id: NodeId) -> bool {
        self.open.contains_key(&id)
    }

    /// Number of connections, new and open
    #[must_use]
    pub fn len(&self) -> usize {
        self.open.len() + self.fresh.len()
    }

    /// True if there are no connections
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove the connection to `id`
    pub fn remove(&mut self, id: NodeId) -> Option<Connection> {
        let connection = self.open.remove(&id).or_else(|| self.fresh.remove(&id))?;
        self.heard.remove(&id);
        self.detector.unfollow(&connection.remote);
        Some(connection)
    }

    /// Send `Close` to the peer and remove the connection
    pub fn close(&mut self, ctx: &mut dyn Context, id: NodeId) -> Option<Connection> {
        let connection = self.remove(id)?;
        ctx.send(Datagram::new(
            connection.local,
            connection.remote,
            Payload::Connection(ConnectionMessage::Close),
        ));
        Some(connection)
    }

    /// Record a heartbeat from `id`
    pub fn heard_from(&mut self, id: NodeId) -> bool {
        if self.contains(id) {
            self.heard.insert(id);
            true
        } else {
            tracing::debug!("Heartbeat from unknown node {}", id);
            false
        }
    }

    /// Handle a timer; `None` if the timer is not ours
    ///
    /// Returns the connections closed by a liveness check.
    pub fn handle_timeout(
        &mut self,
        ctx: &mut dyn Context,
        timer: TimerId,
    ) -> Option<Vec<(Connection, CloseReason)>> {
        if Some(timer) == self.heartbeat_timer {
            self.send_heartbeats(ctx);
            Some(Vec::new())
        } else if Some(timer) == self.check_timer {
            Some(self.check())
        } else {
            None
        }
    }

    fn send_heartbeats(&mut self, ctx: &mut dyn Context) {
        let round = self.round;
        self.round = self.round.wrapping_add(1);

        for connection in self.open.values().chain(self.fresh.values()) {
            ctx.send(Datagram::new(
                connection.local,
                connection.remote,
                Payload::Connection(ConnectionMessage::Heartbeat { id: round }),
            ));
        }
        tracing::trace!("Heartbeat round {} to {} connection(s)", round, self.len());
    }

    fn check(&mut self) -> Vec<(Connection, CloseReason)> {
        let silent: Vec<NodeId> = self
            .open
            .keys()
            .filter(|id| !self.heard.contains(*id))
            .copied()
            .collect();

        let mut closed = Vec::with_capacity(silent.len());
        for id in silent {
            if let Some(connection) = self.open.remove(&id) {
                self.detector.unfollow(&connection.remote);
                tracing::info!("Connection {} silent, closing", connection);
                closed.push((connection, CloseReason::HeartbeatTimeout));
            }
        }

        self.open.extend(self.fresh.drain());
        self.heard.clear();
        closed
    }
}
