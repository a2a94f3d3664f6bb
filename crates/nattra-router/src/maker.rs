//! Connection maker
//!
//! Opens connections either directly, with an `OpenRequest` to an open
//! node, or through the injected [`HolePunch`] service for NAT'd nodes.
//! At most one attempt per destination node is pending at a time.

use crate::message::Connection;
use nattra_core::{
    ConnectionMessage, Context, Datagram, Feasibility, HolePunch, NodeId, OpenConnection,
    Payload, PeerAddress, RequestId, TimerId, feasibility,
};
use std::collections::HashMap;
use std::time::Duration;

/// How a pending attempt is being made
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// Waiting for an `OpenResponse`
    Direct {
        /// Handshake id
        request: RequestId,
        /// Round-trip timeout
        timer: TimerId,
    },
    /// Waiting for the hole punching service
    HolePunch,
}

/// Result of a finished attempt, or of an inbound open request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MakerOutcome {
    /// A connection must be registered
    Connected(Connection),
    /// The attempt to the node failed
    Failed(NodeId),
}

/// Connection maker
pub struct ConnectionMaker<H> {
    hole_punch: H,
    open_timeout: Duration,
    pending: HashMap<NodeId, Attempt>,
    requests: HashMap<RequestId, NodeId>,
    timers: HashMap<TimerId, NodeId>,
}

impl<H: HolePunch> ConnectionMaker<H> {
    /// Create a maker using `hole_punch` for NAT'd targets
    #[must_use]
    pub fn new(hole_punch: H, open_timeout: Duration) -> Self {
        Self {
            hole_punch,
            open_timeout,
            pending: HashMap::new(),
            requests: HashMap::new(),
            timers: HashMap::new(),
        }
    }

    /// Hole punching service
    #[must_use]
    pub fn hole_punch(&self) -> &H {
        &self.hole_punch
    }

    /// Hole punching service, mutably
    pub fn hole_punch_mut(&mut self) -> &mut H {
        &mut self.hole_punch
    }

    /// True if an attempt to `id` is pending
    #[must_use]
    pub fn is_pending(&self, id: NodeId) -> bool {
        self.pending.contains_key(&id)
    }

    /// Pending attempt to `id`
    #[must_use]
    pub fn attempt(&self, id: NodeId) -> Option<Attempt> {
        self.pending.get(&id).copied()
    }

    /// Number of pending attempts
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Start a connection attempt from `self_peer` to `target`
    ///
    /// Returns false, creating no state, if the pair of NAT classes cannot
    /// be traversed. An attempt already pending to the node is kept.
    pub fn connect(
        &mut self,
        ctx: &mut dyn Context,
        self_peer: &PeerAddress,
        target: &PeerAddress,
    ) -> bool {
        let id = target.id();
        if self.pending.contains_key(&id) {
            return true;
        }

        if target.nat.is_open() {
            let request = RequestId::random();
            ctx.send(Datagram::new(
                self_peer.base,
                target.base,
                Payload::Connection(ConnectionMessage::OpenRequest { id: request }),
            ));
            let timer = ctx.schedule_once(self.open_timeout);
            self.requests.insert(request, id);
            self.timers.insert(timer, id);
            self.pending.insert(id, Attempt::Direct { request, timer });
            tracing::debug!("Open request {} sent to {}", request, target.base);
            return true;
        }

        match feasibility(&self_peer.nat, &target.nat) {
            Feasibility::Direct | Feasibility::HolePunchable => {
                if self.hole_punch.open_connection(ctx, target) {
                    self.pending.insert(id, Attempt::HolePunch);
                    tracing::debug!("Hole punching to {}", target.base);
                    true
                } else {
                    false
                }
            }
            Feasibility::Unfeasible => {
                tracing::debug!(
                    "No traversal from {} to {}",
                    self_peer.nat,
                    target.nat
                );
                false
            }
        }
    }

    /// Drop the pending attempt to `id`, cancelling its timer or its hole
    /// punching session
    pub fn abandon(&mut self, ctx: &mut dyn Context, id: NodeId) -> Option<Attempt> {
        let attempt = self.pending.remove(&id)?;
        match attempt {
            Attempt::Direct { request, timer } => {
                self.requests.remove(&request);
                self.timers.remove(&timer);
                ctx.cancel(timer);
            }
            Attempt::HolePunch => self.hole_punch.cancel(ctx, id),
        }
        Some(attempt)
    }

    /// Handle an open-connection or hole punching datagram
    pub fn handle_datagram(
        &mut self,
        ctx: &mut dyn Context,
        self_peer: &PeerAddress,
        datagram: &Datagram,
    ) -> Vec<MakerOutcome> {
        match &datagram.payload {
            Payload::Connection(ConnectionMessage::OpenRequest { id }) => {
                if !self_peer.nat.is_open() {
                    tracing::warn!(
                        "Dropping open request {} from {}: this node is not open",
                        id,
                        datagram.src
                    );
                    return Vec::new();
                }
                ctx.send(datagram.reply(Payload::Connection(ConnectionMessage::OpenResponse {
                    id: *id,
                    observed: datagram.src,
                })));
                vec![self.connected(
                    ctx,
                    Connection {
                        local: datagram.dst,
                        remote: datagram.src,
                        initiator: false,
                    },
                )]
            }
            Payload::Connection(ConnectionMessage::OpenResponse { id, observed }) => {
                let Some(node) = self.requests.get(id).copied() else {
                    tracing::debug!("Late open response {} from {}", id, datagram.src);
                    return Vec::new();
                };
                tracing::debug!("Open response {} from {} (we are {})", id, datagram.src, observed);
                self.abandon(ctx, node);
                vec![self.connected(
                    ctx,
                    Connection {
                        local: datagram.dst,
                        remote: datagram.src,
                        initiator: true,
                    },
                )]
            }
            Payload::Shp(_) => {
                let outcomes = self.hole_punch.handle_datagram(ctx, datagram);
                self.hole_punch_outcomes(ctx, outcomes)
            }
            _ => Vec::new(),
        }
    }

    /// Handle a timer; `None` if neither this maker nor its hole punching
    /// service owns it
    pub fn handle_timeout(
        &mut self,
        ctx: &mut dyn Context,
        timer: TimerId,
    ) -> Option<Vec<MakerOutcome>> {
        if let Some(id) = self.timers.remove(&timer) {
            tracing::debug!("Open request to {} timed out", id);
            self.abandon(ctx, id);
            return Some(vec![MakerOutcome::Failed(id)]);
        }

        if self.hole_punch.owns_timer(timer) {
            let outcomes = self.hole_punch.handle_timeout(ctx, timer);
            return Some(self.hole_punch_outcomes(ctx, outcomes));
        }

        None
    }

    fn connected(&mut self, ctx: &mut dyn Context, connection: Connection) -> MakerOutcome {
        // A simultaneous attempt to the same node is superseded
        self.abandon(ctx, connection.remote_id());
        MakerOutcome::Connected(connection)
    }

    fn hole_punch_outcomes(
        &mut self,
        ctx: &mut dyn Context,
        outcomes: Vec<OpenConnection>,
    ) -> Vec<MakerOutcome> {
        outcomes
            .into_iter()
            .filter_map(|outcome| match outcome {
                OpenConnection::Success {
                    local,
                    remote,
                    initiator,
                } => Some(self.connected(
                    ctx,
                    Connection {
                        local,
                        remote,
                        initiator,
                    },
                )),
                OpenConnection::Failure { target, stage } => {
                    if self.attempt(target.id) != Some(Attempt::HolePunch) {
                        tracing::debug!(
                            "Ignoring stale hole punching failure to {} in {}",
                            target,
                            stage
                        );
                        return None;
                    }
                    tracing::debug!("Hole punching to {} failed in {}", target, stage);
                    self.abandon(ctx, target.id);
                    Some(MakerOutcome::Failed(target.id))
                }
            })
            .collect()
    }
}
