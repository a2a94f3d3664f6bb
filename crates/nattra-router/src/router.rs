//! NAT traversing router
//!
//! Routes outbound application messages over established connections,
//! buffers them while a connection is being made and consumes every
//! internal protocol message.

use crate::config::RouterConfig;
use crate::error::RouterError;
use crate::maker::{ConnectionMaker, MakerOutcome};
use crate::message::{
    AppMessage, CloseReason, Connection, Protocol, RouterCommand, RouterEvent,
};
use crate::tracker::ConnectionTracker;
use crate::traffic::TrafficTracker;
use nattra_core::{
    Address, Component, ConnectionMessage, Context, Datagram, FailureDetector, HolePunch,
    NoFailureDetector, NodeId, Payload, PeerAddress, TimerId,
};

/// Router counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RouterStats {
    /// Messages sent without buffering
    pub forwarded: u64,
    /// Messages buffered while connecting
    pub buffered: u64,
    /// Buffered messages sent once connected
    pub flushed: u64,
    /// Messages dropped
    pub dropped: u64,
    /// Inbound application messages delivered
    pub delivered: u64,
    /// Connections registered
    pub connections_opened: u64,
    /// Connections removed
    pub connections_closed: u64,
}

/// NAT traversing connection router
pub struct NatTraverser<H, F = NoFailureDetector> {
    self_peer: PeerAddress,
    maker: ConnectionMaker<H>,
    tracker: ConnectionTracker<F>,
    traffic: TrafficTracker,
    stats: RouterStats,
}

impl<H: HolePunch> NatTraverser<H, NoFailureDetector> {
    /// Create a router without an external failure detector
    #[must_use]
    pub fn new(self_peer: PeerAddress, hole_punch: H, config: RouterConfig) -> Self {
        Self::with_failure_detector(self_peer, hole_punch, NoFailureDetector, config)
    }
}

impl<H: HolePunch, F: FailureDetector> NatTraverser<H, F> {
    /// Create a router reporting connections to `detector`
    ///
    /// `config` is expected to pass [`RouterConfig::validate`].
    #[must_use]
    pub fn with_failure_detector(
        self_peer: PeerAddress,
        hole_punch: H,
        detector: F,
        config: RouterConfig,
    ) -> Self {
        Self {
            self_peer,
            maker: ConnectionMaker::new(hole_punch, config.open_timeout),
            tracker: ConnectionTracker::new(&config, detector),
            traffic: TrafficTracker::new(config.max_pending_messages),
            stats: RouterStats::default(),
        }
    }

    /// Local node as currently advertised
    #[must_use]
    pub fn self_peer(&self) -> &PeerAddress {
        &self.self_peer
    }

    /// Router counters
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    /// Connection to `id`, if established
    #[must_use]
    pub fn connection(&self, id: NodeId) -> Option<&Connection> {
        self.tracker.get(id)
    }

    /// Number of established connections
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.tracker.len()
    }

    /// True if a connection attempt to `id` is outstanding
    #[must_use]
    pub fn is_connecting(&self, id: NodeId) -> bool {
        self.maker.is_pending(id)
    }

    /// Messages buffered for `id`
    #[must_use]
    pub fn queued(&self, id: NodeId) -> usize {
        self.traffic.queued(id)
    }

    /// True if a pending message queue exists for `id`
    #[must_use]
    pub fn has_queue(&self, id: NodeId) -> bool {
        self.traffic.has_queue(id)
    }

    /// Hole punching service
    #[must_use]
    pub fn hole_punch(&self) -> &H {
        self.maker.hole_punch()
    }

    /// Hole punching service, mutably
    pub fn hole_punch_mut(&mut self) -> &mut H {
        self.maker.hole_punch_mut()
    }

    /// Arm the liveness timers
    pub fn start(&mut self, ctx: &mut dyn Context) {
        tracing::info!("Router started as {}", self.self_peer);
        self.tracker.start(ctx);
    }

    /// Cancel the liveness timers
    pub fn stop(&mut self, ctx: &mut dyn Context) {
        self.tracker.stop(ctx);
    }

    /// The local address or NAT class changed
    pub fn update_self(&mut self, self_peer: PeerAddress) {
        self.maker.hole_punch_mut().update_self(&self_peer);
        self.self_peer = self_peer;
    }

    /// Route an outbound application message
    pub fn send(&mut self, ctx: &mut dyn Context, msg: AppMessage) -> Vec<RouterEvent> {
        if msg.protocol != Protocol::Udp {
            tracing::warn!(
                "{:?} message to {} reached the NAT router, passing through",
                msg.protocol,
                msg.dst.base
            );
            self.stats.forwarded += 1;
            ctx.send(TrafficTracker::passthrough(msg));
            return Vec::new();
        }

        let id = msg.dst.id();
        if let Some(connection) = self.tracker.get(id).copied() {
            self.stats.forwarded += 1;
            ctx.send(self.traffic.rewrite(&self.self_peer, &connection, msg));
            return Vec::new();
        }

        if self.self_peer.nat.is_open() && msg.dst.nat.is_open() {
            self.stats.forwarded += 1;
            ctx.send(TrafficTracker::passthrough(msg));
            return Vec::new();
        }

        if !self.maker.is_pending(id) && !self.maker.connect(ctx, &self.self_peer, &msg.dst) {
            tracing::warn!(
                "Dropping message to {}: no traversal from {} to {}",
                msg.dst.base,
                self.self_peer.nat,
                msg.dst.nat
            );
            self.stats.dropped += 1;
            return vec![RouterEvent::Dropped {
                dst: id,
                reason: RouterError::Unfeasible(id),
            }];
        }

        match self.traffic.enqueue(msg) {
            Ok(len) => {
                self.stats.buffered += 1;
                tracing::trace!("Buffered message for {} ({} queued)", id, len);
                Vec::new()
            }
            Err(_) => {
                let reason = RouterError::QueueFull(id, self.traffic.queued(id));
                tracing::warn!("Dropping message: {}", reason);
                self.stats.dropped += 1;
                vec![RouterEvent::Dropped { dst: id, reason }]
            }
        }
    }

    /// Handle an inbound datagram
    pub fn handle_datagram(&mut self, ctx: &mut dyn Context, datagram: Datagram) -> Vec<RouterEvent> {
        match datagram.payload {
            Payload::Application(payload) => {
                self.stats.delivered += 1;
                vec![RouterEvent::Deliver {
                    src: datagram.src,
                    payload,
                }]
            }
            Payload::Connection(ConnectionMessage::Heartbeat { .. }) => {
                self.tracker.heard_from(datagram.src.id);
                Vec::new()
            }
            Payload::Connection(ConnectionMessage::Close) => {
                match self.tracker.remove(datagram.src.id) {
                    Some(connection) => {
                        vec![self.closed(connection, CloseReason::RemoteClosed)]
                    }
                    None => {
                        tracing::debug!("Close from unknown node {}", datagram.src);
                        Vec::new()
                    }
                }
            }
            Payload::Connection(_) | Payload::Shp(_) => {
                let outcomes = self.maker.handle_datagram(ctx, &self.self_peer, &datagram);
                self.apply(ctx, outcomes)
            }
            Payload::Stun(_) => {
                tracing::trace!("Router ignoring STUN message from {}", datagram.src);
                Vec::new()
            }
        }
    }

    /// Handle a timer owned by the router or its hole punching service
    pub fn handle_timeout(&mut self, ctx: &mut dyn Context, timer: TimerId) -> Vec<RouterEvent> {
        if let Some(closed) = self.tracker.handle_timeout(ctx, timer) {
            return closed
                .into_iter()
                .map(|(connection, reason)| self.closed(connection, reason))
                .collect();
        }

        match self.maker.handle_timeout(ctx, timer) {
            Some(outcomes) => self.apply(ctx, outcomes),
            None => {
                tracing::debug!("Router ignoring late {}", timer);
                Vec::new()
            }
        }
    }

    /// The liveness detector suspects `addr`; its connection is removed
    pub fn suspect(&mut self, addr: &Address) -> Vec<RouterEvent> {
        match self.tracker.remove(addr.id) {
            Some(connection) => vec![self.closed(connection, CloseReason::Suspected)],
            None => Vec::new(),
        }
    }

    /// Close the connection to `id`, notifying the peer
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::NoConnection`] if no connection to `id` exists.
    pub fn close_connection(
        &mut self,
        ctx: &mut dyn Context,
        id: NodeId,
    ) -> Result<RouterEvent, RouterError> {
        let connection = self
            .tracker
            .close(ctx, id)
            .ok_or(RouterError::NoConnection(id))?;
        Ok(self.closed(connection, CloseReason::Local))
    }

    fn closed(&mut self, connection: Connection, reason: CloseReason) -> RouterEvent {
        self.stats.connections_closed += 1;
        tracing::info!("Connection {} removed: {}", connection, reason);
        RouterEvent::ConnectionClosed { connection, reason }
    }

    fn apply(&mut self, ctx: &mut dyn Context, outcomes: Vec<MakerOutcome>) -> Vec<RouterEvent> {
        let mut events = Vec::new();
        for outcome in outcomes {
            match outcome {
                MakerOutcome::Connected(connection) => {
                    if self.tracker.register(connection) {
                        self.stats.connections_opened += 1;
                        tracing::info!("Connection {} opened", connection);
                        events.push(RouterEvent::ConnectionOpened(connection));
                    }
                    self.flush(ctx, &connection);
                }
                MakerOutcome::Failed(target) => {
                    let dropped = self.traffic.take(target).len();
                    self.stats.dropped += dropped as u64;
                    tracing::warn!(
                        "{}, dropping {} buffered message(s)",
                        RouterError::ConnectFailed(target),
                        dropped
                    );
                    events.push(RouterEvent::ConnectionFailed { target, dropped });
                }
            }
        }
        events
    }

    fn flush(&mut self, ctx: &mut dyn Context, connection: &Connection) {
        let queue = self.traffic.take(connection.remote_id());
        if queue.is_empty() {
            return;
        }
        tracing::debug!("Flushing {} message(s) to {}", queue.len(), connection.remote);
        for msg in queue {
            self.stats.flushed += 1;
            ctx.send(self.traffic.rewrite(&self.self_peer, connection, msg));
        }
    }
}

impl<H: HolePunch, F: FailureDetector> Component for NatTraverser<H, F> {
    type Command = RouterCommand;
    type Event = RouterEvent;

    fn local_addresses(&self) -> Vec<Address> {
        vec![self.self_peer.base]
    }

    fn start(&mut self, ctx: &mut dyn Context) -> Vec<RouterEvent> {
        NatTraverser::start(self, ctx);
        Vec::new()
    }

    fn handle_datagram(&mut self, ctx: &mut dyn Context, datagram: Datagram) -> Vec<RouterEvent> {
        NatTraverser::handle_datagram(self, ctx, datagram)
    }

    fn handle_timeout(&mut self, ctx: &mut dyn Context, timer: TimerId) -> Vec<RouterEvent> {
        NatTraverser::handle_timeout(self, ctx, timer)
    }

    fn handle_command(&mut self, ctx: &mut dyn Context, command: RouterCommand) -> Vec<RouterEvent> {
        match command {
            RouterCommand::Send(msg) => self.send(ctx, msg),
            RouterCommand::Close(id) => match self.close_connection(ctx, id) {
                Ok(event) => vec![event],
                Err(e) => {
                    tracing::debug!("Close ignored: {}", e);
                    Vec::new()
                }
            },
            RouterCommand::Suspect(addr) => self.suspect(&addr),
            RouterCommand::UpdateSelf(peer) => {
                self.update_self(peer);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nattra_core::testing::RecordingContext;
    use nattra_core::{
        AllocationPolicy, FilteringPolicy, MappingPolicy, NatBehavior, NatDescriptor,
        OpenConnection, RequestId,
    };
    use std::collections::VecDeque;

    /// Hole punching stub that completes on demand
    #[derive(Default)]
    struct ScriptedPunch {
        requests: Vec<PeerAddress>,
        cancelled: Vec<NodeId>,
        outcomes: VecDeque<OpenConnection>,
    }

    impl HolePunch for ScriptedPunch {
        fn open_connection(&mut self, _ctx: &mut dyn Context, target: &PeerAddress) -> bool {
            self.requests.push(target.clone());
            true
        }

        fn cancel(&mut self, _ctx: &mut dyn Context, target: NodeId) {
            self.cancelled.push(target);
        }

        fn update_self(&mut self, _self_peer: &PeerAddress) {}

        fn handle_datagram(
            &mut self,
            _ctx: &mut dyn Context,
            _datagram: &Datagram,
        ) -> Vec<OpenConnection> {
            self.outcomes.drain(..).collect()
        }

        fn owns_timer(&self, _timer: TimerId) -> bool {
            false
        }

        fn handle_timeout(&mut self, _ctx: &mut dyn Context, _timer: TimerId) -> Vec<OpenConnection> {
            Vec::new()
        }
    }

    fn addr(s: &str, id: u64) -> Address {
        Address::new(s.parse().unwrap(), NodeId(id))
    }

    fn ei() -> NatDescriptor {
        NatDescriptor::Nated(
            NatBehavior::new(
                MappingPolicy::EndpointIndependent,
                AllocationPolicy::PortPreservation,
                FilteringPolicy::EndpointIndependent,
            )
            .with_parents(vec![addr("198.51.100.9:5000", 9)]),
        )
    }

    fn router(nat: NatDescriptor) -> NatTraverser<ScriptedPunch> {
        NatTraverser::new(
            PeerAddress::new(addr("10.0.0.1:4000", 1), nat),
            ScriptedPunch::default(),
            RouterConfig::default(),
        )
    }

    fn to(dst: &PeerAddress, payload: &[u8]) -> AppMessage {
        AppMessage::udp(addr("10.0.0.1:4000", 1), dst.clone(), payload.to_vec())
    }

    fn shp_trigger() -> Datagram {
        Datagram::new(
            addr("203.0.113.2:6100", 2),
            addr("10.0.0.1:4000", 1),
            Payload::Shp(nattra_core::ShpMessage::Ping {
                msg: nattra_core::MsgId(1),
            }),
        )
    }

    #[test]
    fn test_open_to_open_forwards_directly() {
        let mut ctx = RecordingContext::new();
        let mut r = router(NatDescriptor::Open);
        let dst = PeerAddress::new(addr("198.51.100.2:4000", 2), NatDescriptor::Open);

        assert!(r.send(&mut ctx, to(&dst, b"m1")).is_empty());
        assert_eq!(ctx.sent.len(), 1);
        assert_eq!(ctx.sent[0].dst, dst.base);
        assert!(!r.is_connecting(NodeId(2)));
        assert!(!r.has_queue(NodeId(2)));
        assert_eq!(r.stats().forwarded, 1);
    }

    #[test]
    fn test_non_udp_passes_through() {
        let mut ctx = RecordingContext::new();
        let mut r = router(ei());
        let dst = PeerAddress::new(addr("10.0.0.2:4000", 2), ei());
        let mut msg = to(&dst, b"stream");
        msg.protocol = Protocol::Tcp;

        r.send(&mut ctx, msg);
        assert_eq!(ctx.sent[0].dst, dst.base);
        assert!(r.hole_punch().requests.is_empty());
    }

    #[test]
    fn test_buffer_then_flush_in_order() {
        let mut ctx = RecordingContext::new();
        let mut r = router(ei());
        let dst = PeerAddress::new(addr("10.0.0.2:4000", 2), ei());

        for m in [b"m1", b"m2", b"m3"] {
            assert!(r.send(&mut ctx, to(&dst, m)).is_empty());
        }
        assert_eq!(r.hole_punch().requests.len(), 1);
        assert_eq!(r.queued(NodeId(2)), 3);
        assert!(ctx.sent.is_empty());

        let connection = Connection {
            local: addr("10.0.0.1:4000", 1),
            remote: addr("203.0.113.2:6100", 2),
            initiator: true,
        };
        r.hole_punch_mut().outcomes.push_back(OpenConnection::Success {
            local: connection.local,
            remote: connection.remote,
            initiator: true,
        });
        let events = r.handle_datagram(&mut ctx, shp_trigger());
        assert_eq!(events, vec![RouterEvent::ConnectionOpened(connection)]);

        let payloads: Vec<Payload> = ctx.sent.iter().map(|d| d.payload.clone()).collect();
        assert_eq!(
            payloads,
            vec![
                Payload::Application(b"m1".to_vec()),
                Payload::Application(b"m2".to_vec()),
                Payload::Application(b"m3".to_vec()),
            ]
        );
        assert!(ctx.sent.iter().all(|d| d.dst == connection.remote));
        assert!(!r.has_queue(NodeId(2)));
        assert_eq!(r.stats().flushed, 3);

        // established: next message is rewritten and sent immediately
        r.send(&mut ctx, to(&dst, b"m4"));
        assert_eq!(ctx.sent.last().unwrap().dst, connection.remote);
    }

    #[test]
    fn test_failure_drops_queue() {
        let mut ctx = RecordingContext::new();
        let mut r = router(ei());
        let dst = PeerAddress::new(addr("10.0.0.2:4000", 2), ei());
        r.send(&mut ctx, to(&dst, b"m1"));
        r.send(&mut ctx, to(&dst, b"m2"));

        r.hole_punch_mut().outcomes.push_back(OpenConnection::Failure {
            target: dst.base,
            stage: nattra_core::PunchStage::OpenConnection,
        });
        let events = r.handle_datagram(&mut ctx, shp_trigger());
        assert_eq!(
            events,
            vec![RouterEvent::ConnectionFailed {
                target: NodeId(2),
                dropped: 2,
            }]
        );
        assert!(!r.has_queue(NodeId(2)));
        assert_eq!(r.connection_count(), 0);
    }

    #[test]
    fn test_unfeasible_drops_without_queue() {
        let mut ctx = RecordingContext::new();
        let mut r = router(NatDescriptor::UdpBlocked);
        let dst = PeerAddress::new(addr("10.0.0.2:4000", 2), ei());

        let events = r.send(&mut ctx, to(&dst, b"m1"));
        assert_eq!(
            events,
            vec![RouterEvent::Dropped {
                dst: NodeId(2),
                reason: RouterError::Unfeasible(NodeId(2)),
            }]
        );
        assert!(!r.has_queue(NodeId(2)));
    }

    #[test]
    fn test_open_request_registers_connection() {
        let mut ctx = RecordingContext::new();
        let mut r = router(NatDescriptor::Open);
        let request = Datagram::new(
            addr("203.0.113.2:6100", 2),
            addr("10.0.0.1:4000", 1),
            Payload::Connection(ConnectionMessage::OpenRequest { id: RequestId(8) }),
        );
        let events = r.handle_datagram(&mut ctx, request);
        assert!(matches!(events[0], RouterEvent::ConnectionOpened(_)));
        assert!(r.connection(NodeId(2)).is_some());
    }

    #[test]
    fn test_inbound_application_delivered() {
        let mut ctx = RecordingContext::new();
        let mut r = router(ei());
        let datagram = Datagram::new(
            addr("203.0.113.2:6100", 2),
            addr("10.0.0.1:4000", 1),
            Payload::Application(b"hello".to_vec()),
        );
        assert_eq!(
            r.handle_datagram(&mut ctx, datagram),
            vec![RouterEvent::Deliver {
                src: addr("203.0.113.2:6100", 2),
                payload: b"hello".to_vec(),
            }]
        );
    }

    #[test]
    fn test_close_and_suspect() {
        let mut ctx = RecordingContext::new();
        let mut r = router(NatDescriptor::Open);
        for (id, port) in [(2, 6100), (3, 6200), (4, 6300)] {
            let request = Datagram::new(
                addr(&format!("203.0.113.{id}:{port}"), id),
                addr("10.0.0.1:4000", 1),
                Payload::Connection(ConnectionMessage::OpenRequest { id: RequestId(id) }),
            );
            r.handle_datagram(&mut ctx, request);
        }
        ctx.take_sent();

        // local close notifies the peer
        let event = r.close_connection(&mut ctx, NodeId(2)).unwrap();
        assert!(matches!(
            event,
            RouterEvent::ConnectionClosed {
                reason: CloseReason::Local,
                ..
            }
        ));
        assert_eq!(ctx.sent[0].payload, Payload::Connection(ConnectionMessage::Close));
        assert_eq!(
            r.close_connection(&mut ctx, NodeId(2)),
            Err(RouterError::NoConnection(NodeId(2)))
        );

        // remote close
        let close = Datagram::new(
            addr("203.0.113.3:6200", 3),
            addr("10.0.0.1:4000", 1),
            Payload::Connection(ConnectionMessage::Close),
        );
        assert_eq!(r.handle_datagram(&mut ctx, close).len(), 1);

        // suspicion
        let events = r.suspect(&addr("203.0.113.4:6300", 4));
        assert!(matches!(
            events[0],
            RouterEvent::ConnectionClosed {
                reason: CloseReason::Suspected,
                ..
            }
        ));
        assert_eq!(r.connection_count(), 0);
        assert_eq!(r.stats().connections_closed, 3);
    }

    #[test]
    fn test_stale_hole_punch_timer_spares_new_attempt() {
        use nattra_core::{MsgId, ShpMessage};
        use nattra_shp::{ShpClient, ShpConfig};

        let me = PeerAddress::new(addr("10.0.0.1:4000", 1), ei());
        let parent = addr("198.51.100.9:5000", 9);
        let b_public = addr("203.0.113.2:6100", 2);
        let b = PeerAddress::new(addr("10.0.0.2:4000", 2), ei());
        let mut ctx = RecordingContext::new();
        let mut r = NatTraverser::new(
            me.clone(),
            ShpClient::new(me.clone(), ShpConfig::default()),
            RouterConfig::default(),
        );

        r.send(&mut ctx, to(&b, b"m1"));
        let first_timer = ctx.last_timer().unwrap();
        assert_eq!(r.hole_punch().initiator_sessions(), 1);

        // b reaches us first, with us as the target of its own rendezvous
        let initiate = Datagram::new(
            parent,
            me.base,
            Payload::Shp(ShpMessage::Initiate {
                msg: MsgId(77),
                connect_to: b_public,
            }),
        );
        assert!(r.handle_datagram(&mut ctx, initiate).is_empty());
        let pong = Datagram::new(b_public, me.base, Payload::Shp(ShpMessage::Pong { msg: MsgId(77) }));
        let events = r.handle_datagram(&mut ctx, pong);
        assert_eq!(opened_count(&events), 1);
        assert!(ctx.cancelled.contains(&first_timer));
        assert_eq!(r.hole_punch().initiator_sessions(), 0);

        r.close_connection(&mut ctx, NodeId(2)).unwrap();
        r.send(&mut ctx, to(&b, b"m2"));
        assert!(r.is_connecting(NodeId(2)));
        assert_eq!(r.queued(NodeId(2)), 1);

        // the first session's timer must not fail the second attempt
        assert!(r.handle_timeout(&mut ctx, first_timer).is_empty());
        assert!(r.is_connecting(NodeId(2)));
        assert_eq!(r.queued(NodeId(2)), 1);
        assert_eq!(r.hole_punch().initiator_sessions(), 1);
    }

    fn opened_count(events: &[RouterEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, RouterEvent::ConnectionOpened(_)))
            .count()
    }
}
