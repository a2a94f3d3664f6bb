//! Hole punching client
//!
//! Plays the initiator and target roles of a rendezvous and, for open
//! nodes, the parent role through an embedded [`ShpParent`].
//!
//! ```text
//! initiator              parent                 target
//!     │── Relay ────────────►│                      │
//!     │                      │── Initiate ─────────►│
//!     │◄──────────────────────────────────── Ping ──│
//!     │── Pong ────────────────────────────────────►│
//!     │◄─────────────────────────────────── Ready ──│
//! ```

use crate::error::ShpError;
use crate::parent::ShpParent;
use crate::session::{CompletedSet, InitiatorSession, TargetSession};
use nattra_core::{
    Address, Context, Datagram, HolePunch, MsgId, NodeId, OpenConnection, Payload, PeerAddress,
    PunchStage, SessionId, ShpMessage, TimerId,
};
use std::collections::HashMap;
use std::time::Duration;

/// Default time budget for each pending rendezvous message
pub const DEFAULT_PUNCH_TIMEOUT: Duration = Duration::from_secs(3);

/// Default number of finished target sessions remembered
pub const DEFAULT_COMPLETED_CAPACITY: usize = 1024;

/// Hole punching configuration
#[derive(Debug, Clone)]
pub struct ShpConfig {
    /// Timeout of each pending message
    pub timeout: Duration,
    /// Finished target message ids kept to recognise late duplicates
    pub completed_capacity: usize,
}

impl Default for ShpConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_PUNCH_TIMEOUT,
            completed_capacity: DEFAULT_COMPLETED_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum TimerOwner {
    Initiator(SessionId),
    Target(MsgId),
}

/// Hole punching client
pub struct ShpClient {
    self_peer: PeerAddress,
    config: ShpConfig,
    initiators: HashMap<SessionId, InitiatorSession>,
    initiator_msgs: HashMap<MsgId, SessionId>,
    targets: HashMap<MsgId, TargetSession>,
    completed: CompletedSet,
    timers: HashMap<TimerId, TimerOwner>,
    parent: ShpParent,
}

impl ShpClient {
    /// Create a client for the local node
    #[must_use]
    pub fn new(self_peer: PeerAddress, config: ShpConfig) -> Self {
        let completed = CompletedSet::new(config.completed_capacity);
        let parent = ShpParent::new(self_peer.base);
        Self {
            self_peer,
            config,
            initiators: HashMap::new(),
            initiator_msgs: HashMap::new(),
            targets: HashMap::new(),
            completed,
            timers: HashMap::new(),
            parent,
        }
    }

    /// Local node as currently advertised
    #[must_use]
    pub fn self_peer(&self) -> &PeerAddress {
        &self.self_peer
    }

    /// Parent role of this node
    pub fn parent_mut(&mut self) -> &mut ShpParent {
        &mut self.parent
    }

    /// Accept relays for `child`
    pub fn register_child(&mut self, child: Address) {
        self.parent.register_child(child);
    }

    /// Sessions initiated by this node that are still pending
    #[must_use]
    pub fn initiator_sessions(&self) -> usize {
        self.initiators.len()
    }

    /// Sessions targeting this node that are still pending
    #[must_use]
    pub fn target_sessions(&self) -> usize {
        self.targets.len()
    }

    /// Start a rendezvous with `target` through each of its parents
    ///
    /// # Errors
    ///
    /// Returns [`ShpError::NoParents`] if the target lists no parent.
    pub fn initiate(
        &mut self,
        ctx: &mut dyn Context,
        target: &PeerAddress,
    ) -> Result<SessionId, ShpError> {
        if target.parents().is_empty() {
            return Err(ShpError::NoParents(target.base));
        }

        let id = loop {
            let id = SessionId::random();
            if !self.initiators.contains_key(&id) {
                break id;
            }
        };
        let msg = MsgId::random();

        for parent in target.parents() {
            ctx.send(Datagram::new(
                self.self_peer.base,
                *parent,
                Payload::Shp(ShpMessage::Relay {
                    session: id,
                    msg,
                    target: target.base,
                }),
            ));
        }

        let timer = ctx.schedule_once(self.config.timeout);
        self.timers.insert(timer, TimerOwner::Initiator(id));
        self.initiator_msgs.insert(msg, id);
        self.initiators
            .insert(id, InitiatorSession::new(id, msg, target.base, timer));

        tracing::debug!(
            "SHP session {} to {} relayed through {} parent(s)",
            id,
            target.base,
            target.parents().len()
        );
        Ok(id)
    }

    fn remove_initiator(&mut self, ctx: &mut dyn Context, id: SessionId) -> Option<InitiatorSession> {
        let session = self.initiators.remove(&id)?;
        self.initiator_msgs.remove(&session.msg);
        self.timers.remove(&session.timer);
        ctx.cancel(session.timer);
        Some(session)
    }

    fn remove_target(&mut self, ctx: &mut dyn Context, msg: MsgId) -> Option<TargetSession> {
        let session = self.targets.remove(&msg)?;
        self.timers.remove(&session.timer);
        ctx.cancel(session.timer);
        self.completed.insert(msg);
        Some(session)
    }

    fn handle_initiate(
        &mut self,
        ctx: &mut dyn Context,
        datagram: &Datagram,
        msg: MsgId,
        connect_to: Address,
    ) {
        let from_parent = self
            .self_peer
            .parents()
            .iter()
            .any(|p| p.same_base(&datagram.src));
        if !from_parent {
            tracing::warn!(
                "Dropping initiate {}: {}",
                msg,
                ShpError::NotAParent(datagram.src)
            );
            return;
        }

        if self.targets.contains_key(&msg) || self.completed.contains(&msg) {
            tracing::debug!("Duplicate initiate {} from {}", msg, datagram.src);
            return;
        }

        ctx.send(Datagram::new(
            self.self_peer.base,
            connect_to,
            Payload::Shp(ShpMessage::Ping { msg }),
        ));
        let timer = ctx.schedule_once(self.config.timeout);
        self.timers.insert(timer, TimerOwner::Target(msg));
        self.targets.insert(
            msg,
            TargetSession {
                msg,
                connect_to,
                timer,
            },
        );
        tracing::debug!("SHP target {} pinging {}", msg, connect_to);
    }

    fn handle_ping(&mut self, ctx: &mut dyn Context, datagram: &Datagram, msg: MsgId) {
        let Some(id) = self.initiator_msgs.get(&msg).copied() else {
            tracing::debug!("Late ping {} from {}", msg, datagram.src);
            return;
        };
        let timeout = self.config.timeout;
        let Some(session) = self.initiators.get_mut(&id) else {
            return;
        };

        ctx.send(Datagram::new(
            self.self_peer.base,
            datagram.src,
            Payload::Shp(ShpMessage::Pong { msg }),
        ));

        match session.stage {
            PunchStage::OpenConnection => {
                session.stage = PunchStage::HolePunching;
                session.remote = Some(datagram.src);

                ctx.cancel(session.timer);
                self.timers.remove(&session.timer);
                session.timer = ctx.schedule_once(timeout);
                self.timers.insert(session.timer, TimerOwner::Initiator(id));
            }
            PunchStage::HolePunching => {
                tracing::debug!("Repeated ping {} from {}", msg, datagram.src);
            }
        }
    }

    fn handle_pong(
        &mut self,
        ctx: &mut dyn Context,
        datagram: &Datagram,
        msg: MsgId,
    ) -> Vec<OpenConnection> {
        let Some(session) = self.targets.get(&msg) else {
            tracing::debug!("Late pong {} from {}", msg, datagram.src);
            return Vec::new();
        };
        if session.connect_to.id != datagram.src.id {
            tracing::warn!(
                "Dropping pong {} from {}: expected {}",
                msg,
                datagram.src,
                session.connect_to
            );
            return Vec::new();
        }
        self.remove_target(ctx, msg);

        ctx.send(Datagram::new(
            self.self_peer.base,
            datagram.src,
            Payload::Shp(ShpMessage::Ready {
                msg,
                observed: datagram.src,
            }),
        ));
        tracing::info!("SHP hole to {} open (target side)", datagram.src);

        vec![OpenConnection::Success {
            local: self.self_peer.base,
            remote: datagram.src,
            initiator: false,
        }]
    }

    fn handle_ready(
        &mut self,
        ctx: &mut dyn Context,
        datagram: &Datagram,
        msg: MsgId,
        observed: Address,
    ) -> Vec<OpenConnection> {
        let Some(id) = self.initiator_msgs.get(&msg).copied() else {
            tracing::debug!("Late ready {} from {}", msg, datagram.src);
            return Vec::new();
        };

        let punching = self
            .initiators
            .get(&id)
            .is_some_and(|s| s.stage == PunchStage::HolePunching);
        if !punching {
            tracing::debug!("Ready {} before ping, ignoring", msg);
            return Vec::new();
        }

        let Some(session) = self.remove_initiator(ctx, id) else {
            return Vec::new();
        };
        let remote = session.remote.unwrap_or(datagram.src);
        tracing::info!(
            "SHP session {} to {} open via {} (observed as {})",
            id,
            session.target,
            remote,
            observed
        );

        vec![OpenConnection::Success {
            local: self.self_peer.base,
            remote,
            initiator: true,
        }]
    }
}

impl HolePunch for ShpClient {
    fn open_connection(&mut self, ctx: &mut dyn Context, target: &PeerAddress) -> bool {
        match self.initiate(ctx, target) {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("Cannot hole punch: {}", e);
                false
            }
        }
    }

    fn cancel(&mut self, ctx: &mut dyn Context, target: NodeId) {
        let sessions: Vec<SessionId> = self
            .initiators
            .values()
            .filter(|s| s.target.id == target)
            .map(|s| s.id)
            .collect();
        for id in sessions {
            if self.remove_initiator(ctx, id).is_some() {
                tracing::debug!("SHP session {} to {} cancelled", id, target);
            }
        }
    }

    fn update_self(&mut self, self_peer: &PeerAddress) {
        tracing::debug!("SHP self address now {}", self_peer);
        self.self_peer = self_peer.clone();
    }

    fn handle_datagram(
        &mut self,
        ctx: &mut dyn Context,
        datagram: &Datagram,
    ) -> Vec<OpenConnection> {
        let Payload::Shp(message) = &datagram.payload else {
            return Vec::new();
        };

        match message {
            ShpMessage::Relay { .. } => {
                if let Err(e) = self.parent.handle_relay(ctx, datagram) {
                    tracing::debug!("Relay from {} not forwarded: {}", datagram.src, e);
                }
                Vec::new()
            }
            ShpMessage::Initiate { msg, connect_to } => {
                self.handle_initiate(ctx, datagram, *msg, *connect_to);
                Vec::new()
            }
            ShpMessage::Ping { msg } => {
                self.handle_ping(ctx, datagram, *msg);
                Vec::new()
            }
            ShpMessage::Pong { msg } => self.handle_pong(ctx, datagram, *msg),
            ShpMessage::Ready { msg, observed } => {
                self.handle_ready(ctx, datagram, *msg, *observed)
            }
        }
    }

    fn owns_timer(&self, timer: TimerId) -> bool {
        self.timers.contains_key(&timer)
    }

    fn handle_timeout(&mut self, ctx: &mut dyn Context, timer: TimerId) -> Vec<OpenConnection> {
        match self.timers.get(&timer).copied() {
            Some(TimerOwner::Initiator(id)) => match self.remove_initiator(ctx, id) {
                Some(session) => {
                    tracing::warn!(
                        "SHP session {} to {} timed out in {}",
                        id,
                        session.target,
                        session.stage
                    );
                    vec![OpenConnection::Failure {
                        target: session.target,
                        stage: session.stage,
                    }]
                }
                None => Vec::new(),
            },
            Some(TimerOwner::Target(msg)) => {
                if let Some(session) = self.remove_target(ctx, msg) {
                    tracing::warn!(
                        "SHP target {} gave up waiting for pong from {}",
                        msg,
                        session.connect_to
                    );
                }
                Vec::new()
            }
            None => {
                tracing::debug!("Late SHP {}", timer);
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
        AllocationPolicy, FilteringPolicy, MappingPolicy, NatBehavior, NatDescriptor, NodeId,
    };

    fn addr(s: &str, id: u64) -> Address {
        Address::new(s.parse().unwrap(), NodeId(id))
    }

    fn nated(base: Address, parents: Vec<Address>) -> PeerAddress {
        PeerAddress::new(
            base,
            NatDescriptor::Nated(
                NatBehavior::new(
                    MappingPolicy::EndpointIndependent,
                    AllocationPolicy::PortPreservation,
                    FilteringPolicy::EndpointIndependent,
                )
                .with_parents(parents),
            ),
        )
    }

    fn parent_a() -> Address {
        addr("198.51.100.9:5000", 9)
    }

    fn parent_b() -> Address {
        addr("198.51.100.10:5000", 10)
    }

    fn initiator() -> ShpClient {
        ShpClient::new(nated(addr("10.0.0.1:4000", 1), vec![]), ShpConfig::default())
    }

    fn target() -> ShpClient {
        ShpClient::new(
            nated(addr("10.1.0.2:4000", 2), vec![parent_a(), parent_b()]),
            ShpConfig::default(),
        )
    }

    fn target_peer() -> PeerAddress {
        nated(addr("10.1.0.2:4000", 2), vec![parent_a(), parent_b()])
    }

    fn initiate_from(parent: Address, msg: MsgId) -> Datagram {
        Datagram::new(
            parent,
            addr("10.1.0.2:4000", 2),
            Payload::Shp(ShpMessage::Initiate {
                msg,
                connect_to: addr("203.0.113.5:7000", 1),
            }),
        )
    }

    fn msg_of(datagram: &Datagram) -> MsgId {
        match &datagram.payload {
            Payload::Shp(ShpMessage::Relay { msg, .. })
            | Payload::Shp(ShpMessage::Ping { msg })
            | Payload::Shp(ShpMessage::Pong { msg }) => *msg,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_initiate_relays_to_every_parent() {
        let mut ctx = RecordingContext::new();
        let mut c = initiator();
        assert!(c.open_connection(&mut ctx, &target_peer()));

        let dsts: Vec<Address> = ctx.sent.iter().map(|d| d.dst).collect();
        assert_eq!(dsts, vec![parent_a(), parent_b()]);
        assert_eq!(msg_of(&ctx.sent[0]), msg_of(&ctx.sent[1]));
        assert_eq!(ctx.active.len(), 1);
        assert_eq!(c.initiator_sessions(), 1);
    }

    #[test]
    fn test_initiate_without_parents() {
        let mut ctx = RecordingContext::new();
        let mut c = initiator();
        let peer = nated(addr("10.1.0.2:4000", 2), vec![]);
        assert!(!c.open_connection(&mut ctx, &peer));
        assert!(ctx.sent.is_empty());
        assert!(ctx.active.is_empty());
    }

    #[test]
    fn test_full_rendezvous() {
        let mut ctx = RecordingContext::new();
        let mut init = initiator();
        let mut tgt = target();

        init.open_connection(&mut ctx, &target_peer());
        let msg = msg_of(&ctx.take_sent()[0]);

        // target receives initiate and pings the initiator mapping
        assert!(tgt.handle_datagram(&mut ctx, &initiate_from(parent_a(), msg)).is_empty());
        let ping = ctx.take_sent().pop().unwrap();
        assert_eq!(ping.dst, addr("203.0.113.5:7000", 1));

        // initiator sees the ping from the target's public mapping
        let ping_seen = Datagram::new(addr("203.0.113.7:6100", 2), addr("10.0.0.1:4000", 1), ping.payload);
        assert!(init.handle_datagram(&mut ctx, &ping_seen).is_empty());
        let pong = ctx.take_sent().pop().unwrap();
        assert_eq!(pong.dst, addr("203.0.113.7:6100", 2));

        let pong_seen = Datagram::new(addr("203.0.113.5:7000", 1), addr("10.1.0.2:4000", 2), pong.payload);
        let events = tgt.handle_datagram(&mut ctx, &pong_seen);
        assert_eq!(
            events,
            vec![OpenConnection::Success {
                local: addr("10.1.0.2:4000", 2),
                remote: addr("203.0.113.5:7000", 1),
                initiator: false,
            }]
        );
        let ready = ctx.take_sent().pop().unwrap();

        let ready_seen = Datagram::new(addr("203.0.113.7:6100", 2), addr("10.0.0.1:4000", 1), ready.payload);
        let events = init.handle_datagram(&mut ctx, &ready_seen);
        assert_eq!(
            events,
            vec![OpenConnection::Success {
                local: addr("10.0.0.1:4000", 1),
                remote: addr("203.0.113.7:6100", 2),
                initiator: true,
            }]
        );

        assert_eq!(init.initiator_sessions(), 0);
        assert_eq!(tgt.target_sessions(), 0);
        assert!(ctx.active.is_empty());
    }

    #[test]
    fn test_duplicate_initiate_single_session() {
        let mut ctx = RecordingContext::new();
        let mut tgt = target();

        tgt.handle_datagram(&mut ctx, &initiate_from(parent_a(), MsgId(5)));
        tgt.handle_datagram(&mut ctx, &initiate_from(parent_b(), MsgId(5)));

        assert_eq!(tgt.target_sessions(), 1);
        assert_eq!(ctx.sent.len(), 1);
    }

    #[test]
    fn test_initiate_after_completion_is_late() {
        let mut ctx = RecordingContext::new();
        let mut tgt = target();

        tgt.handle_datagram(&mut ctx, &initiate_from(parent_a(), MsgId(5)));
        let timer = ctx.last_timer().unwrap();
        ctx.fire(timer);
        assert!(tgt.handle_timeout(&mut ctx, timer).is_empty());
        ctx.take_sent();

        tgt.handle_datagram(&mut ctx, &initiate_from(parent_b(), MsgId(5)));
        assert!(ctx.sent.is_empty());
        assert_eq!(tgt.target_sessions(), 0);
    }

    #[test]
    fn test_initiate_from_stranger_dropped() {
        let mut ctx = RecordingContext::new();
        let mut tgt = target();
        tgt.handle_datagram(&mut ctx, &initiate_from(addr("192.0.2.1:5000", 77), MsgId(5)));
        assert!(ctx.sent.is_empty());
        assert_eq!(tgt.target_sessions(), 0);
    }

    #[test]
    fn test_initiator_timeout_reports_stage() {
        let mut ctx = RecordingContext::new();
        let mut init = initiator();
        init.open_connection(&mut ctx, &target_peer());

        let timer = ctx.last_timer().unwrap();
        assert!(init.owns_timer(timer));
        ctx.fire(timer);
        let events = init.handle_timeout(&mut ctx, timer);
        assert_eq!(
            events,
            vec![OpenConnection::Failure {
                target: addr("10.1.0.2:4000", 2),
                stage: PunchStage::OpenConnection,
            }]
        );
        assert!(!init.owns_timer(timer));
    }

    #[test]
    fn test_ping_rearms_timeout() {
        let mut ctx = RecordingContext::new();
        let mut init = initiator();
        init.open_connection(&mut ctx, &target_peer());
        let msg = msg_of(&ctx.take_sent()[0]);
        let first = ctx.last_timer().unwrap();

        let ping = Datagram::new(
            addr("203.0.113.7:6100", 2),
            addr("10.0.0.1:4000", 1),
            Payload::Shp(ShpMessage::Ping { msg }),
        );
        init.handle_datagram(&mut ctx, &ping);

        let second = ctx.last_timer().unwrap();
        assert_ne!(first, second);
        assert!(ctx.cancelled.contains(&first));

        ctx.fire(second);
        let events = init.handle_timeout(&mut ctx, second);
        assert!(matches!(
            events[0],
            OpenConnection::Failure {
                stage: PunchStage::HolePunching,
                ..
            }
        ));
    }

    #[test]
    fn test_late_messages_ignored() {
        let mut ctx = RecordingContext::new();
        let mut init = initiator();
        let ready = Datagram::new(
            addr("203.0.113.7:6100", 2),
            addr("10.0.0.1:4000", 1),
            Payload::Shp(ShpMessage::Ready {
                msg: MsgId(99),
                observed: addr("203.0.113.5:7000", 1),
            }),
        );
        assert!(init.handle_datagram(&mut ctx, &ready).is_empty());
        assert!(init.handle_timeout(&mut ctx, TimerId(12)).is_empty());
    }

    #[test]
    fn test_open_node_relays_for_child() {
        let mut ctx = RecordingContext::new();
        let mut parent = ShpClient::new(
            PeerAddress::new(parent_a(), NatDescriptor::Open),
            ShpConfig::default(),
        );
        parent.register_child(addr("203.0.113.7:6100", 2));

        let relay = Datagram::new(
            addr("203.0.113.5:7000", 1),
            parent_a(),
            Payload::Shp(ShpMessage::Relay {
                session: SessionId(1),
                msg: MsgId(3),
                target: addr("10.1.0.2:4000", 2),
            }),
        );
        parent.handle_datagram(&mut ctx, &relay);
        assert!(matches!(
            ctx.sent[0].payload,
            Payload::Shp(ShpMessage::Initiate { msg: MsgId(3), .. })
        ));
    }

    #[test]
    fn test_cancel_removes_initiator_session() {
        let mut ctx = RecordingContext::new();
        let mut init = initiator();
        init.open_connection(&mut ctx, &target_peer());
        let timer = ctx.last_timer().unwrap();

        init.cancel(&mut ctx, NodeId(7));
        assert_eq!(init.initiator_sessions(), 1);

        init.cancel(&mut ctx, NodeId(2));
        assert_eq!(init.initiator_sessions(), 0);
        assert!(ctx.cancelled.contains(&timer));
        assert!(!init.owns_timer(timer));
        assert!(init.handle_timeout(&mut ctx, timer).is_empty());
    }

    #[test]
    fn test_pong_from_other_node_ignored() {
        let mut ctx = RecordingContext::new();
        let mut tgt = target();
        tgt.handle_datagram(&mut ctx, &initiate_from(parent_a(), MsgId(5)));
        ctx.take_sent();

        let stranger = Datagram::new(
            addr("192.0.2.44:7000", 44),
            addr("10.1.0.2:4000", 2),
            Payload::Shp(ShpMessage::Pong { msg: MsgId(5) }),
        );
        assert!(tgt.handle_datagram(&mut ctx, &stranger).is_empty());
        assert!(ctx.sent.is_empty());
        assert_eq!(tgt.target_sessions(), 1);

        let initiator_pong = Datagram::new(
            addr("203.0.113.5:7000", 1),
            addr("10.1.0.2:4000", 2),
            Payload::Shp(ShpMessage::Pong { msg: MsgId(5) }),
        );
        assert_eq!(tgt.handle_datagram(&mut ctx, &initiator_pong).len(), 1);
        assert_eq!(tgt.target_sessions(), 0);
    }
}
