//! Classification run state machine
//!
//! A [`StunSession`] walks a fixed phase graph:
//!
//! ```text
//! Test1 ──► Test2 ──► Test3 ──► MA/0 ──► MA/1 ──► ... ──► MA/7 ──► Success
//!   │         │  └──────────────► MA/0
//!   └─────────┴──► Success                      (every phase) ──► Fail
//! ```
//!
//! Exactly one echo is in flight at any time and it owns exactly one
//! timeout. A response cancels it; an expiry drives the timeout branch.

use crate::error::StunError;
use crate::policy::{MEASUREMENTS, classify_allocation, determine_mapping_policy};
use nattra_core::{
    Address, Context, Datagram, EchoId, EchoKind, FilteringPolicy, NatBehavior, NatDescriptor,
    Payload, SessionId, StunMessage, TimerId,
};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Classifier phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Basic reachability
    Test1,
    /// Echo from the other server
    Test2,
    /// Echo from the other port
    Test3,
    /// Address measurement probe `0..8`
    MeasureAddress(u8),
    /// Terminal, classification available
    Success,
    /// Terminal, classification failed
    Fail,
}

impl Phase {
    /// True for `Success` and `Fail`
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Fail)
    }

    /// True if `next` is an edge of the phase graph
    #[must_use]
    pub fn may_advance_to(self, next: Phase) -> bool {
        match (self, next) {
            (Self::Test1, Self::Test2 | Self::Success | Self::Fail) => true,
            (Self::Test2, Self::Test3 | Self::MeasureAddress(0) | Self::Success | Self::Fail) => {
                true
            }
            (Self::Test3, Self::MeasureAddress(0) | Self::Fail) => true,
            (Self::MeasureAddress(i), Self::MeasureAddress(j)) => {
                usize::from(j) < MEASUREMENTS && j == i + 1
            }
            (Self::MeasureAddress(i), Self::Success) => usize::from(i) == MEASUREMENTS - 1,
            (Self::MeasureAddress(_), Self::Fail) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Test1 => write!(f, "test1"),
            Self::Test2 => write!(f, "test2"),
            Self::Test3 => write!(f, "test3"),
            Self::MeasureAddress(i) => write!(f, "ma/{i}"),
            Self::Success => write!(f, "success"),
            Self::Fail => write!(f, "fail"),
        }
    }
}

/// The two addresses of one STUN server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerPair {
    /// Address probes are sent to first
    pub primary: Address,
    /// Same IP, other port
    pub secondary: Address,
}

impl ServerPair {
    /// Create a server pair
    #[must_use]
    pub const fn new(primary: Address, secondary: Address) -> Self {
        Self { primary, secondary }
    }
}

/// Result of a successful run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// NAT descriptor, without parents
    pub descriptor: NatDescriptor,
    /// Public IP as seen by the first server, if any response arrived
    pub public_ip: Option<IpAddr>,
}

#[derive(Debug, Clone, Copy)]
struct PendingEcho {
    id: EchoId,
    kind: EchoKind,
    timer: TimerId,
}

/// One classification run
#[derive(Debug)]
pub struct StunSession {
    id: SessionId,
    local: [Address; 2],
    servers: [ServerPair; 2],
    echo_timeout: Duration,
    phase: Phase,
    trail: Vec<Phase>,
    observed: [Option<SocketAddr>; MEASUREMENTS],
    filtering: Option<FilteringPolicy>,
    pending: Option<PendingEcho>,
}

impl StunSession {
    /// Create a run from a local address pair and two servers
    #[must_use]
    pub fn new(
        id: SessionId,
        local: [Address; 2],
        servers: [ServerPair; 2],
        echo_timeout: Duration,
    ) -> Self {
        Self {
            id,
            local,
            servers,
            echo_timeout,
            phase: Phase::Test1,
            trail: vec![Phase::Test1],
            observed: [None; MEASUREMENTS],
            filtering: None,
            pending: None,
        }
    }

    /// Run id
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Every phase entered so far, in order
    #[must_use]
    pub fn trail(&self) -> &[Phase] {
        &self.trail
    }

    /// Timer of the in-flight echo
    #[must_use]
    pub fn pending_timer(&self) -> Option<TimerId> {
        self.pending.map(|p| p.timer)
    }

    /// Send the first probe
    pub fn start(&mut self, ctx: &mut dyn Context) {
        tracing::debug!("STUN session {} starting", self.id);
        self.send_probe(ctx);
    }

    /// Handle an echo response; returns the outcome once terminal
    pub fn handle_response(
        &mut self,
        ctx: &mut dyn Context,
        echo: EchoId,
        observed: Option<SocketAddr>,
    ) -> Option<Result<Classification, StunError>> {
        let pending = self.take_pending(ctx, echo)?;
        tracing::trace!(
            "STUN session {} {} response during {}: {:?}",
            self.id,
            pending.kind,
            self.phase,
            observed
        );

        let Some(observed) = observed else {
            let phase = self.phase;
            return Some(self.fail(StunError::MissingObservedAddress(phase)));
        };

        match self.phase {
            Phase::Test1 => {
                self.observed[0] = Some(observed);
                self.advance(ctx, Phase::Test2)
            }
            Phase::Test2 => {
                if observed.ip() == self.local[0].ip() {
                    self.succeed(NatDescriptor::Open, Some(observed.ip()))
                } else {
                    self.filtering = Some(FilteringPolicy::EndpointIndependent);
                    self.advance(ctx, Phase::MeasureAddress(0))
                }
            }
            Phase::Test3 => {
                self.filtering = Some(FilteringPolicy::HostDependent);
                self.advance(ctx, Phase::MeasureAddress(0))
            }
            Phase::MeasureAddress(i) => {
                self.observed[usize::from(i)] = Some(observed);
                if usize::from(i) + 1 < MEASUREMENTS {
                    self.advance(ctx, Phase::MeasureAddress(i + 1))
                } else {
                    let descriptor = self.classify();
                    let public_ip = self.public_ip();
                    self.succeed(descriptor, public_ip)
                }
            }
            Phase::Success | Phase::Fail => None,
        }
    }

    /// Handle an `Echo.Reset`; the run fails
    pub fn handle_reset(
        &mut self,
        ctx: &mut dyn Context,
        echo: EchoId,
    ) -> Option<Result<Classification, StunError>> {
        let pending = self.take_pending(ctx, echo)?;
        let phase = self.phase;
        tracing::warn!(
            "STUN session {} got reset for {} during {}",
            self.id,
            pending.kind,
            phase
        );
        Some(self.fail(StunError::ServerReset {
            phase,
            kind: pending.kind,
        }))
    }

    /// Handle the expiry of the in-flight echo timer
    pub fn handle_timeout(
        &mut self,
        ctx: &mut dyn Context,
        timer: TimerId,
    ) -> Option<Result<Classification, StunError>> {
        if self.pending_timer() != Some(timer) {
            tracing::debug!("STUN session {} ignoring stale {}", self.id, timer);
            return None;
        }
        self.pending = None;
        tracing::debug!("STUN session {} echo timeout during {}", self.id, self.phase);

        match self.phase {
            Phase::Test1 => self.succeed(NatDescriptor::UdpBlocked, None),
            Phase::Test2 => {
                let local_ip = self.local[0].ip();
                if self.observed[0].is_some_and(|a| a.ip() == local_ip) {
                    let public_ip = self.public_ip();
                    self.succeed(NatDescriptor::Firewalled, public_ip)
                } else {
                    self.advance(ctx, Phase::Test3)
                }
            }
            Phase::Test3 => {
                self.filtering = Some(FilteringPolicy::PortDependent);
                self.advance(ctx, Phase::MeasureAddress(0))
            }
            Phase::MeasureAddress(i) => Some(self.fail(StunError::MappingAllocationTimeout(i))),
            Phase::Success | Phase::Fail => None,
        }
    }

    /// Cancel the in-flight echo, if any
    pub fn cancel(&mut self, ctx: &mut dyn Context) {
        if let Some(pending) = self.pending.take() {
            ctx.cancel(pending.timer);
        }
    }

    fn take_pending(&mut self, ctx: &mut dyn Context, echo: EchoId) -> Option<PendingEcho> {
        match self.pending {
            Some(pending) if pending.id == echo => {
                ctx.cancel(pending.timer);
                self.pending = None;
                Some(pending)
            }
            _ => {
                tracing::debug!("STUN session {} ignoring late echo {}", self.id, echo);
                None
            }
        }
    }

    fn transition(&mut self, next: Phase) {
        assert!(
            self.phase.may_advance_to(next),
            "invalid STUN phase transition {} -> {}",
            self.phase,
            next
        );
        self.phase = next;
        self.trail.push(next);
    }

    fn advance(
        &mut self,
        ctx: &mut dyn Context,
        next: Phase,
    ) -> Option<Result<Classification, StunError>> {
        self.transition(next);
        self.send_probe(ctx);
        None
    }

    fn succeed(
        &mut self,
        descriptor: NatDescriptor,
        public_ip: Option<IpAddr>,
    ) -> Option<Result<Classification, StunError>> {
        self.transition(Phase::Success);
        Some(Ok(Classification {
            descriptor,
            public_ip,
        }))
    }

    fn fail(&mut self, err: StunError) -> Result<Classification, StunError> {
        self.transition(Phase::Fail);
        Err(err)
    }

    fn public_ip(&self) -> Option<IpAddr> {
        self.observed[0].map(|a| a.ip())
    }

    fn classify(&self) -> NatDescriptor {
        let filtering = self
            .filtering
            .expect("filtering policy is decided before address measurement");

        let mut observed = [SocketAddr::from(([0, 0, 0, 0], 0)); MEASUREMENTS];
        for (slot, value) in observed.iter_mut().zip(self.observed.iter()) {
            *slot = value.expect("every address measurement slot is filled before classifying");
        }

        let mapping =
            determine_mapping_policy(&[observed[0], observed[1], observed[2], observed[3]]);
        let allocation = classify_allocation(
            [self.local[0].port(), self.local[1].port()],
            &observed,
            mapping,
        );

        NatDescriptor::Nated(NatBehavior::new(mapping, allocation, filtering))
    }

    fn probe(&self) -> (Address, Address, EchoKind, Option<Address>) {
        let a = self.servers[0];
        match self.phase {
            Phase::Test1 => (self.local[0], a.primary, EchoKind::SipSp, None),
            Phase::Test2 => (self.local[0], a.primary, EchoKind::DipDp, Some(self.local[0])),
            Phase::Test3 => (self.local[0], a.primary, EchoKind::SipDp, None),
            Phase::MeasureAddress(i) => {
                let i = usize::from(i);
                let b = self.servers[1];
                let targets = [a.primary, a.secondary, b.primary, b.secondary];
                (self.local[i / 4], targets[i % 4], EchoKind::SipSp, None)
            }
            Phase::Success | Phase::Fail => {
                unreachable!("no probe is sent from a terminal phase")
            }
        }
    }

    fn send_probe(&mut self, ctx: &mut dyn Context) {
        let (src, dst, kind, target) = self.probe();
        let id = EchoId::random();
        let request = StunMessage::EchoRequest {
            id,
            session: self.id,
            kind,
            target,
        };
        ctx.send(Datagram::new(src, dst, Payload::Stun(request)));
        let timer = ctx.schedule_once(self.echo_timeout);
        self.pending = Some(PendingEcho { id, kind, timer });
    }
}
